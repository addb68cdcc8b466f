//! Seams to the outside world: where self-position fixes come from and
//! where our own position reports go.

use std::future::Future;
use std::sync::Arc;

use crate::error::{LocationError, TransportError};
use crate::types::LocationFix;

/// Device location service. One call is one bounded request; the caller
/// applies its own timeout.
pub trait LocationProvider: Send + Sync + 'static {
    fn request_fix(&self) -> impl Future<Output = Result<LocationFix, LocationError>> + Send;
}

/// Short-range transport connected to nearby peers.
pub trait PeerTransport: Send + Sync + 'static {
    /// Send `payload` to every connected peer.
    fn broadcast(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<T: LocationProvider> LocationProvider for Arc<T> {
    fn request_fix(&self) -> impl Future<Output = Result<LocationFix, LocationError>> + Send {
        (**self).request_fix()
    }
}

impl<T: PeerTransport> PeerTransport for Arc<T> {
    fn broadcast(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).broadcast(payload)
    }
}
