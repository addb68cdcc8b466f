//! Orientation, step counting and peer-relative positioning from noisy
//! device sensors and untrusted peer broadcasts.
//!
//! [`engine::Engine`] is the synchronous core; [`service::EngineService`]
//! runs it as a tokio task fed by sensor producers, a location provider and
//! a peer transport.

pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod geodesy;
pub mod peers;
pub mod protocol;
pub mod providers;
pub mod service;
pub mod smoothing;
pub mod types;

pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, EngineSnapshot};
pub use error::{ConfigError, EngineError, LocationError, MessageError, TransportError};
pub use service::{EngineHandle, EngineService, SensorSink};
