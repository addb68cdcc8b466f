// engine.rs — Synchronous core of the peer tracker
//
// Owns the orientation estimator, PDR, self-position smoother and peer table.
// Nothing here knows about tokio, transports or location services: inputs are
// plain values, every operation returns the change events it caused, and the
// current state is read back through `snapshot()`. The async runtime in
// `service.rs` is one driver of this; tests and replays are others.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::LocationError;
use crate::filters::{
    CalibrationOutcome, OrientationEstimator, OrientationState, PdrState, PedestrianDeadReckoning, StepEvent,
};
use crate::peers::{PeerFusion, PeerUpdate, PeerView, RejectReason};
use crate::protocol::{self, LocationMessage};
use crate::smoothing::SelfPositionSmoother;
use crate::types::{LocationFix, SelfFix, SensorKind, SensorSample};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    StepDetected(StepEvent),
    StrideCalibrated(CalibrationOutcome),
    PdrReset,
    SelfPositionUpdated(SelfFix),
    LocationFailed { error: LocationError },
    /// Location permission was denied; no fixes until the user acts.
    CapabilityLost,
    PeerUpdated { peer: PeerView, update: PeerUpdate },
    PeerRejected { peer_id: String, reason: RejectReason },
    PeerRemoved { peer_id: String },
    PeersCleared,
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub orientation: OrientationState,
    pub pdr: PdrState,
    pub self_fix: Option<SelfFix>,
    pub peers: Vec<PeerView>,
    pub location_permission_denied: bool,
    pub last_location_error: Option<String>,
}

// ─── The engine ──────────────────────────────────────────────────────────────

pub struct Engine {
    config: EngineConfig,
    orientation: OrientationEstimator,
    pdr: PedestrianDeadReckoning,
    smoother: SelfPositionSmoother,
    peers: PeerFusion,

    location_permission_denied: bool,
    last_location_error: Option<LocationError>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            orientation: OrientationEstimator::new(config.orientation.clone()),
            pdr: PedestrianDeadReckoning::new(config.pdr.clone()),
            smoother: SelfPositionSmoother::new(config.smoother.clone()),
            peers: PeerFusion::new(config.peers.clone()),
            location_permission_denied: false,
            last_location_error: None,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Any sensor stream. Accelerometer samples also drive step detection,
    /// using the heading as it stands when the sample is processed.
    pub fn ingest_sensor(&mut self, sample: &SensorSample) -> Vec<EngineEvent> {
        self.orientation.ingest(sample);

        if sample.kind != SensorKind::Accelerometer {
            return Vec::new();
        }
        let heading = self.orientation.heading();
        match self.pdr.on_accel_sample(&sample.vector(), sample.timestamp, heading) {
            Some(step) => {
                debug!("Step {} at heading {:.1}°", step.step_count, step.heading_deg);
                vec![EngineEvent::StepDetected(step)]
            }
            None => Vec::new(),
        }
    }

    pub fn on_location_fix(&mut self, fix: &LocationFix) -> Vec<EngineEvent> {
        if !self.smoother.on_fix(fix) {
            return Vec::new();
        }
        self.location_permission_denied = false;
        self.last_location_error = None;

        let Some(smoothed) = self.smoother.current() else {
            return Vec::new();
        };
        self.peers.set_self_position(Some(smoothed));
        vec![EngineEvent::SelfPositionUpdated(smoothed)]
    }

    /// The previous self-position is kept as is.
    pub fn on_location_error(&mut self, error: LocationError) -> Vec<EngineEvent> {
        warn!("Location request failed: {}", error);
        let mut events = Vec::new();

        if error.is_capability_loss() && !self.location_permission_denied {
            self.location_permission_denied = true;
            events.push(EngineEvent::CapabilityLost);
        }
        self.last_location_error = Some(error.clone());
        events.push(EngineEvent::LocationFailed { error });
        events
    }

    /// Raw bytes from the transport. Undecodable payloads are dropped.
    pub fn on_peer_payload(&mut self, peer_id: &str, payload: &[u8], received_at: f64) -> Vec<EngineEvent> {
        let msg = match protocol::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping payload from {}: {}", peer_id, e);
                return Vec::new();
            }
        };
        self.on_peer_message(peer_id, &msg, received_at)
    }

    pub fn on_peer_message(&mut self, peer_id: &str, msg: &LocationMessage, received_at: f64) -> Vec<EngineEvent> {
        match self.peers.on_peer_message(peer_id, msg, received_at) {
            PeerUpdate::Rejected(reason) => vec![EngineEvent::PeerRejected { peer_id: peer_id.to_string(), reason }],
            update => match self.peers.current(peer_id) {
                Some(peer) => vec![EngineEvent::PeerUpdated { peer, update }],
                None => Vec::new(),
            },
        }
    }

    pub fn on_peer_disconnected(&mut self, peer_id: &str) -> Vec<EngineEvent> {
        if self.peers.remove(peer_id) {
            info!("Peer {} disconnected", peer_id);
            vec![EngineEvent::PeerRemoved { peer_id: peer_id.to_string() }]
        } else {
            Vec::new()
        }
    }

    /// Forget every peer and the self-position fix history. The next fix
    /// starts a fresh smoothing window.
    pub fn disconnect_all(&mut self) -> Vec<EngineEvent> {
        info!("Disconnecting {} peers, dropping {} buffered fixes", self.peers.len(), self.smoother.len());
        self.peers.clear();
        self.smoother.clear();
        self.peers.set_self_position(None);
        vec![EngineEvent::PeersCleared]
    }

    pub fn calibrate(&mut self, actual_distance: f64, steps: u32) -> Vec<EngineEvent> {
        vec![EngineEvent::StrideCalibrated(self.pdr.calibrate(actual_distance, steps))]
    }

    /// Calibrate against the steps counted since the last accepted calibration.
    pub fn calibrate_since_last(&mut self, actual_distance: f64) -> Vec<EngineEvent> {
        let steps = u32::try_from(self.pdr.steps_since_calibration()).unwrap_or(u32::MAX);
        self.calibrate(actual_distance, steps)
    }

    pub fn reset_pdr(&mut self) -> Vec<EngineEvent> {
        self.pdr.reset();
        vec![EngineEvent::PdrReset]
    }

    pub fn self_fix(&self) -> Option<SelfFix> {
        self.smoother.current()
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerView> {
        self.peers.current(peer_id)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            orientation: self.orientation.current(),
            pdr: self.pdr.snapshot(),
            self_fix: self.smoother.current(),
            peers: self.peers.all(),
            location_permission_denied: self.location_permission_denied,
            last_location_error: self.last_location_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Our own position report, once there is a position to report.
    pub fn outbound_payload(&self) -> Option<Vec<u8>> {
        let fix = self.smoother.current()?;
        let identity = &self.config.identity;
        let msg = LocationMessage::from_self_fix(&identity.device_id, &identity.display_name, &fix);
        match protocol::encode(&msg) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode outbound report: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    fn fix(t: f64, lat: f64, lon: f64, accuracy: f64) -> LocationFix {
        LocationFix { timestamp: t, latitude: lat, longitude: lon, accuracy, speed: None, heading: None }
    }

    fn payload(lat: f64, lon: f64, accuracy: f64) -> Vec<u8> {
        format!(
            r#"{{"type":"location","id":"dev-9","name":"Bo","latitude":{lat},"longitude":{lon},"accuracy":{accuracy}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn test_accel_spikes_become_steps() {
        let mut e = engine();
        let mut steps = 0;
        for i in 0..100 {
            let t = i as f64 * 0.05;
            // a 3 m/s² bump every 10th sample, 0.5 s apart
            let z = if i % 10 == 0 { 12.8 } else { 9.8 };
            let events = e.ingest_sensor(&SensorSample::accel(t, 0.0, 0.0, z));
            steps += events.iter().filter(|ev| matches!(ev, EngineEvent::StepDetected(_))).count();
        }
        assert_eq!(steps as u64, e.snapshot().pdr.step_count);
        assert!(steps >= 9);
        // identity attitude faces north
        let pdr = e.snapshot().pdr;
        assert_abs_diff_eq!(pdr.offset_x, 0.0, epsilon = 1e-9);
        assert!(pdr.offset_y > 0.0);
    }

    #[test]
    fn test_fix_updates_self_position_and_outbound() {
        let mut e = engine();
        assert!(e.outbound_payload().is_none());

        let events = e.on_location_fix(&fix(100.0, 35.0, 139.0, 8.0));
        assert!(matches!(events.as_slice(), [EngineEvent::SelfPositionUpdated(_)]));

        let msg = protocol::decode(&e.outbound_payload().unwrap()).unwrap();
        assert_eq!(msg.id, "local");
        assert_eq!(msg.name, "Me");
        assert_eq!(msg.latitude, 35.0);
        assert_eq!(msg.accuracy, Some(8.0));
        assert_eq!(msg.timestamp, Some(100_000));
    }

    #[test]
    fn test_invalid_fix_emits_nothing() {
        let mut e = engine();
        assert!(e.on_location_fix(&fix(1.0, 200.0, 0.0, 5.0)).is_empty());
        assert!(e.self_fix().is_none());
    }

    #[test]
    fn test_peer_payload_reports_distance() {
        let mut e = engine();
        e.on_location_fix(&fix(0.0, 35.0, 139.0, 5.0));
        let events = e.on_peer_payload("p1", &payload(35.001, 139.0, 5.0), 10.0);

        match events.as_slice() {
            [EngineEvent::PeerUpdated { peer, update: PeerUpdate::Created }] => {
                assert_eq!(peer.device_id, "dev-9");
                assert_abs_diff_eq!(peer.distance_m.unwrap(), 111.2, epsilon = 0.5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let mut e = engine();
        assert!(e.on_peer_payload("p1", b"{oops", 0.0).is_empty());
        assert!(e.on_peer_payload("p1", br#"{"type":"location","id":"x"}"#, 0.0).is_empty());
        assert!(e.snapshot().peers.is_empty());
    }

    #[test]
    fn test_peer_jump_reported_as_rejection() {
        let mut e = engine();
        e.on_peer_payload("p1", &payload(35.000, 139.0, 10.0), 0.0);
        let events = e.on_peer_payload("p1", &payload(35.010, 139.0, 10.0), 1.0);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::PeerRejected { reason: RejectReason::ImplausibleSpeed { .. }, .. }]
        ));
        assert_eq!(e.peer("p1").unwrap().raw_latitude, 35.000);
    }

    #[test]
    fn test_timeout_keeps_previous_fix() {
        let mut e = engine();
        e.on_location_fix(&fix(0.0, 35.0, 139.0, 5.0));
        let events = e.on_location_error(LocationError::Timeout(7.0));
        assert!(matches!(events.as_slice(), [EngineEvent::LocationFailed { .. }]));

        let snap = e.snapshot();
        assert_eq!(snap.self_fix.unwrap().latitude, 35.0);
        assert!(!snap.location_permission_denied);
        assert_eq!(snap.last_location_error.as_deref(), Some("Location request timed out after 7.0s"));
    }

    #[test]
    fn test_permission_denial_surfaces_once() {
        let mut e = engine();
        let first = e.on_location_error(LocationError::PermissionDenied);
        assert!(first.contains(&EngineEvent::CapabilityLost));
        let second = e.on_location_error(LocationError::PermissionDenied);
        assert!(!second.contains(&EngineEvent::CapabilityLost));
        assert!(e.snapshot().location_permission_denied);

        e.on_location_fix(&fix(0.0, 35.0, 139.0, 5.0));
        let snap = e.snapshot();
        assert!(!snap.location_permission_denied);
        assert!(snap.last_location_error.is_none());
    }

    #[test]
    fn test_disconnects() {
        let mut e = engine();
        e.on_location_fix(&fix(0.0, 35.0, 139.0, 5.0));
        e.on_peer_payload("p1", &payload(35.0, 139.0, 5.0), 0.0);
        e.on_peer_payload("p2", &payload(35.1, 139.0, 5.0), 0.0);

        assert_eq!(e.on_peer_disconnected("p1"), vec![EngineEvent::PeerRemoved { peer_id: "p1".into() }]);
        assert!(e.on_peer_disconnected("p1").is_empty());
        assert_eq!(e.snapshot().peers.len(), 1);

        assert_eq!(e.disconnect_all(), vec![EngineEvent::PeersCleared]);
        let snap = e.snapshot();
        assert!(snap.peers.is_empty());
        assert!(snap.self_fix.is_none());
        assert!(e.outbound_payload().is_none());

        // smoothing restarts from the next fix alone
        e.on_location_fix(&fix(1.0, 36.0, 140.0, 20.0));
        let me = e.self_fix().unwrap();
        assert_eq!((me.latitude, me.longitude, me.accuracy), (36.0, 140.0, 20.0));
    }

    #[test]
    fn test_calibrate_since_last_uses_counted_steps() {
        let mut e = engine();
        for i in 0..4 {
            let t = i as f64 * 0.5;
            e.ingest_sensor(&SensorSample::accel(t, 0.0, 0.0, 9.8));
            e.ingest_sensor(&SensorSample::accel(t + 0.01, 0.0, 0.0, 12.8));
        }
        assert_eq!(e.snapshot().pdr.steps_since_calibration, 4);

        let events = e.calibrate_since_last(3.2);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::StrideCalibrated(CalibrationOutcome::Accepted { .. })]
        ));
        let pdr = e.snapshot().pdr;
        assert_abs_diff_eq!(pdr.stride_length, 0.8, epsilon = 1e-12);
        assert_eq!(pdr.steps_since_calibration, 0);

        e.reset_pdr();
        assert_eq!(e.snapshot().pdr.step_count, 0);
    }
}
