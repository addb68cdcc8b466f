//! Peer position fusion.
//!
//! One [`PeerState`] per connected peer, keyed by the transport's peer id.
//! Incoming reports go through a short gate before touching state:
//!
//! 1. accuracy worse than the hard ceiling: rejected;
//! 2. accuracy worse than the soft threshold with a prior fix: blended
//!    with the prior, weighted by inverse accuracy;
//! 3. with a prior fix, an implied speed above the plausibility ceiling
//!    is a multipath jump and is rejected;
//! 4. everything else replaces the stored fix.
//!
//! The stored fix is always the raw accepted one. What callers see
//! ([`PeerView`]) is a display position nudged toward a short
//! dead-reckoned extrapolation, plus distance and bearing from our own
//! smoothed position computed at query time.

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::PeerFusionConfig;
use crate::geodesy::{
    angle_difference, bearing, destination, haversine_distance, interpolate_longitude, normalize_degrees,
};
use crate::protocol::LocationMessage;
use crate::types::SelfFix;

/// Elapsed time used when two reports arrive with no measurable gap (s).
const MIN_ELAPSED: f64 = 0.001;
const ACCURACY_EPSILON: f64 = 1e-6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub peer_id: String,
    pub device_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// Signed heading change rate (°/s).
    pub heading_rate: Option<f64>,
    pub last_update: f64,
    pub updates: u64,
}

/// Read-only view handed to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub peer_id: String,
    pub device_id: String,
    pub name: String,
    /// Display position (prediction-blended).
    pub latitude: f64,
    pub longitude: f64,
    /// Last accepted position.
    pub raw_latitude: f64,
    pub raw_longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub distance_m: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub last_update: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RejectReason {
    /// Non-finite or out-of-range fields.
    Malformed,
    AccuracyCeiling { accuracy: f64 },
    ImplausibleSpeed { speed: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PeerUpdate {
    Created,
    Accepted,
    Blended,
    Rejected(RejectReason),
}

pub struct PeerFusion {
    config: PeerFusionConfig,
    peers: HashMap<String, PeerState>,
    self_position: Option<SelfFix>,
}

impl PeerFusion {
    pub fn new(config: PeerFusionConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            self_position: None,
        }
    }

    pub fn set_self_position(&mut self, fix: Option<SelfFix>) {
        self.self_position = fix;
    }

    /// Run one report from `peer_id` through the gate. `received_at` is
    /// our own clock, so elapsed time never depends on the peer's clock.
    pub fn on_peer_message(&mut self, peer_id: &str, msg: &LocationMessage, received_at: f64) -> PeerUpdate {
        if let Err(e) = msg.validate() {
            warn!("Rejecting report from {}: {}", peer_id, e);
            return PeerUpdate::Rejected(RejectReason::Malformed);
        }
        let accuracy = msg.accuracy.unwrap_or(self.config.default_accuracy);

        if accuracy > self.config.accuracy_ceiling {
            warn!(
                "Rejecting report from {}: accuracy {:.1} m exceeds {:.0} m",
                peer_id, accuracy, self.config.accuracy_ceiling
            );
            return PeerUpdate::Rejected(RejectReason::AccuracyCeiling { accuracy });
        }

        let Some(prior) = self.peers.get(peer_id) else {
            let state = PeerState {
                peer_id: peer_id.to_string(),
                device_id: msg.id.clone(),
                name: msg.name.clone(),
                latitude: msg.latitude,
                longitude: msg.longitude,
                accuracy,
                speed: msg.speed,
                heading: msg.heading.map(normalize_degrees),
                heading_rate: None,
                last_update: received_at,
                updates: 1,
            };
            debug!("New peer {} ({})", peer_id, msg.name);
            self.peers.insert(peer_id.to_string(), state);
            return PeerUpdate::Created;
        };

        let real_elapsed = received_at - prior.last_update;
        let elapsed = if real_elapsed > 0.0 { real_elapsed } else { MIN_ELAPSED };

        let (lat, lon, stored_accuracy, outcome) = if accuracy > self.config.accuracy_soft {
            let w_prior = 1.0 / (prior.accuracy + ACCURACY_EPSILON);
            let w_new = 1.0 / (accuracy + ACCURACY_EPSILON);
            let total = w_prior + w_new;
            (
                (prior.latitude * w_prior + msg.latitude * w_new) / total,
                interpolate_longitude(prior.longitude, msg.longitude, w_new / total),
                (prior.accuracy + accuracy) / 2.0,
                PeerUpdate::Blended,
            )
        } else {
            let jump = haversine_distance(prior.latitude, prior.longitude, msg.latitude, msg.longitude);
            let speed = jump / elapsed;
            if speed > self.config.max_plausible_speed {
                warn!(
                    "Rejecting report from {}: {:.0} m in {:.3} s implies {:.1} m/s",
                    peer_id, jump, elapsed, speed
                );
                return PeerUpdate::Rejected(RejectReason::ImplausibleSpeed { speed });
            }
            (msg.latitude, msg.longitude, accuracy, PeerUpdate::Accepted)
        };

        let moved = haversine_distance(prior.latitude, prior.longitude, lat, lon);
        let speed = msg.speed.or_else(|| (real_elapsed > 0.0).then(|| moved / real_elapsed));
        let heading = match msg.heading {
            Some(h) => Some(normalize_degrees(h)),
            None if moved > 0.0 => Some(bearing(prior.latitude, prior.longitude, lat, lon)),
            None => prior.heading,
        };
        let heading_rate = match (prior.heading, heading) {
            (Some(from), Some(to)) if real_elapsed > 0.0 => Some(angle_difference(from, to) / real_elapsed),
            _ => None,
        };

        let updates = prior.updates + 1;
        self.peers.insert(
            peer_id.to_string(),
            PeerState {
                peer_id: peer_id.to_string(),
                device_id: msg.id.clone(),
                name: msg.name.clone(),
                latitude: lat,
                longitude: lon,
                accuracy: stored_accuracy,
                speed,
                heading,
                heading_rate,
                last_update: received_at,
                updates,
            },
        );
        outcome
    }

    pub fn state(&self, peer_id: &str) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    pub fn current(&self, peer_id: &str) -> Option<PeerView> {
        self.peers.get(peer_id).map(|p| self.view(p))
    }

    /// Every tracked peer, ordered by peer id.
    pub fn all(&self) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self.peers.values().map(|p| self.view(p)).collect();
        views.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        views
    }

    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Weight given to the extrapolated position, 0 when not moving.
    fn prediction_weight(&self, peer: &PeerState) -> f64 {
        let c = &self.config;
        let (Some(speed), Some(_)) = (peer.speed, peer.heading) else {
            return 0.0;
        };
        if speed <= c.min_motion_speed {
            return 0.0;
        }

        let mut weight = (speed / c.prediction_speed_scale).min(c.max_prediction_weight);
        if let Some(rate) = peer.heading_rate {
            if rate.abs() > c.max_turn_rate {
                weight *= c.max_turn_rate / rate.abs();
            }
        }
        weight
    }

    fn display_position(&self, peer: &PeerState) -> (f64, f64) {
        let weight = self.prediction_weight(peer);
        match (weight > 0.0, peer.speed, peer.heading) {
            (true, Some(speed), Some(heading)) => {
                let ahead = speed * self.config.prediction_horizon;
                let (p_lat, p_lon) = destination(peer.latitude, peer.longitude, heading, ahead);
                (
                    (1.0 - weight) * peer.latitude + weight * p_lat,
                    interpolate_longitude(peer.longitude, p_lon, weight),
                )
            }
            _ => (peer.latitude, peer.longitude),
        }
    }

    fn view(&self, peer: &PeerState) -> PeerView {
        let (lat, lon) = self.display_position(peer);
        let (distance_m, bearing_deg) = match self.self_position {
            Some(me) => (
                Some(haversine_distance(me.latitude, me.longitude, lat, lon)),
                Some(bearing(me.latitude, me.longitude, lat, lon)),
            ),
            None => (None, None),
        };

        PeerView {
            peer_id: peer.peer_id.clone(),
            device_id: peer.device_id.clone(),
            name: peer.name.clone(),
            latitude: lat,
            longitude: lon,
            raw_latitude: peer.latitude,
            raw_longitude: peer.longitude,
            accuracy: peer.accuracy,
            speed: peer.speed,
            heading: peer.heading,
            distance_m,
            bearing_deg,
            last_update: peer.last_update,
        }
    }
}
