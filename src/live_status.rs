use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use peer_tracker_rs::engine::EngineSnapshot;
use peer_tracker_rs::types::current_timestamp;

#[derive(Serialize, Deserialize, Clone)]
pub struct PeerStatus {
    pub peer_id: String,
    pub name: String,
    pub distance_m: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub accuracy: f64,
    pub age_secs: f64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    // Orientation
    pub heading_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
    pub reliability: f64,
    pub orientation_gain: f64,
    pub orientation_uncertainty_deg: f64,
    // Dead reckoning
    pub step_count: u64,
    pub stride_length: f64,
    pub pdr_offset_x: f64,
    pub pdr_offset_y: f64,
    // Self position
    pub self_lat: Option<f64>,
    pub self_lon: Option<f64>,
    pub self_accuracy: Option<f64>,
    pub location_permission_denied: bool,
    pub last_location_error: Option<String>,
    // Intake health
    pub dropped_samples: u64,
    pub peers: Vec<PeerStatus>,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &EngineSnapshot, uptime_seconds: u64, dropped_samples: u64) -> Self {
        let now = current_timestamp();
        let o = &snapshot.orientation;
        Self {
            timestamp: now,
            uptime_seconds,
            heading_deg: o.heading_deg,
            pitch_deg: o.pitch_deg,
            roll_deg: o.roll_deg,
            reliability: o.reliability,
            orientation_gain: o.gain,
            orientation_uncertainty_deg: o.uncertainty_deg,
            step_count: snapshot.pdr.step_count,
            stride_length: snapshot.pdr.stride_length,
            pdr_offset_x: snapshot.pdr.offset_x,
            pdr_offset_y: snapshot.pdr.offset_y,
            self_lat: snapshot.self_fix.map(|f| f.latitude),
            self_lon: snapshot.self_fix.map(|f| f.longitude),
            self_accuracy: snapshot.self_fix.map(|f| f.accuracy),
            location_permission_denied: snapshot.location_permission_denied,
            last_location_error: snapshot.last_location_error.clone(),
            dropped_samples,
            peers: snapshot
                .peers
                .iter()
                .map(|p| PeerStatus {
                    peer_id: p.peer_id.clone(),
                    name: p.name.clone(),
                    distance_m: p.distance_m,
                    bearing_deg: p.bearing_deg,
                    accuracy: p.accuracy,
                    age_secs: (now - p.last_update).max(0.0),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
