//! Peer broadcast payloads.
//!
//! Peers exchange UTF-8 JSON objects tagged with `"type"`. Only the
//! `"location"` message exists today:
//!
//! ```json
//! {"type":"location","id":"a1","name":"Ann","latitude":35.68,"longitude":139.76,
//!  "accuracy":8.0,"speed":1.2,"heading":270.0,"timestamp":1700000000000}
//! ```
//!
//! `timestamp` is Unix epoch milliseconds.

use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::geodesy::valid_coordinate;
use crate::types::SelfFix;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Location(LocationMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationMessage {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl LocationMessage {
    /// Build the outbound report for our own smoothed position.
    pub fn from_self_fix(id: &str, name: &str, fix: &SelfFix) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: Some(fix.accuracy),
            speed: None,
            heading: None,
            timestamp: Some((fix.timestamp * 1000.0).round() as i64),
        }
    }

    /// Sender timestamp in seconds, if one was sent.
    pub fn timestamp_secs(&self) -> Option<f64> {
        self.timestamp.map(|ms| ms as f64 / 1000.0)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if !valid_coordinate(self.latitude, self.longitude) {
            return Err(MessageError::InvalidCoordinate { lat: self.latitude, lon: self.longitude });
        }
        check_non_negative("accuracy", self.accuracy)?;
        check_non_negative("speed", self.speed)?;
        if let Some(h) = self.heading {
            if !h.is_finite() {
                return Err(MessageError::InvalidField { field: "heading", value: h });
            }
        }
        Ok(())
    }
}

fn check_non_negative(field: &'static str, value: Option<f64>) -> Result<(), MessageError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(MessageError::InvalidField { field, value: v }),
        _ => Ok(()),
    }
}

/// Parse and validate a payload received from a peer.
pub fn decode(payload: &[u8]) -> Result<LocationMessage, MessageError> {
    let PeerMessage::Location(msg) = serde_json::from_slice(payload)?;
    msg.validate()?;
    Ok(msg)
}

pub fn encode(msg: &LocationMessage) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(&PeerMessage::Location(msg.clone()))?)
}
