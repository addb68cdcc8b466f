pub mod linalg;

pub use linalg::*;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
}

/// One 3-axis reading in device-frame units: m/s², rad/s or µT.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SensorSample {
    pub kind: SensorKind,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn new(kind: SensorKind, timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self { kind, timestamp, x, y, z }
    }

    pub fn accel(timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Accelerometer, timestamp, x, y, z)
    }

    pub fn gyro(timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Gyroscope, timestamp, x, y, z)
    }

    pub fn mag(timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self::new(SensorKind::Magnetometer, timestamp, x, y, z)
    }

    pub fn vector(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Raw fix as delivered by the device location provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

/// Smoothed (or raw) self-position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl From<&LocationFix> for SelfFix {
    fn from(fix: &LocationFix) -> Self {
        Self {
            timestamp: fix.timestamp,
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
        }
    }
}

/// Wall-clock seconds since the Unix epoch.
pub fn current_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
