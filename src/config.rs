// config.rs — Tunables for every estimator, loadable from JSON.
//
// Every field has a default, so a config file only needs to name what it
// overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

// ─── Orientation ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Gyro period assumed when consecutive timestamps are unusable.
    pub nominal_gyro_dt: f64,
    /// Gaps longer than this are not integrated as one step.
    pub max_gyro_dt: f64,
    /// Gyro noise density (rad/s) driving the quaternion covariance.
    pub gyro_noise: f64,
    /// An accel or mag direction older than this (s) no longer corrects.
    pub max_reading_age: f64,

    // ── Reliability windows ──
    pub window_size: usize,
    pub gravity: f64,

    // ── Geomagnetic plausibility band (µT) ──
    pub mag_band_low: f64,
    pub mag_band_high: f64,
    pub mag_far_low: f64,
    pub mag_far_high: f64,
    pub mag_marginal_penalty: f64,
    pub mag_far_penalty: f64,

    // ── Magnetic variance tiers (µT²) ──
    pub mag_variance_low: f64,
    pub mag_variance_high: f64,
    pub mag_variance_low_penalty: f64,
    pub mag_variance_high_penalty: f64,

    // ── Acceleration deviation tiers (m/s² away from 1g) ──
    pub accel_dev_low: f64,
    pub accel_dev_high: f64,
    pub accel_dev_low_penalty: f64,
    pub accel_dev_high_penalty: f64,

    // ── Rapid rotation tiers (rad/s) ──
    pub gyro_rate_low: f64,
    pub gyro_rate_high: f64,
    pub gyro_rate_low_penalty: f64,
    pub gyro_rate_high_penalty: f64,

    /// (minimum reliability, beta) pairs, best band first.
    pub gain_bands: [(f64, f64); 4],
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            nominal_gyro_dt: 0.01,
            max_gyro_dt: 1.0,
            gyro_noise: 0.01,
            max_reading_age: 0.5,
            window_size: 20,
            gravity: 9.81,
            mag_band_low: 25.0,
            mag_band_high: 65.0,
            mag_far_low: 15.0,
            mag_far_high: 80.0,
            mag_marginal_penalty: 20.0,
            mag_far_penalty: 40.0,
            mag_variance_low: 10.0,
            mag_variance_high: 50.0,
            mag_variance_low_penalty: 10.0,
            mag_variance_high_penalty: 25.0,
            accel_dev_low: 0.5,
            accel_dev_high: 2.0,
            accel_dev_low_penalty: 10.0,
            accel_dev_high_penalty: 25.0,
            gyro_rate_low: 1.0,
            gyro_rate_high: 3.0,
            gyro_rate_low_penalty: 10.0,
            gyro_rate_high_penalty: 20.0,
            gain_bands: [(80.0, 0.1), (60.0, 0.05), (40.0, 0.02), (0.0, 0.005)],
        }
    }
}

// ─── Pedestrian dead-reckoning ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PdrConfig {
    /// Sample-to-sample change in |a| (m/s²) that marks a step candidate.
    pub step_threshold: f64,
    pub min_step_interval: f64,
    pub max_step_interval: f64,
    pub default_stride: f64,
    pub min_stride: f64,
    pub max_stride: f64,
    pub min_calibration_steps: u32,
    pub calibration_history: usize,
}

impl Default for PdrConfig {
    fn default() -> Self {
        Self {
            step_threshold: 1.5,
            min_step_interval: 0.3,
            max_step_interval: 1.5,
            default_stride: 0.7,
            min_stride: 0.3,
            max_stride: 1.2,
            min_calibration_steps: 3,
            calibration_history: 10,
        }
    }
}

// ─── Self-position smoothing ─────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    pub history: usize,
    pub weight_epsilon: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self { history: 5, weight_epsilon: 1e-6 }
    }
}

// ─── Peer fusion ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerFusionConfig {
    /// Reports worse than this are dropped outright (m).
    pub accuracy_ceiling: f64,
    /// Reports worse than this are blended with the prior instead of replacing it (m).
    pub accuracy_soft: f64,
    /// Accuracy assumed when a message does not carry one (m).
    pub default_accuracy: f64,
    /// Implied speed above which a jump is treated as multipath (m/s).
    pub max_plausible_speed: f64,
    pub min_motion_speed: f64,
    pub prediction_horizon: f64,
    /// Speed at which the prediction weight saturates (m/s).
    pub prediction_speed_scale: f64,
    pub max_prediction_weight: f64,
    /// Turn rate above which the prediction weight is scaled down (°/s).
    pub max_turn_rate: f64,
}

impl Default for PeerFusionConfig {
    fn default() -> Self {
        Self {
            accuracy_ceiling: 100.0,
            accuracy_soft: 30.0,
            default_accuracy: 25.0,
            max_plausible_speed: 67.0,
            min_motion_speed: 0.5,
            prediction_horizon: 3.0,
            prediction_speed_scale: 5.0,
            max_prediction_weight: 0.5,
            max_turn_rate: 30.0,
        }
    }
}

// ─── Periodic self-position refresh ──────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub period_secs: f64,
    pub timeout_secs: f64,
    /// Minimum spacing of snapshot publications driven by sensor samples.
    pub snapshot_interval_secs: f64,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period_secs: 3.0,
            timeout_secs: 7.0,
            snapshot_interval_secs: 0.1,
            command_buffer: 1024,
            event_buffer: 256,
        }
    }
}

// ─── Identity advertised to peers ────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub device_id: String,
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            display_name: "Me".to_string(),
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub orientation: OrientationConfig,
    pub pdr: PdrConfig,
    pub smoother: SmootherConfig,
    pub peers: PeerFusionConfig,
    pub refresh: RefreshConfig,
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orientation.window_size == 0 {
            return Err(ConfigError::Invalid("orientation.window_size must be > 0".into()));
        }
        if self.orientation.max_reading_age <= 0.0 {
            return Err(ConfigError::Invalid("orientation.max_reading_age must be positive".into()));
        }
        if self.pdr.min_stride <= 0.0 || self.pdr.min_stride > self.pdr.max_stride {
            return Err(ConfigError::Invalid("pdr stride bounds are inverted".into()));
        }
        if !(self.pdr.min_stride..=self.pdr.max_stride).contains(&self.pdr.default_stride) {
            return Err(ConfigError::Invalid("pdr.default_stride outside stride bounds".into()));
        }
        if self.pdr.min_step_interval >= self.pdr.max_step_interval {
            return Err(ConfigError::Invalid("pdr step interval window is empty".into()));
        }
        if self.smoother.history == 0 || self.pdr.calibration_history == 0 {
            return Err(ConfigError::Invalid("history sizes must be > 0".into()));
        }
        if self.peers.accuracy_soft > self.peers.accuracy_ceiling {
            return Err(ConfigError::Invalid("peers.accuracy_soft exceeds accuracy_ceiling".into()));
        }
        if self.refresh.period_secs <= 0.0
            || self.refresh.timeout_secs <= 0.0
            || self.refresh.snapshot_interval_secs <= 0.0
        {
            return Err(ConfigError::Invalid("refresh intervals must be positive".into()));
        }
        if self.refresh.command_buffer == 0 || self.refresh.event_buffer == 0 {
            return Err(ConfigError::Invalid("channel buffers must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"peers": {"accuracy_ceiling": 60.0}}"#).unwrap();
        assert_eq!(config.peers.accuracy_ceiling, 60.0);
        assert_eq!(config.peers.accuracy_soft, 30.0);
        assert_eq!(config.smoother.history, 5);
        assert_eq!(config.orientation.window_size, 20);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = EngineConfig::from_json(r#"{"pdr": {"min_stride": 1.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
