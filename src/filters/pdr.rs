//! Pedestrian dead-reckoning: step detection plus a calibrated stride.
//!
//! A step candidate is a jump in accelerometer magnitude between two
//! consecutive samples. Candidates are accepted only inside the gait
//! window after the previous step, and each accepted step advances the
//! local (east, north) offset by one stride along the current heading.

use std::collections::VecDeque;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::PdrConfig;
use crate::types::Vec3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PdrState {
    pub step_count: u64,
    pub stride_length: f64,
    /// Offset east of the start point (m).
    pub offset_x: f64,
    /// Offset north of the start point (m).
    pub offset_y: f64,
    /// Time of the last counted step.
    pub last_step_ts: Option<f64>,
    pub steps_since_calibration: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepEvent {
    pub timestamp: f64,
    pub step_count: u64,
    pub heading_deg: f64,
    pub offset: (f64, f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationOutcome {
    Accepted { measured: f64, stride_length: f64 },
    TooFewSteps { steps: u32 },
    Implausible { measured: f64 },
}

pub struct PedestrianDeadReckoning {
    config: PdrConfig,
    prev_magnitude: Option<f64>,
    // Gait window anchor: the last counted step, or a re-arming candidate
    reference_ts: Option<f64>,
    last_step_ts: Option<f64>,
    step_count: u64,
    steps_since_calibration: u64,
    stride_length: f64,
    stride_history: VecDeque<f64>,
    offset: (f64, f64),
}

impl PedestrianDeadReckoning {
    pub fn new(config: PdrConfig) -> Self {
        Self {
            stride_length: config.default_stride,
            stride_history: VecDeque::with_capacity(config.calibration_history),
            prev_magnitude: None,
            reference_ts: None,
            last_step_ts: None,
            step_count: 0,
            steps_since_calibration: 0,
            offset: (0.0, 0.0),
            config,
        }
    }

    /// Feed one accelerometer sample; `heading_deg` is the orientation
    /// estimate at the instant this sample is processed.
    pub fn on_accel_sample(&mut self, accel: &Vec3, timestamp: f64, heading_deg: f64) -> Option<StepEvent> {
        let magnitude = accel.norm();
        if !magnitude.is_finite() {
            return None;
        }
        let prev = self.prev_magnitude.replace(magnitude)?;

        if (magnitude - prev).abs() <= self.config.step_threshold {
            return None;
        }
        self.on_step_candidate(timestamp, heading_deg)
    }

    /// Apply the gait-timing window to a candidate step.
    pub fn on_step_candidate(&mut self, timestamp: f64, heading_deg: f64) -> Option<StepEvent> {
        if let Some(last) = self.reference_ts {
            let since = timestamp - last;
            if since < self.config.min_step_interval {
                return None;
            }
            if since > self.config.max_step_interval {
                // too slow for gait; start timing a new bout from here
                debug!("step candidate {:.2}s after last step, re-arming", since);
                self.reference_ts = Some(timestamp);
                return None;
            }
        }
        Some(self.register_step(timestamp, heading_deg))
    }

    fn register_step(&mut self, timestamp: f64, heading_deg: f64) -> StepEvent {
        let heading = heading_deg.to_radians();
        self.offset.0 += self.stride_length * heading.sin();
        self.offset.1 += self.stride_length * heading.cos();
        self.step_count += 1;
        self.steps_since_calibration += 1;
        self.reference_ts = Some(timestamp);
        self.last_step_ts = Some(timestamp);

        StepEvent {
            timestamp,
            step_count: self.step_count,
            heading_deg,
            offset: self.offset,
        }
    }

    /// Fold an externally measured distance into the stride estimate.
    pub fn calibrate(&mut self, actual_distance: f64, steps: u32) -> CalibrationOutcome {
        if steps < self.config.min_calibration_steps {
            warn!("stride calibration discarded: only {} steps", steps);
            return CalibrationOutcome::TooFewSteps { steps };
        }

        let measured = actual_distance / steps as f64;
        if !measured.is_finite() || measured < self.config.min_stride || measured > self.config.max_stride {
            warn!(
                "stride calibration discarded: {:.2} m/step outside [{:.1}, {:.1}]",
                measured, self.config.min_stride, self.config.max_stride
            );
            return CalibrationOutcome::Implausible { measured };
        }

        self.stride_history.push_back(measured);
        while self.stride_history.len() > self.config.calibration_history {
            self.stride_history.pop_front();
        }
        self.stride_length = self.stride_history.iter().sum::<f64>() / self.stride_history.len() as f64;
        self.steps_since_calibration = 0;

        debug!("stride calibrated: sample {:.3} m, stride now {:.3} m", measured, self.stride_length);
        CalibrationOutcome::Accepted { measured, stride_length: self.stride_length }
    }

    /// Zero step count and offset. Stride calibration is kept.
    pub fn reset(&mut self) {
        self.step_count = 0;
        self.steps_since_calibration = 0;
        self.offset = (0.0, 0.0);
        self.reference_ts = None;
        self.last_step_ts = None;
        self.prev_magnitude = None;
    }

    pub fn steps_since_calibration(&self) -> u64 {
        self.steps_since_calibration
    }

    pub fn snapshot(&self) -> PdrState {
        PdrState {
            step_count: self.step_count,
            stride_length: self.stride_length,
            offset_x: self.offset.0,
            offset_y: self.offset.1,
            last_step_ts: self.last_step_ts,
            steps_since_calibration: self.steps_since_calibration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pdr() -> PedestrianDeadReckoning {
        PedestrianDeadReckoning::new(PdrConfig::default())
    }

    /// Two samples that straddle the threshold produce one candidate at `t`.
    fn kick(p: &mut PedestrianDeadReckoning, t: f64, heading: f64) -> Option<StepEvent> {
        p.on_accel_sample(&Vec3::new(0.0, 0.0, 9.8), t - 0.01, heading);
        p.on_accel_sample(&Vec3::new(0.0, 0.0, 12.8), t, heading)
    }

    #[test]
    fn test_steps_closer_than_refractory_count_once() {
        let mut p = pdr();
        assert!(kick(&mut p, 1.0, 0.0).is_some());
        assert!(kick(&mut p, 1.2, 0.0).is_none());
        assert_eq!(p.snapshot().step_count, 1);
    }

    #[test]
    fn test_steps_500ms_apart_both_count() {
        let mut p = pdr();
        assert!(p.on_step_candidate(1.0, 0.0).is_some());
        assert!(p.on_step_candidate(1.5, 0.0).is_some());
        assert_eq!(p.snapshot().step_count, 2);
    }

    #[test]
    fn test_slow_candidate_rearms_without_counting() {
        let mut p = pdr();
        p.on_step_candidate(1.0, 0.0);
        assert!(p.on_step_candidate(3.0, 0.0).is_none());
        // the re-arming candidate is not reported as a step
        assert_eq!(p.snapshot().last_step_ts, Some(1.0));
        assert!(p.on_step_candidate(3.6, 0.0).is_some());
        assert_eq!(p.snapshot().step_count, 2);
        assert_eq!(p.snapshot().last_step_ts, Some(3.6));
    }

    #[test]
    fn test_small_changes_are_not_steps() {
        let mut p = pdr();
        for i in 0..100 {
            let z = 9.8 + if i % 2 == 0 { 0.5 } else { -0.5 };
            assert!(p.on_accel_sample(&Vec3::new(0.0, 0.0, z), i as f64 * 0.01, 0.0).is_none());
        }
        assert_eq!(p.snapshot().step_count, 0);
    }

    #[test]
    fn test_displacement_follows_heading() {
        let mut p = pdr();
        p.on_step_candidate(0.0, 90.0);
        p.on_step_candidate(0.5, 90.0);
        p.on_step_candidate(1.0, 0.0);
        let s = p.snapshot();
        assert_abs_diff_eq!(s.offset_x, 1.4, epsilon = 1e-9);
        assert_abs_diff_eq!(s.offset_y, 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_calibration_accepts_plausible_stride() {
        let mut p = pdr();
        match p.calibrate(2.1, 3) {
            CalibrationOutcome::Accepted { measured, stride_length } => {
                assert_abs_diff_eq!(measured, 0.7, epsilon = 1e-12);
                assert_abs_diff_eq!(stride_length, 0.7, epsilon = 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
        p.calibrate(2.4, 3);
        assert_abs_diff_eq!(p.snapshot().stride_length, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_calibration_discards_implausible_stride() {
        let mut p = pdr();
        let outcome = p.calibrate(10.0, 3);
        assert!(matches!(outcome, CalibrationOutcome::Implausible { measured } if (measured - 3.333).abs() < 1e-3));
        assert_eq!(p.snapshot().stride_length, 0.7);
    }

    #[test]
    fn test_calibration_needs_three_steps() {
        let mut p = pdr();
        assert_eq!(p.calibrate(1.4, 2), CalibrationOutcome::TooFewSteps { steps: 2 });
        assert_eq!(p.snapshot().stride_length, 0.7);
    }

    #[test]
    fn test_calibration_history_is_bounded() {
        let mut p = pdr();
        p.calibrate(3.3, 3); // 1.1
        for _ in 0..10 {
            p.calibrate(1.5, 3); // 0.5
        }
        assert_abs_diff_eq!(p.snapshot().stride_length, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_reset_keeps_stride() {
        let mut p = pdr();
        p.calibrate(2.7, 3);
        p.on_step_candidate(0.0, 45.0);
        p.reset();
        let s = p.snapshot();
        assert_eq!(s.step_count, 0);
        assert_eq!((s.offset_x, s.offset_y), (0.0, 0.0));
        assert_abs_diff_eq!(s.stride_length, 0.9, epsilon = 1e-12);
    }
}
