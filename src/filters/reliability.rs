//! Sensor reliability scoring for the orientation filter.
//!
//! Keeps short rolling windows over the magnetic field magnitude and the
//! accelerometer's deviation from 1g, plus the latest gyro rate, and turns
//! them into a 0–100 confidence score. The score selects how hard the
//! filter leans on the accel/mag correction versus pure gyro integration.

use std::collections::VecDeque;

use crate::config::OrientationConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReliabilityBreakdown {
    pub mag_band: f64,
    pub mag_variance: f64,
    pub accel_deviation: f64,
    pub rotation: f64,
}

impl ReliabilityBreakdown {
    pub fn total(&self) -> f64 {
        self.mag_band + self.mag_variance + self.accel_deviation + self.rotation
    }
}

pub struct ReliabilityMonitor {
    config: OrientationConfig,
    mag_magnitudes: VecDeque<f64>,
    accel_deviations: VecDeque<f64>,
    gyro_rate: f64,
}

impl ReliabilityMonitor {
    pub fn new(config: OrientationConfig) -> Self {
        let window = config.window_size;
        Self {
            config,
            mag_magnitudes: VecDeque::with_capacity(window),
            accel_deviations: VecDeque::with_capacity(window),
            gyro_rate: 0.0,
        }
    }

    pub fn record_mag(&mut self, magnitude: f64) {
        push_bounded(&mut self.mag_magnitudes, magnitude, self.config.window_size);
    }

    pub fn record_accel(&mut self, magnitude: f64) {
        let deviation = (magnitude - self.config.gravity).abs();
        push_bounded(&mut self.accel_deviations, deviation, self.config.window_size);
    }

    pub fn record_gyro(&mut self, rate: f64) {
        self.gyro_rate = rate;
    }

    pub fn penalties(&self) -> ReliabilityBreakdown {
        let c = &self.config;
        let mut out = ReliabilityBreakdown::default();

        if let Some((avg, var)) = mean_and_variance(&self.mag_magnitudes) {
            if avg < c.mag_far_low || avg > c.mag_far_high {
                out.mag_band = c.mag_far_penalty;
            } else if avg < c.mag_band_low || avg > c.mag_band_high {
                out.mag_band = c.mag_marginal_penalty;
            }

            out.mag_variance = tiered(var, c.mag_variance_low, c.mag_variance_high,
                c.mag_variance_low_penalty, c.mag_variance_high_penalty);
        }

        if let Some((avg, _)) = mean_and_variance(&self.accel_deviations) {
            out.accel_deviation = tiered(avg, c.accel_dev_low, c.accel_dev_high,
                c.accel_dev_low_penalty, c.accel_dev_high_penalty);
        }

        out.rotation = tiered(self.gyro_rate, c.gyro_rate_low, c.gyro_rate_high,
            c.gyro_rate_low_penalty, c.gyro_rate_high_penalty);

        out
    }

    /// Confidence in [0, 100].
    pub fn score(&self) -> f64 {
        let score = 100.0 - self.penalties().total();
        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 100.0)
    }

    /// Correction gain for the current score.
    pub fn gain(&self) -> f64 {
        gain_for_score(&self.config.gain_bands, self.score())
    }

    pub fn clear(&mut self) {
        self.mag_magnitudes.clear();
        self.accel_deviations.clear();
        self.gyro_rate = 0.0;
    }
}

pub fn gain_for_score(bands: &[(f64, f64); 4], score: f64) -> f64 {
    bands
        .iter()
        .find(|(min_score, _)| score >= *min_score)
        .map(|(_, beta)| *beta)
        .unwrap_or(bands[3].1)
}

fn tiered(value: f64, low: f64, high: f64, low_penalty: f64, high_penalty: f64) -> f64 {
    if value > high {
        high_penalty
    } else if value > low {
        low_penalty
    } else {
        0.0
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    if !value.is_finite() {
        return;
    }
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

fn mean_and_variance(window: &VecDeque<f64>) -> Option<(f64, f64)> {
    if window.is_empty() {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some((mean, var))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ReliabilityMonitor {
        ReliabilityMonitor::new(OrientationConfig::default())
    }

    #[test]
    fn test_clean_signals_score_full() {
        let mut m = monitor();
        for _ in 0..20 {
            m.record_mag(45.0);
            m.record_accel(9.81);
        }
        m.record_gyro(0.1);
        assert_eq!(m.score(), 100.0);
        assert_eq!(m.gain(), 0.1);
    }

    #[test]
    fn test_empty_windows_do_not_penalize() {
        assert_eq!(monitor().score(), 100.0);
    }

    #[test]
    fn test_marginal_vs_far_magnetic_band() {
        let mut m = monitor();
        for _ in 0..20 {
            m.record_mag(20.0);
        }
        assert_eq!(m.penalties().mag_band, 20.0);

        let mut m = monitor();
        for _ in 0..20 {
            m.record_mag(120.0);
        }
        assert_eq!(m.penalties().mag_band, 40.0);
    }

    #[test]
    fn test_magnetic_variance_tiers() {
        let mut m = monitor();
        // alternating 40/50 → variance 25
        for i in 0..20 {
            m.record_mag(if i % 2 == 0 { 40.0 } else { 50.0 });
        }
        assert_eq!(m.penalties().mag_variance, 10.0);

        let mut m = monitor();
        // alternating 30/60 → variance 225
        for i in 0..20 {
            m.record_mag(if i % 2 == 0 { 30.0 } else { 60.0 });
        }
        assert_eq!(m.penalties().mag_variance, 25.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut m = monitor();
        for _ in 0..20 {
            m.record_mag(200.0);
        }
        for _ in 0..20 {
            m.record_mag(45.0);
        }
        // old disturbance has fully left the window
        assert_eq!(m.penalties().mag_band, 0.0);
        assert_eq!(m.penalties().mag_variance, 0.0);
    }

    #[test]
    fn test_worst_case_is_clamped_and_lowest_gain() {
        let mut m = monitor();
        for i in 0..20 {
            m.record_mag(if i % 2 == 0 { 0.0 } else { 300.0 });
            m.record_accel(30.0);
        }
        m.record_gyro(10.0);
        assert_eq!(m.score(), 0.0);
        assert_eq!(m.gain(), 0.005);
    }

    #[test]
    fn test_score_always_in_range() {
        let mut m = monitor();
        let mut seed = 7u64;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let r = (seed >> 33) as f64 / (1u64 << 31) as f64;
            m.record_mag(r * 150.0);
            m.record_accel(r * 25.0);
            m.record_gyro(r * 6.0);
            let s = m.score();
            assert!((0.0..=100.0).contains(&s));
        }
    }

    #[test]
    fn test_gain_bands() {
        let bands = OrientationConfig::default().gain_bands;
        assert_eq!(gain_for_score(&bands, 100.0), 0.1);
        assert_eq!(gain_for_score(&bands, 75.0), 0.05);
        assert_eq!(gain_for_score(&bands, 45.0), 0.02);
        assert_eq!(gain_for_score(&bands, 10.0), 0.005);
    }
}
