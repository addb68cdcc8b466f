use std::collections::VecDeque;

use log::warn;

use crate::config::SmootherConfig;
use crate::geodesy::valid_coordinate;
use crate::types::{LocationFix, SelfFix};

/// Inverse-accuracy weighted mean over the last few location fixes.
pub struct SelfPositionSmoother {
    history: VecDeque<SelfFix>,
    config: SmootherConfig,
}

impl SelfPositionSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        SelfPositionSmoother {
            history: VecDeque::with_capacity(config.history),
            config,
        }
    }

    /// Add a fix to the window. Returns false if the fix was unusable.
    pub fn on_fix(&mut self, fix: &LocationFix) -> bool {
        if !valid_coordinate(fix.latitude, fix.longitude) {
            warn!("Dropping location fix with invalid coordinate ({}, {})", fix.latitude, fix.longitude);
            return false;
        }
        if !fix.accuracy.is_finite() || fix.accuracy < 0.0 {
            warn!("Dropping location fix with invalid accuracy {}", fix.accuracy);
            return false;
        }

        self.history.push_back(SelfFix::from(fix));
        while self.history.len() > self.config.history {
            self.history.pop_front();
        }
        true
    }

    /// Smoothed position; accuracy is the best in the window and the
    /// timestamp is that of the newest fix.
    pub fn current(&self) -> Option<SelfFix> {
        let newest = self.history.back()?;

        let mut total_weight = 0.0;
        let mut lat = 0.0;
        let mut lon = 0.0;
        let mut best_accuracy = f64::INFINITY;
        for fix in &self.history {
            let w = 1.0 / (fix.accuracy + self.config.weight_epsilon);
            total_weight += w;
            lat += fix.latitude * w;
            lon += fix.longitude * w;
            best_accuracy = best_accuracy.min(fix.accuracy);
        }

        Some(SelfFix {
            timestamp: newest.timestamp,
            latitude: lat / total_weight,
            longitude: lon / total_weight,
            accuracy: best_accuracy,
        })
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn fix(t: f64, lat: f64, lon: f64, accuracy: f64) -> LocationFix {
        LocationFix { timestamp: t, latitude: lat, longitude: lon, accuracy, speed: None, heading: None }
    }

    fn smoother() -> SelfPositionSmoother {
        SelfPositionSmoother::new(SmootherConfig::default())
    }

    #[test]
    fn test_empty() {
        assert!(smoother().current().is_none());
    }

    #[test]
    fn test_single_fix_passes_through() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0, 139.0, 12.0));
        let out = s.current().unwrap();
        assert_abs_diff_eq!(out.latitude, 35.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.longitude, 139.0, epsilon = 1e-12);
        assert_eq!(out.accuracy, 12.0);
    }

    #[test]
    fn test_weighted_mean() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0000, 139.0000, 10.0));
        s.on_fix(&fix(2.0, 35.0010, 139.0010, 20.0));
        s.on_fix(&fix(3.0, 35.0020, 139.0020, 40.0));

        let w = [1.0 / (10.0 + 1e-6), 1.0 / (20.0 + 1e-6), 1.0 / (40.0 + 1e-6)];
        let total: f64 = w.iter().sum();
        let lat = (35.0000 * w[0] + 35.0010 * w[1] + 35.0020 * w[2]) / total;
        let lon = (139.0000 * w[0] + 139.0010 * w[1] + 139.0020 * w[2]) / total;

        let out = s.current().unwrap();
        assert_abs_diff_eq!(out.latitude, lat, epsilon = 1e-9);
        assert_abs_diff_eq!(out.longitude, lon, epsilon = 1e-9);
        assert_eq!(out.accuracy, 10.0);
        assert_eq!(out.timestamp, 3.0);
    }

    #[test]
    fn test_two_fix_buffer() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0, 139.0, 10.0));
        s.on_fix(&fix(2.0, 35.0002, 139.0, 40.0));

        // (35.0/10 + 35.0002/40) / (1/10 + 1/40)
        let out = s.current().unwrap();
        assert_abs_diff_eq!(out.latitude, 35.00004, epsilon = 1e-9);
        assert_abs_diff_eq!(out.longitude, 139.0, epsilon = 1e-9);
        assert_eq!(out.accuracy, 10.0);
    }

    #[test]
    fn test_clear_forgets_history() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0, 139.0, 1.0));
        s.clear();
        assert!(s.is_empty());
        assert!(s.current().is_none());

        s.on_fix(&fix(2.0, 36.0, 140.0, 30.0));
        assert_eq!(s.current().unwrap().accuracy, 30.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut s = smoother();
        // a very accurate outlier that must fall out of the window
        s.on_fix(&fix(0.0, 10.0, 10.0, 1.0));
        for i in 1..=5 {
            s.on_fix(&fix(i as f64, 35.0, 139.0, 20.0));
        }
        assert_eq!(s.len(), 5);
        let out = s.current().unwrap();
        assert_abs_diff_eq!(out.latitude, 35.0, epsilon = 1e-9);
        assert_eq!(out.accuracy, 20.0);
    }

    #[test]
    fn test_invalid_fix_ignored() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0, 139.0, 10.0));
        assert!(!s.on_fix(&fix(2.0, 95.0, 139.0, 5.0)));
        assert!(!s.on_fix(&fix(2.0, f64::NAN, 139.0, 5.0)));
        assert!(!s.on_fix(&fix(2.0, 35.0, 139.0, -1.0)));
        assert_eq!(s.len(), 1);
        assert_eq!(s.current().unwrap().timestamp, 1.0);
    }

    #[test]
    fn test_zero_accuracy_does_not_divide_by_zero() {
        let mut s = smoother();
        s.on_fix(&fix(1.0, 35.0, 139.0, 0.0));
        s.on_fix(&fix(2.0, 35.001, 139.0, 10.0));
        let out = s.current().unwrap();
        assert!(out.latitude.is_finite());
        assert!(out.latitude < 35.0001);
        assert_eq!(out.accuracy, 0.0);
    }
}
