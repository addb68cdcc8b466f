//! Orientation estimation with a gradient-descent (Madgwick) AHRS.
//!
//! Gyroscope samples integrate the attitude quaternion. Accelerometer and
//! magnetometer samples refresh their cached direction, and whenever both
//! cached directions are fresh and non-degenerate the gravity and
//! north-field residuals feed a gradient-descent correction whose gain
//! follows the reliability score. Either stream arriving can trigger it, so
//! a missing gyro still lets attitude converge, and a stream that goes quiet
//! stops correcting once its reading ages out.
//!
//! Earth frame is North-West-Up: x points to magnetic north, z up. The
//! quaternion rotates device-frame vectors into that earth frame, and the
//! reported heading is the compass direction of the device x axis.

use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};

use crate::config::OrientationConfig;
use crate::filters::reliability::ReliabilityMonitor;
use crate::geodesy::normalize_degrees;
use crate::types::{
    normalized, normalized_quat, omega_matrix, quat_to_euler, Quat, QuatCov, QuatVec, SensorKind,
    SensorSample, Vec3,
};

const INITIAL_VARIANCE: f64 = 1e-2;
const MAX_UNCERTAINTY_DEG: f64 = 180.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrientationState {
    /// (w, x, y, z)
    pub quaternion: [f64; 4],
    pub heading_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
    pub reliability: f64,
    pub gain: f64,
    pub uncertainty_deg: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrientationStats {
    /// Gyro integration steps.
    pub predicted: u64,
    /// Accel+mag correction steps.
    pub corrected: u64,
    pub skipped: u64,
}

/// Unit direction of one stream and when it was measured.
#[derive(Clone, Copy, Debug)]
struct Reading {
    dir: Vec3,
    timestamp: f64,
}

pub struct OrientationEstimator {
    config: OrientationConfig,
    q: Quat,
    covariance: QuatCov,
    reliability: ReliabilityMonitor,

    // None while degenerate or not yet seen
    accel: Option<Reading>,
    mag: Option<Reading>,

    last_gyro_ts: Option<f64>,
    last_correction_ts: Option<f64>,
    stats: OrientationStats,
}

impl OrientationEstimator {
    pub fn new(config: OrientationConfig) -> Self {
        Self {
            reliability: ReliabilityMonitor::new(config.clone()),
            q: Quat::identity(),
            covariance: QuatCov::identity() * INITIAL_VARIANCE,
            accel: None,
            mag: None,
            last_gyro_ts: None,
            last_correction_ts: None,
            stats: OrientationStats::default(),
            config,
        }
    }

    /// Single entry point for all three streams.
    pub fn ingest(&mut self, sample: &SensorSample) {
        let v = sample.vector();
        let reading = normalized(&v).map(|dir| Reading { dir, timestamp: sample.timestamp });
        match sample.kind {
            SensorKind::Accelerometer => {
                self.accel = reading;
                self.reliability.record_accel(sample.magnitude());
                self.correct(sample.timestamp);
            }
            SensorKind::Magnetometer => {
                self.mag = reading;
                self.reliability.record_mag(sample.magnitude());
                self.correct(sample.timestamp);
            }
            SensorKind::Gyroscope => self.predict(&v, sample.timestamp),
        }
    }

    pub fn current(&self) -> OrientationState {
        let (roll, pitch, yaw) = quat_to_euler(&self.q);
        let reliability = self.reliability.score();
        OrientationState {
            quaternion: [self.q.w, self.q.i, self.q.j, self.q.k],
            heading_deg: normalize_degrees(-yaw.to_degrees()),
            pitch_deg: pitch.to_degrees().clamp(-90.0, 90.0),
            roll_deg: roll_to_range(roll.to_degrees()),
            reliability,
            gain: self.reliability.gain(),
            uncertainty_deg: self.uncertainty_deg(),
        }
    }

    /// Compass heading in degrees, clockwise from north.
    pub fn heading(&self) -> f64 {
        let (_, _, yaw) = quat_to_euler(&self.q);
        normalize_degrees(-yaw.to_degrees())
    }

    pub fn stats(&self) -> OrientationStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.q = Quat::identity();
        self.covariance = QuatCov::identity() * INITIAL_VARIANCE;
        self.accel = None;
        self.mag = None;
        self.last_gyro_ts = None;
        self.last_correction_ts = None;
        self.reliability.clear();
    }

    fn predict(&mut self, gyro: &Vec3, timestamp: f64) {
        let dt = step_dt(self.last_gyro_ts, timestamp, &self.config);
        self.last_gyro_ts = Some(timestamp);

        if !(gyro.x.is_finite() && gyro.y.is_finite() && gyro.z.is_finite()) {
            self.stats.skipped += 1;
            return;
        }
        self.reliability.record_gyro(gyro.norm());

        // Renormalize before the update; an unrecoverable norm skips the tick
        let Some(q) = normalized_quat(&self.q) else {
            self.stats.skipped += 1;
            return;
        };

        // q̇ = ½ q ⊗ (0, ω)
        let q_dot = q * Quat::new(0.0, gyro.x, gyro.y, gyro.z) * 0.5;
        match normalized_quat(&(q + q_dot * dt)) {
            Some(next) => self.q = next,
            None => {
                self.q = q;
                self.stats.skipped += 1;
                return;
            }
        }

        self.stats.predicted += 1;
        self.propagate_covariance(gyro, dt);
    }

    /// Gradient-descent step toward the latest gravity and field directions.
    ///
    /// Integrated over the time since the previous correction, whichever
    /// stream triggered it, so the correction rate does not depend on how
    /// many streams are live.
    fn correct(&mut self, timestamp: f64) {
        let (Some(accel), Some(mag)) = (self.fresh(self.accel, timestamp), self.fresh(self.mag, timestamp)) else {
            return;
        };

        let dt = match self.last_correction_ts {
            // same instant already corrected, or out-of-order across streams
            Some(prev) if timestamp <= prev => return,
            prev => step_dt(prev, timestamp, &self.config),
        };
        self.last_correction_ts = Some(timestamp);

        let Some(q) = normalized_quat(&self.q) else {
            self.stats.skipped += 1;
            return;
        };
        let Some(step) = gradient_step(&q, &accel, &mag) else {
            return;
        };

        let beta = self.reliability.gain();
        match normalized_quat(&(q - step * (beta * dt))) {
            Some(next) => self.q = next,
            None => {
                self.q = q;
                self.stats.skipped += 1;
                return;
            }
        }

        self.stats.corrected += 1;
        self.covariance *= 1.0 - (beta * dt).min(1.0);
    }

    fn fresh(&self, reading: Option<Reading>, now: f64) -> Option<Vec3> {
        reading
            .filter(|r| (now - r.timestamp).abs() <= self.config.max_reading_age)
            .map(|r| r.dir)
    }

    /// P ← F P Fᵀ + Q with F = I + ½ Ω(ω) dt.
    fn propagate_covariance(&mut self, gyro: &Vec3, dt: f64) {
        let f = QuatCov::identity() + omega_matrix(gyro) * (0.5 * dt);
        let q = QuatCov::identity() * (self.config.gyro_noise * self.config.gyro_noise * dt);
        self.covariance = f * self.covariance * f.transpose() + q;
    }

    fn uncertainty_deg(&self) -> f64 {
        // small-angle: rotation error ≈ 2·|δq|
        let deg = (2.0 * self.covariance.trace().max(0.0).sqrt()).to_degrees();
        deg.min(MAX_UNCERTAINTY_DEG)
    }
}

/// Integration step since `prev`; unusable gaps fall back to the nominal period.
fn step_dt(prev: Option<f64>, timestamp: f64, config: &OrientationConfig) -> f64 {
    match prev {
        Some(prev) => {
            let dt = timestamp - prev;
            if dt > 0.0 && dt <= config.max_gyro_dt {
                dt
            } else {
                config.nominal_gyro_dt
            }
        }
        None => config.nominal_gyro_dt,
    }
}

fn roll_to_range(deg: f64) -> f64 {
    // (-180, 180]
    if deg <= -180.0 {
        deg + 360.0
    } else {
        deg
    }
}

/// Normalized gradient of the combined gravity + north-field objective.
///
/// `accel` and `mag` must already be unit vectors. An already-aligned state
/// yields a zero step; `None` means the field has no horizontal part to
/// correct heading against.
fn gradient_step(q: &Quat, accel: &Vec3, mag: &Vec3) -> Option<Quat> {
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);

    // Earth-frame field direction; keep only north (bx) and vertical (bz)
    let h = q * Quat::new(0.0, mag.x, mag.y, mag.z) * q.conjugate();
    let bx = (h.i * h.i + h.j * h.j).sqrt();
    let bz = h.k;
    if bx <= f64::EPSILON {
        return None;
    }

    let f = SMatrix::<f64, 6, 1>::from_column_slice(&[
        2.0 * (q1 * q3 - q0 * q2) - accel.x,
        2.0 * (q0 * q1 + q2 * q3) - accel.y,
        2.0 * (0.5 - q1 * q1 - q2 * q2) - accel.z,
        2.0 * bx * (0.5 - q2 * q2 - q3 * q3) + 2.0 * bz * (q1 * q3 - q0 * q2) - mag.x,
        2.0 * bx * (q1 * q2 - q0 * q3) + 2.0 * bz * (q0 * q1 + q2 * q3) - mag.y,
        2.0 * bx * (q0 * q2 + q1 * q3) + 2.0 * bz * (0.5 - q1 * q1 - q2 * q2) - mag.z,
    ]);

    #[rustfmt::skip]
    let j = SMatrix::<f64, 6, 4>::from_row_slice(&[
        -2.0 * q2,                        2.0 * q3,                        -2.0 * q0,                        2.0 * q1,
         2.0 * q1,                        2.0 * q0,                         2.0 * q3,                        2.0 * q2,
         0.0,                            -4.0 * q1,                        -4.0 * q2,                        0.0,
        -2.0 * bz * q2,                   2.0 * bz * q3,                   -4.0 * bx * q2 - 2.0 * bz * q0,  -4.0 * bx * q3 + 2.0 * bz * q1,
        -2.0 * bx * q3 + 2.0 * bz * q1,   2.0 * bx * q2 + 2.0 * bz * q0,    2.0 * bx * q1 + 2.0 * bz * q3,  -2.0 * bx * q0 + 2.0 * bz * q2,
         2.0 * bx * q2,                   2.0 * bx * q3 - 4.0 * bz * q1,    2.0 * bx * q0 - 4.0 * bz * q2,   2.0 * bx * q1,
    ]);

    let grad: QuatVec = j.transpose() * f;
    let norm = grad.norm();
    if !norm.is_finite() {
        return None;
    }
    if norm <= f64::EPSILON {
        return Some(Quat::new(0.0, 0.0, 0.0, 0.0));
    }
    let g = grad / norm;
    Some(Quat::new(g[0], g[1], g[2], g[3]))
}
