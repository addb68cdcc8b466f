//! Linear algebra type system for the orientation filter
//!
//! Fixed-dimension nalgebra types so the attitude math never deals with
//! ad-hoc nested vectors.

use nalgebra::{Quaternion, SMatrix, SVector, Vector3};

// ===== Dimensions =====
pub const QUAT_DIM: usize = 4;

// ===== Attitude Types =====
pub type Vec3 = Vector3<f64>;
pub type Quat = Quaternion<f64>;
pub type QuatVec = SVector<f64, QUAT_DIM>;
pub type QuatCov = SMatrix<f64, QUAT_DIM, QUAT_DIM>;

/// Norm below which a vector is treated as carrying no direction.
pub const DEGENERATE_EPS: f64 = 1e-6;

/// Unit vector in the direction of `v`, or `None` for a degenerate reading.
pub fn normalized(v: &Vec3) -> Option<Vec3> {
    let n = v.norm();
    if n > DEGENERATE_EPS && n.is_finite() {
        Some(v / n)
    } else {
        None
    }
}

/// Quaternion scaled to unit norm, or `None` when the norm is too small
/// to recover a rotation from.
pub fn normalized_quat(q: &Quat) -> Option<Quat> {
    let n = q.norm();
    if n > DEGENERATE_EPS && n.is_finite() {
        Some(q / n)
    } else {
        None
    }
}

/// Ω(ω) such that q̇ = ½ Ω(ω) q, with q ordered (w, x, y, z).
pub fn omega_matrix(w: &Vec3) -> QuatCov {
    let (gx, gy, gz) = (w.x, w.y, w.z);
    QuatCov::new(
        0.0, -gx, -gy, -gz, //
        gx, 0.0, gz, -gy, //
        gy, -gz, 0.0, gx, //
        gz, gy, -gx, 0.0,
    )
}

/// Euler angles (roll, pitch, yaw) in radians, ZYX order.
///
/// The pitch argument is clamped so a quaternion sitting exactly at the
/// gimbal edge yields ±π/2 rather than NaN.
pub fn quat_to_euler(q: &Quat) -> (f64, f64, f64) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let sin_pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0);
    let pitch = sin_pitch.asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    (roll, pitch, yaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_degenerate_vector() {
        assert!(normalized(&Vec3::zeros()).is_none());
        let n = normalized(&Vec3::new(3.0, 4.0, 0.0)).unwrap();
        assert_abs_diff_eq!(n.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_identity_euler() {
        let (roll, pitch, yaw) = quat_to_euler(&Quat::identity());
        assert_eq!((roll, pitch, yaw), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_gimbal_edge_is_finite() {
        // 90° about y, nudged past the edge by rounding
        let h = FRAC_PI_2 / 2.0;
        let q = Quat::new(h.cos() * 1.000001, 0.0, h.sin() * 1.000001, 0.0);
        let (_, pitch, _) = quat_to_euler(&q);
        assert!(pitch.is_finite());
        assert_abs_diff_eq!(pitch, FRAC_PI_2, epsilon = 1e-3);
    }

    #[test]
    fn test_omega_is_skew() {
        let om = omega_matrix(&Vec3::new(0.1, -0.2, 0.3));
        assert_abs_diff_eq!(om + om.transpose(), QuatCov::zeros(), epsilon = 1e-15);
    }
}
