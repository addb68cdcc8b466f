//! Spherical-earth helpers on top of `geo`'s haversine traits.
//!
//! All angles in and out of this module are degrees; bearings are
//! clockwise from true north in [0, 360).

use geo::{HaversineBearing, HaversineDestination, HaversineDistance, Point};

/// Great-circle distance in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

/// Forward azimuth from the first coordinate to the second.
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let raw = Point::new(lon1, lat1).haversine_bearing(Point::new(lon2, lat2));
    normalize_degrees(raw)
}

/// Point reached after travelling `distance_m` along `bearing_deg`.
pub fn destination(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let p = Point::new(lon, lat).haversine_destination(bearing_deg, distance_m);
    (p.y(), p.x())
}

/// Wrap any angle into [0, 360).
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        // -0.0 comes back as +0.0
        wrapped + 0.0
    }
}

/// Wrap a longitude into [-180, 180).
pub fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Longitude `fraction` of the way from `from` to `to`, going the short way
/// round so blends near the antimeridian stay near it.
pub fn interpolate_longitude(from: f64, to: f64, fraction: f64) -> f64 {
    wrap_longitude(from + fraction * angle_difference(from, to))
}

/// Signed shortest rotation from `from` to `to`, in (-180, 180].
pub fn angle_difference(from: f64, to: f64) -> f64 {
    let d = normalize_degrees(to - from);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

/// Local tangent-plane offset (east, north) in meters of `lat, lon`
/// relative to the origin.
pub fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    const R: f64 = 6_371_000.0;
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = R * d_lon * origin_lat.to_radians().cos();
    let y = R * d_lat;
    (x, y)
}

pub fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const TOKYO_STATION: (f64, f64) = (35.681236, 139.767125);
    const SHIBUYA: (f64, f64) = (35.658581, 139.745433);

    #[test]
    fn test_tokyo_to_shibuya_distance() {
        // these coordinates are ~3.19 km apart on a 6371 km sphere
        let d = haversine_distance(TOKYO_STATION.0, TOKYO_STATION.1, SHIBUYA.0, SHIBUYA.1);
        assert!((d - 3_191.5).abs() < 100.0, "distance was {d}");
    }

    #[test]
    fn test_tokyo_to_shibuya_bearing() {
        let b = bearing(TOKYO_STATION.0, TOKYO_STATION.1, SHIBUYA.0, SHIBUYA.1);
        assert!((b - 217.9).abs() < 2.0, "bearing was {b}");
    }

    #[test]
    fn test_bearing_range() {
        // due west comes back as 270, not -90
        let b = bearing(0.0, 0.0, 0.0, -1.0);
        assert_abs_diff_eq!(b, 270.0, epsilon = 1e-6);
        let n = bearing(0.0, 0.0, 1.0, 0.0);
        assert_abs_diff_eq!(n, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_destination_round_trip_distance() {
        let (lat, lon) = destination(35.0, 139.0, 45.0, 30.0);
        let d = haversine_distance(35.0, 139.0, lat, lon);
        assert_abs_diff_eq!(d, 30.0, epsilon = 1e-4);
        let b = bearing(35.0, 139.0, lat, lon);
        assert_abs_diff_eq!(b, 45.0, epsilon = 1e-3);
    }

    #[test]
    fn test_angle_difference_wraps() {
        assert_abs_diff_eq!(angle_difference(350.0, 10.0), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(angle_difference(10.0, 350.0), -20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(normalize_degrees(-1e-18), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_normalize_degrees_has_no_negative_zero() {
        assert!(normalize_degrees(-0.0).is_sign_positive());
        assert_eq!(normalize_degrees(-90.0), 270.0);
        assert_eq!(normalize_degrees(720.0), 0.0);
    }

    #[test]
    fn test_interpolate_longitude_across_antimeridian() {
        let mid = interpolate_longitude(179.9, -179.9, 0.5);
        assert_abs_diff_eq!(mid.abs(), 180.0, epsilon = 1e-9);
        assert_abs_diff_eq!(interpolate_longitude(179.9, -179.9, 0.25), 179.95, epsilon = 1e-9);
        assert_abs_diff_eq!(interpolate_longitude(139.0, 139.2, 0.5), 139.1, epsilon = 1e-9);
        assert_abs_diff_eq!(wrap_longitude(190.0), -170.0, epsilon = 1e-9);
    }

    #[test]
    fn test_latlon_to_meters_north() {
        let (x, y) = latlon_to_meters(35.001, 139.0, 35.0, 139.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-9);
        assert!((y - 111.19).abs() < 0.1);
    }
}
