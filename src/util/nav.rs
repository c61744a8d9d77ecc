//! Great-circle navigation helpers.

use libm::{atan2f, cosf, sinf, sqrtf};

const EARTH_RADIUS_M: f32 = 6_371_000.0;
const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Distance and initial bearing between two positions (haversine)
///
/// # Arguments
/// * `lat1`, `lon1` - Start position in degrees
/// * `lat2`, `lon2` - End position in degrees
///
/// # Returns
/// * `(metres, bearing in degrees 0-360)`
pub fn distance_bearing(lat1: f32, lon1: f32, lat2: f32, lon2: f32) -> (f32, f32) {
    let phi1 = lat1 * DEG_TO_RAD;
    let phi2 = lat2 * DEG_TO_RAD;
    let d_phi = (lat2 - lat1) * DEG_TO_RAD;
    let d_lambda = (lon2 - lon1) * DEG_TO_RAD;

    let s_phi = sinf(d_phi / 2.0);
    let s_lambda = sinf(d_lambda / 2.0);
    let a = s_phi * s_phi + cosf(phi1) * cosf(phi2) * s_lambda * s_lambda;
    let distance = EARTH_RADIUS_M * 2.0 * atan2f(sqrtf(a), sqrtf(1.0 - a));

    let y = sinf(d_lambda) * cosf(phi2);
    let x = cosf(phi1) * sinf(phi2) - sinf(phi1) * cosf(phi2) * cosf(d_lambda);
    let bearing = (atan2f(y, x) * RAD_TO_DEG + 360.0) % 360.0;
    (distance, bearing)
}

/// Same as [`distance_bearing`] for positions in degrees x 1e7
pub fn distance_bearing_e7(lat1: i32, lon1: i32, lat2: i32, lon2: i32) -> (f32, f32) {
    let deg = |v: i32| (v as f64 / 1e7) as f32;
    distance_bearing(deg(lat1), deg(lon1), deg(lat2), deg(lon2))
}

/// Wrap an angle in degrees into -180..=180
pub fn wrap_180(angle: f32) -> f32 {
    let a = angle % 360.0;
    if a > 180.0 {
        a - 360.0
    } else if a < -180.0 {
        a + 360.0
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_north() {
        let (d, b) = distance_bearing(35.0, 139.0, 36.0, 139.0);
        assert!((d - 111_195.0).abs() < 200.0, "distance {}", d);
        assert!(b < 0.5 || b > 359.5);
    }

    #[test]
    fn cardinal_bearings() {
        let (_, east) = distance_bearing(0.0, 10.0, 0.0, 11.0);
        assert!((east - 90.0).abs() < 0.5);
        let (_, south) = distance_bearing(36.0, 139.0, 35.0, 139.0);
        assert!((south - 180.0).abs() < 0.5);
        let (_, west) = distance_bearing_e7(0, 110_000_000, 0, 100_000_000);
        assert!((west - 270.0).abs() < 0.5);
    }

    #[test]
    fn wraps_angles() {
        assert_eq!(wrap_180(270.0), -90.0);
        assert_eq!(wrap_180(-270.0), 90.0);
        assert_eq!(wrap_180(450.0), 90.0);
        assert_eq!(wrap_180(180.0), 180.0);
    }
}
