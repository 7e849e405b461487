//! Reference ellipsoids and the Helmert datum shift between them.
//!
//! Geodetic coordinates are converted to earth-centred cartesian vectors,
//! shifted with a 7-parameter Helmert transform, and converted back onto the
//! target ellipsoid.

use nalgebra::{Matrix3, Vector3};

/// Arc-seconds to radians.
const ARCSEC: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// A reference ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    /// Semi-major axis (metres)
    pub a: f64,
    /// Semi-minor axis (metres)
    pub b: f64,
}

impl Ellipsoid {
    /// Airy 1830, the ellipsoid of the OSGB36 datum.
    pub const AIRY_1830: Ellipsoid = Ellipsoid {
        a: 6_377_563.396,
        b: 6_356_256.909,
    };

    /// WGS84 / GRS80.
    pub const WGS84: Ellipsoid = Ellipsoid {
        a: 6_378_137.0,
        b: 6_356_752.314_245,
    };

    /// First eccentricity squared.
    #[inline]
    pub fn e2(&self) -> f64 {
        1.0 - (self.b * self.b) / (self.a * self.a)
    }

    /// Geodetic (radians, height in metres) to earth-centred cartesian.
    pub fn to_cartesian(&self, lat: f64, lon: f64, height: f64) -> Vector3<f64> {
        let e2 = self.e2();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let nu = self.a / (1.0 - e2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (nu + height) * cos_lat * lon.cos(),
            (nu + height) * cos_lat * lon.sin(),
            ((1.0 - e2) * nu + height) * sin_lat,
        )
    }

    /// Earth-centred cartesian to geodetic (radians, height in metres).
    ///
    /// Iterates the latitude until it changes by less than ~1e-12 rad.
    pub fn to_geodetic(&self, p: &Vector3<f64>) -> (f64, f64, f64) {
        let e2 = self.e2();
        let lon = p.y.atan2(p.x);
        let r = p.x.hypot(p.y);

        let mut lat = p.z.atan2(r * (1.0 - e2));
        let mut nu = self.a;
        for _ in 0..16 {
            let sin_lat = lat.sin();
            nu = self.a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            let next = (p.z + e2 * nu * sin_lat).atan2(r);
            let converged = (next - lat).abs() < 1e-12;
            lat = next;
            if converged {
                break;
            }
        }

        let height = r / lat.cos() - nu;
        (lat, lon, height)
    }
}

/// 7-parameter Helmert transform (position vector convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Helmert {
    /// Translation (metres)
    pub translation: [f64; 3],
    /// Scale change (parts per million)
    pub scale_ppm: f64,
    /// Rotations about x, y, z (arc-seconds)
    pub rotation_arcsec: [f64; 3],
}

impl Helmert {
    /// OSGB36 to WGS84, as published by Ordnance Survey (accuracy ~5 m).
    pub const OSGB36_TO_WGS84: Helmert = Helmert {
        translation: [446.448, -125.157, 542.060],
        scale_ppm: -20.4894,
        rotation_arcsec: [0.1502, 0.2470, 0.8421],
    };

    /// The reverse transform (all parameters negated).
    pub fn inverse(&self) -> Helmert {
        Helmert {
            translation: [
                -self.translation[0],
                -self.translation[1],
                -self.translation[2],
            ],
            scale_ppm: -self.scale_ppm,
            rotation_arcsec: [
                -self.rotation_arcsec[0],
                -self.rotation_arcsec[1],
                -self.rotation_arcsec[2],
            ],
        }
    }

    /// Apply the transform to a cartesian vector.
    pub fn apply(&self, p: &Vector3<f64>) -> Vector3<f64> {
        let [rx, ry, rz] = self.rotation_arcsec.map(|r| r * ARCSEC);
        let scale = 1.0 + self.scale_ppm * 1e-6;
        let rotation = Matrix3::new(
            1.0, -rz, ry, //
            rz, 1.0, -rx, //
            -ry, rx, 1.0,
        );
        let translation = Vector3::from(self.translation);

        translation + rotation * p * scale
    }

    /// Shift geodetic coordinates (degrees) from one ellipsoid to another.
    ///
    /// Returns `(lat, lon)` in degrees on the target ellipsoid; ellipsoidal
    /// height is discarded.
    pub fn shift(&self, from: &Ellipsoid, to: &Ellipsoid, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        let cartesian = from.to_cartesian(lat_deg.to_radians(), lon_deg.to_radians(), 0.0);
        let shifted = self.apply(&cartesian);
        let (lat, lon, _height) = to.to_geodetic(&shifted);
        (lat.to_degrees(), lon.to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_roundtrip() {
        let ell = Ellipsoid::WGS84;
        let (lat, lon, h) = (52.0_f64.to_radians(), (-1.5_f64).to_radians(), 120.0);

        let p = ell.to_cartesian(lat, lon, h);
        let (lat2, lon2, h2) = ell.to_geodetic(&p);

        assert!((lat - lat2).abs() < 1e-11);
        assert!((lon - lon2).abs() < 1e-11);
        assert!((h - h2).abs() < 1e-4);
    }

    #[test]
    fn test_helmert_inverse_cancels() {
        let forward = Helmert::OSGB36_TO_WGS84;
        let p = Ellipsoid::AIRY_1830.to_cartesian(0.9, -0.03, 0.0);

        let back = forward.inverse().apply(&forward.apply(&p));

        assert!((back - p).norm() < 0.05, "residual {}", (back - p).norm());
    }

    #[test]
    fn test_datum_shift_magnitude() {
        // OSGB36 and WGS84 positions differ by roughly 100 m in Great Britain.
        let (lat, lon) = Helmert::OSGB36_TO_WGS84.shift(
            &Ellipsoid::AIRY_1830,
            &Ellipsoid::WGS84,
            52.0,
            -1.0,
        );
        let dlat_m = (lat - 52.0) * 111_000.0;
        let dlon_m = (lon + 1.0) * 111_000.0 * 52.0_f64.to_radians().cos();
        let shift_m = dlat_m.hypot(dlon_m);

        assert!(shift_m > 50.0 && shift_m < 200.0, "shift {} m", shift_m);
        assert!(dlon_m < 0.0, "WGS84 longitude lies west of OSGB36");
    }
}
