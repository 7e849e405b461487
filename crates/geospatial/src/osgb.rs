//! OSGB36 British National Grid <-> WGS84 latitude/longitude.

use crate::ellipsoid::{Ellipsoid, Helmert};
use crate::error::{ensure_finite, GeoError, GeoResult};
use crate::transverse_mercator::TransverseMercator;

/// Transforms between a projected grid system and geographic coordinates.
///
/// Implementations are pure and stateless apart from their parameters.
pub trait GeoReference: Send + Sync {
    /// Projected (x, y) metres to geographic (lat, lon) degrees.
    fn project_to_geographic(&self, x: f64, y: f64) -> GeoResult<(f64, f64)>;

    /// Geographic (lat, lon) degrees to projected (x, y) metres.
    fn geographic_to_projected(&self, lat: f64, lon: f64) -> GeoResult<(f64, f64)>;

    /// Element-wise [`GeoReference::project_to_geographic`].
    ///
    /// Returns `(lats, lons)`.
    fn project_many_to_geographic(&self, xs: &[f64], ys: &[f64]) -> GeoResult<(Vec<f64>, Vec<f64>)> {
        if xs.len() != ys.len() {
            return Err(GeoError::LengthMismatch {
                first: xs.len(),
                second: ys.len(),
            });
        }
        let pairs = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| self.project_to_geographic(x, y))
            .collect::<GeoResult<Vec<_>>>()?;
        Ok(pairs.into_iter().unzip())
    }

    /// Element-wise [`GeoReference::geographic_to_projected`].
    ///
    /// Returns `(xs, ys)`.
    fn geographic_many_to_projected(&self, lats: &[f64], lons: &[f64]) -> GeoResult<(Vec<f64>, Vec<f64>)> {
        if lats.len() != lons.len() {
            return Err(GeoError::LengthMismatch {
                first: lats.len(),
                second: lons.len(),
            });
        }
        let pairs = lats
            .iter()
            .zip(lons)
            .map(|(&lat, &lon)| self.geographic_to_projected(lat, lon))
            .collect::<GeoResult<Vec<_>>>()?;
        Ok(pairs.into_iter().unzip())
    }
}

/// OSGB36 National Grid with a Helmert shift to WGS84.
#[derive(Debug, Clone)]
pub struct Osgb {
    grid: TransverseMercator,
    to_wgs84: Helmert,
}

impl Default for Osgb {
    fn default() -> Self {
        Self {
            grid: TransverseMercator::national_grid(),
            to_wgs84: Helmert::OSGB36_TO_WGS84,
        }
    }
}

impl Osgb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GeoReference for Osgb {
    fn project_to_geographic(&self, x: f64, y: f64) -> GeoResult<(f64, f64)> {
        ensure_finite(x, y)?;
        let (lat, lon) = self.grid.inverse(x, y);
        let (lat, lon) = self
            .to_wgs84
            .shift(&Ellipsoid::AIRY_1830, &Ellipsoid::WGS84, lat, lon);
        ensure_finite(lat, lon)?;
        Ok((lat, lon))
    }

    fn geographic_to_projected(&self, lat: f64, lon: f64) -> GeoResult<(f64, f64)> {
        ensure_finite(lat, lon)?;
        if lat.abs() > 90.0 {
            return Err(GeoError::invalid(lat, lon, "latitude outside [-90, 90]"));
        }
        let (lat, lon) = self
            .to_wgs84
            .inverse()
            .shift(&Ellipsoid::WGS84, &Ellipsoid::AIRY_1830, lat, lon);
        let (x, y) = self.grid.forward(lat, lon);
        ensure_finite(x, y)?;
        Ok((x, y))
    }
}

/// Convert OSGB36 metres to WGS84 (lat, lon) degrees.
pub fn osgb_to_lat_lon(x: f64, y: f64) -> GeoResult<(f64, f64)> {
    Osgb::default().project_to_geographic(x, y)
}

/// Convert WGS84 (lat, lon) degrees to OSGB36 metres.
pub fn lat_lon_to_osgb(lat: f64, lon: f64) -> GeoResult<(f64, f64)> {
    Osgb::default().geographic_to_projected(lat, lon)
}
