//! Coordinate reference system transformations.
//!
//! Grid-based sources (satellite imagery, NWP) and station metadata are
//! expressed in the OSGB36 British National Grid (metres). This crate maps
//! those coordinates to WGS84 latitude/longitude and back, implemented from
//! the Ordnance Survey formulae without external projection libraries.

pub mod ellipsoid;
pub mod error;
pub mod osgb;
pub mod transverse_mercator;

pub use ellipsoid::{Ellipsoid, Helmert};
pub use error::{GeoError, GeoResult};
pub use osgb::{lat_lon_to_osgb, osgb_to_lat_lon, GeoReference, Osgb};
pub use transverse_mercator::TransverseMercator;
