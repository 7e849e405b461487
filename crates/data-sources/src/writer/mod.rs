//! Zarr writers for building source stores.
//!
//! Used to prepare fixture stores in the layouts the Zarr stores read.

mod zarr_writer;

pub use zarr_writer::{
    blosc_codec, write_grid_zarr, write_timeseries_zarr, write_timeseries_zarr_lat_lon,
    StationCoordinates, ZarrWriteResult, ZarrWriter,
};
