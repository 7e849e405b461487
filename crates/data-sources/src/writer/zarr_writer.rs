//! Zarr V3 writer for grid and station arrays.
//!
//! Grids are stored as one f32 array `[time, y, x, channel]`, chunked one
//! timestep per chunk. Station series are one f32 array `[time, id]`.
//! Axis coordinates, channel names, timestamps (Unix seconds) and entity ids
//! live in the array attributes.

use std::path::Path;
use std::sync::Arc;

use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::{ReadableStorageTraits, WritableStorageTraits};
use zarrs_filesystem::FilesystemStore;

use geospatial::GeoReference;
use nowcasting_common::time::to_unix_seconds;
use nowcasting_common::{NowcastingError, NowcastingResult};

use crate::error::zarr_error;
use crate::types::{GridMetadata, TimeSeriesMetadata};

/// Maximum timesteps per chunk of a station array.
const SERIES_CHUNK_TIMES: usize = 1024;

/// Result of writing a Zarr array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZarrWriteResult {
    /// Array shape.
    pub shape: [usize; 4],
    /// Uncompressed bytes written.
    pub bytes_written: u64,
}

/// How station coordinates are recorded in the attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationCoordinates {
    /// `x_coords` / `y_coords` in OSGB metres.
    Osgb,
    /// `latitudes` / `longitudes` in WGS84 degrees.
    LatLon,
}

/// Build a Blosc-Zstd codec with byte shuffle.
///
/// # Arguments
/// * `level` - Compression level (0-9)
/// * `typesize` - Element size in bytes, required by shuffle
pub fn blosc_codec(level: u8, typesize: usize) -> NowcastingResult<Arc<dyn BytesToBytesCodecTraits>> {
    let level = BloscCompressionLevel::try_from(level)
        .map_err(|_| NowcastingError::config(format!("invalid compression level {}", level)))?;

    // BloscCodec::new(cname, clevel, blocksize, shuffle_mode, typesize)
    let codec = BloscCodec::new(
        BloscCompressor::Zstd,
        level,
        None,
        BloscShuffleMode::Shuffle,
        Some(typesize),
    )
    .map_err(|e| NowcastingError::config(e.to_string()))?;

    Ok(Arc::new(codec))
}

/// Writer for creating source arrays.
pub struct ZarrWriter {
    compression_level: u8,
}

impl Default for ZarrWriter {
    fn default() -> Self {
        Self { compression_level: 1 }
    }
}

impl ZarrWriter {
    /// Create a writer with the given Blosc-Zstd level.
    pub fn new(compression_level: u8) -> Self {
        Self { compression_level }
    }

    /// Write a `[time, y, x, channel]` grid.
    pub fn write_grid<S: ReadableStorageTraits + WritableStorageTraits + 'static>(
        &self,
        storage: S,
        path: &str,
        metadata: &GridMetadata,
        data: &[f32],
    ) -> NowcastingResult<ZarrWriteResult> {
        metadata.ensure_sorted_times()?;
        let shape = metadata.shape();
        if shape.iter().any(|d| *d == 0) || metadata.len() != data.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "grid shape {:?} does not fit {} values",
                shape,
                data.len()
            )));
        }

        let mut attrs = serde_json::Map::new();
        attrs.insert("times".to_string(), serde_json::json!(to_unix_seconds(&metadata.times)));
        attrs.insert("x_coords".to_string(), serde_json::json!(metadata.x_coords));
        attrs.insert("y_coords".to_string(), serde_json::json!(metadata.y_coords));
        attrs.insert("channels".to_string(), serde_json::json!(metadata.channels));

        let chunk_shape = vec![1, shape[1] as u64, shape[2] as u64, shape[3] as u64];
        let array = self.build_array(Arc::new(storage), path, &shape, chunk_shape, attrs)?;
        self.store(&array, &shape, data)?;

        Ok(ZarrWriteResult {
            shape,
            bytes_written: (data.len() * std::mem::size_of::<f32>()) as u64,
        })
    }

    /// Write a `[time, id]` station series.
    pub fn write_timeseries<S: ReadableStorageTraits + WritableStorageTraits + 'static>(
        &self,
        storage: S,
        path: &str,
        metadata: &TimeSeriesMetadata,
        data: &[f32],
        coordinates: StationCoordinates,
        geo: &dyn GeoReference,
    ) -> NowcastingResult<ZarrWriteResult> {
        metadata.validate()?;
        let [nt, nid] = metadata.shape();
        if nt == 0 || nid == 0 || metadata.len() != data.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "series shape {:?} does not fit {} values",
                metadata.shape(),
                data.len()
            )));
        }

        let mut attrs = serde_json::Map::new();
        attrs.insert("times".to_string(), serde_json::json!(to_unix_seconds(&metadata.times)));
        attrs.insert("ids".to_string(), serde_json::json!(metadata.ids));
        match coordinates {
            StationCoordinates::Osgb => {
                attrs.insert("x_coords".to_string(), serde_json::json!(metadata.x_coords));
                attrs.insert("y_coords".to_string(), serde_json::json!(metadata.y_coords));
            }
            StationCoordinates::LatLon => {
                let (lats, lons) = geo.project_many_to_geographic(&metadata.x_coords, &metadata.y_coords)?;
                attrs.insert("latitudes".to_string(), serde_json::json!(lats));
                attrs.insert("longitudes".to_string(), serde_json::json!(lons));
            }
        }

        let shape = [nt, nid];
        let chunk_shape = vec![nt.min(SERIES_CHUNK_TIMES) as u64, nid as u64];
        let array = self.build_array(Arc::new(storage), path, &shape, chunk_shape, attrs)?;
        self.store(&array, &shape, data)?;

        Ok(ZarrWriteResult {
            shape: [nt, nid, 1, 1],
            bytes_written: (data.len() * std::mem::size_of::<f32>()) as u64,
        })
    }

    /// Build an f32 array with the configured compression.
    fn build_array<S: ReadableStorageTraits + WritableStorageTraits + 'static>(
        &self,
        storage: Arc<S>,
        path: &str,
        shape: &[usize],
        chunk_shape: Vec<u64>,
        attrs: serde_json::Map<String, serde_json::Value>,
    ) -> NowcastingResult<Array<S>> {
        let chunk_grid: zarrs::array::ChunkGrid = chunk_shape
            .try_into()
            .map_err(|e| NowcastingError::config(format!("{:?}", e)))?;

        let mut builder = ArrayBuilder::new(
            shape.iter().map(|d| *d as u64).collect::<Vec<_>>(),
            DataType::Float32,
            chunk_grid,
            FillValue::from(f32::NAN),
        );
        builder.attributes(attrs);
        builder.bytes_to_bytes_codecs(vec![blosc_codec(self.compression_level, 4)?]);

        let array = builder
            .build(storage, path)
            .map_err(|e| zarr_error("create array", e))?;
        array
            .store_metadata()
            .map_err(|e| zarr_error("store array metadata", e))?;
        Ok(array)
    }

    fn store<S: ReadableStorageTraits + WritableStorageTraits + 'static>(
        &self,
        array: &Array<S>,
        shape: &[usize],
        data: &[f32],
    ) -> NowcastingResult<()> {
        let subset = ArraySubset::new_with_start_shape(
            vec![0; shape.len()],
            shape.iter().map(|d| *d as u64).collect(),
        )
        .map_err(|e| zarr_error("array subset", e))?;

        array
            .store_array_subset_elements(&subset, data)
            .map_err(|e| zarr_error("store array data", e))
    }
}

fn open_dir(dir: &Path) -> NowcastingResult<FilesystemStore> {
    std::fs::create_dir_all(dir)?;
    FilesystemStore::new(dir).map_err(|e| zarr_error("open filesystem store", e))
}

/// Write a grid store to a directory.
pub fn write_grid_zarr(dir: &Path, metadata: &GridMetadata, data: &[f32]) -> NowcastingResult<ZarrWriteResult> {
    ZarrWriter::default().write_grid(open_dir(dir)?, "/", metadata, data)
}

/// Write a station store with OSGB coordinates to a directory.
pub fn write_timeseries_zarr(
    dir: &Path,
    metadata: &TimeSeriesMetadata,
    data: &[f32],
) -> NowcastingResult<ZarrWriteResult> {
    ZarrWriter::default().write_timeseries(
        open_dir(dir)?,
        "/",
        metadata,
        data,
        StationCoordinates::Osgb,
        &geospatial::Osgb::new(),
    )
}

/// Write a station store with WGS84 coordinates to a directory.
///
/// The store is read back through the same projection, so entity positions
/// survive to well under a metre.
pub fn write_timeseries_zarr_lat_lon(
    dir: &Path,
    metadata: &TimeSeriesMetadata,
    data: &[f32],
) -> NowcastingResult<ZarrWriteResult> {
    ZarrWriter::default().write_timeseries(
        open_dir(dir)?,
        "/",
        metadata,
        data,
        StationCoordinates::LatLon,
        &geospatial::Osgb::new(),
    )
}
