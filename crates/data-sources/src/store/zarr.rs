//! Zarr V3 stores in the layout written by [`crate::writer::ZarrWriter`].

use async_trait::async_trait;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableStorageTraits;
use zarrs_filesystem::FilesystemStore;

use geospatial::GeoReference;
use nowcasting_common::time::from_unix_seconds_many;
use nowcasting_common::{NowcastingError, NowcastingResult};

use super::{check_range, GridStore, TimeSeriesStore};
use crate::error::zarr_error;
use crate::types::{GridMetadata, TimeSeriesMetadata};

type Attributes = serde_json::Map<String, serde_json::Value>;

fn attr_f64s(attrs: &Attributes, key: &str) -> NowcastingResult<Vec<f64>> {
    attrs
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| NowcastingError::zarr(format!("missing attribute '{}'", key)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| NowcastingError::zarr(format!("non-numeric value in '{}'", key)))
        })
        .collect()
}

fn attr_i64s(attrs: &Attributes, key: &str) -> NowcastingResult<Vec<i64>> {
    attrs
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| NowcastingError::zarr(format!("missing attribute '{}'", key)))?
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| NowcastingError::zarr(format!("non-integer value in '{}'", key)))
        })
        .collect()
}

fn attr_strings(attrs: &Attributes, key: &str) -> NowcastingResult<Vec<String>> {
    attrs
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| NowcastingError::zarr(format!("missing attribute '{}'", key)))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| NowcastingError::zarr(format!("non-string value in '{}'", key)))
        })
        .collect()
}

fn subset(start: Vec<u64>, shape: Vec<u64>) -> NowcastingResult<ArraySubset> {
    ArraySubset::new_with_start_shape(start, shape).map_err(|e| zarr_error("array subset", e))
}

/// Read a subset off the async runtime; Zarr decoding is blocking.
async fn read_blocking<S>(array: &Arc<Array<S>>, window: ArraySubset, context: &'static str) -> NowcastingResult<Vec<f32>>
where
    S: ReadableStorageTraits + Send + Sync + 'static,
{
    let array = Arc::clone(array);
    tokio::task::spawn_blocking(move || array.retrieve_array_subset_elements::<f32>(&window))
        .await
        .map_err(|e| NowcastingError::internal(format!("{} task failed: {}", context, e)))?
        .map_err(|e| zarr_error(context, e))
}

/// Open a filesystem-backed array directory.
fn open_filesystem(dir: &Path) -> NowcastingResult<FilesystemStore> {
    if !dir.exists() {
        return Err(NowcastingError::permanent(format!(
            "store {} does not exist",
            dir.display()
        )));
    }
    FilesystemStore::new(dir).map_err(|e| zarr_error("open filesystem store", e))
}

/// Grid store over a 4-D `[time, y, x, channel]` f32 array.
pub struct ZarrGridStore<S: ReadableStorageTraits + 'static> {
    array: Arc<Array<S>>,
    metadata: GridMetadata,
}

impl ZarrGridStore<FilesystemStore> {
    /// Open the array at the root of a Zarr directory.
    pub fn open_dir(dir: &Path) -> NowcastingResult<Self> {
        Self::open(open_filesystem(dir)?, "/")
    }
}

impl<S: ReadableStorageTraits + 'static> ZarrGridStore<S> {
    /// Open a Zarr array from storage and read its axis attributes.
    pub fn open(storage: S, path: &str) -> NowcastingResult<Self> {
        let array = Array::open(Arc::new(storage), path).map_err(|e| zarr_error("open grid", e))?;

        let shape = array.shape().to_vec();
        if shape.len() != 4 {
            return Err(NowcastingError::zarr(format!(
                "grid array must be 4-d [time, y, x, channel], got {:?}",
                shape
            )));
        }

        let attrs = array.attributes();
        let metadata = GridMetadata {
            times: from_unix_seconds_many(&attr_i64s(attrs, "times")?)?,
            x_coords: attr_f64s(attrs, "x_coords")?,
            y_coords: attr_f64s(attrs, "y_coords")?,
            channels: attr_strings(attrs, "channels")?,
        };
        metadata.ensure_sorted_times()?;

        let expected: Vec<u64> = metadata.shape().iter().map(|d| *d as u64).collect();
        if expected != shape {
            return Err(NowcastingError::zarr(format!(
                "grid attributes describe {:?} but array is {:?}",
                expected, shape
            )));
        }

        Ok(Self {
            array: Arc::new(array),
            metadata,
        })
    }
}

#[async_trait]
impl<S: ReadableStorageTraits + Send + Sync + 'static> GridStore for ZarrGridStore<S> {
    fn metadata(&self) -> &GridMetadata {
        &self.metadata
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_window(
        &self,
        times: Range<usize>,
        ys: Range<usize>,
        xs: Range<usize>,
    ) -> NowcastingResult<Vec<f32>> {
        let [nt, ny, nx, nc] = self.metadata.shape();
        check_range("time", &times, nt)?;
        check_range("y", &ys, ny)?;
        check_range("x", &xs, nx)?;

        let window = subset(
            vec![times.start as u64, ys.start as u64, xs.start as u64, 0],
            vec![times.len() as u64, ys.len() as u64, xs.len() as u64, nc as u64],
        )?;
        let data = read_blocking(&self.array, window, "read grid window").await?;

        debug!(values = data.len(), "Read grid window");
        Ok(data)
    }
}

/// Station store over a 2-D `[time, id]` f32 array.
pub struct ZarrTimeSeriesStore<S: ReadableStorageTraits + 'static> {
    array: Arc<Array<S>>,
    metadata: TimeSeriesMetadata,
}

impl ZarrTimeSeriesStore<FilesystemStore> {
    /// Open the array at the root of a Zarr directory.
    pub fn open_dir(dir: &Path, geo: &dyn GeoReference) -> NowcastingResult<Self> {
        Self::open(open_filesystem(dir)?, "/", geo)
    }
}

impl<S: ReadableStorageTraits + 'static> ZarrTimeSeriesStore<S> {
    /// Open a Zarr array from storage and read its entity attributes.
    ///
    /// Entities stored as `latitudes`/`longitudes` are projected through
    /// `geo`; an invalid coordinate fails with `InvalidCoordinate`.
    pub fn open(storage: S, path: &str, geo: &dyn GeoReference) -> NowcastingResult<Self> {
        let array = Array::open(Arc::new(storage), path).map_err(|e| zarr_error("open series", e))?;

        let shape = array.shape().to_vec();
        if shape.len() != 2 {
            return Err(NowcastingError::zarr(format!(
                "series array must be 2-d [time, id], got {:?}",
                shape
            )));
        }

        let attrs = array.attributes();
        let ids = attr_i64s(attrs, "ids")?
            .into_iter()
            .map(|id| {
                i32::try_from(id).map_err(|_| NowcastingError::zarr(format!("entity id {} out of range", id)))
            })
            .collect::<NowcastingResult<Vec<_>>>()?;

        let (x_coords, y_coords) = if attrs.contains_key("x_coords") {
            (attr_f64s(attrs, "x_coords")?, attr_f64s(attrs, "y_coords")?)
        } else {
            let lats = attr_f64s(attrs, "latitudes")?;
            let lons = attr_f64s(attrs, "longitudes")?;
            geo.geographic_many_to_projected(&lats, &lons)?
        };

        let metadata = TimeSeriesMetadata {
            times: from_unix_seconds_many(&attr_i64s(attrs, "times")?)?,
            ids,
            x_coords,
            y_coords,
        };
        metadata.validate()?;

        let expected: Vec<u64> = metadata.shape().iter().map(|d| *d as u64).collect();
        if expected != shape {
            return Err(NowcastingError::zarr(format!(
                "series attributes describe {:?} but array is {:?}",
                expected, shape
            )));
        }

        Ok(Self {
            array: Arc::new(array),
            metadata,
        })
    }
}

#[async_trait]
impl<S: ReadableStorageTraits + Send + Sync + 'static> TimeSeriesStore for ZarrTimeSeriesStore<S> {
    fn metadata(&self) -> &TimeSeriesMetadata {
        &self.metadata
    }

    #[instrument(skip(self, entities), fields(entities = entities.len()), level = "debug")]
    async fn read_window(&self, times: Range<usize>, entities: &[usize]) -> NowcastingResult<Vec<f32>> {
        let [nt, nid] = self.metadata.shape();
        check_range("time", &times, nt)?;
        let (Some(&lo), Some(&hi)) = (entities.iter().min(), entities.iter().max()) else {
            return Ok(Vec::new());
        };
        if hi >= nid {
            return Err(NowcastingError::out_of_bounds(
                format!("entity {}", hi),
                format!("{} entities", nid),
            ));
        }

        // One contiguous read spanning the requested entities.
        let span = hi - lo + 1;
        let window = subset(
            vec![times.start as u64, lo as u64],
            vec![times.len() as u64, span as u64],
        )?;
        let block = read_blocking(&self.array, window, "read series window").await?;

        let mut out = Vec::with_capacity(times.len() * entities.len());
        for t in 0..times.len() {
            out.extend(entities.iter().map(|e| block[t * span + (e - lo)]));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{write_grid_zarr, write_timeseries_zarr, write_timeseries_zarr_lat_lon};
    use test_utils::{
        assert_approx_eq, create_indexed_frames, reference_start, regular_axis, regular_timestamps,
    };

    fn grid_metadata() -> GridMetadata {
        GridMetadata {
            times: regular_timestamps(reference_start(), 5, 4),
            x_coords: regular_axis(300_000.0, 2000.0, 8),
            y_coords: regular_axis(500_000.0, -2000.0, 6),
            channels: vec!["HRV".into(), "IR_016".into()],
        }
    }

    fn series_metadata() -> TimeSeriesMetadata {
        TimeSeriesMetadata {
            times: regular_timestamps(reference_start(), 30, 5),
            ids: vec![7, 8, 9, 10],
            x_coords: vec![400_000.0, 410_000.0, 420_000.0, 430_000.0],
            y_coords: vec![300_000.0, 310_000.0, 320_000.0, 330_000.0],
        }
    }

    #[tokio::test]
    async fn test_grid_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("sat.zarr");
        let data = create_indexed_frames(4, 6, 8, 2);
        write_grid_zarr(&path, &grid_metadata(), &data).unwrap();

        let store = ZarrGridStore::open_dir(&path).unwrap();
        assert_eq!(store.metadata(), &grid_metadata());

        let window = store.read_window(1..3, 2..4, 5..8).await.unwrap();
        assert_eq!(window.len(), 2 * 2 * 3 * 2);
        assert_eq!(window[0], 1_002_005.0);
    }

    #[tokio::test]
    async fn test_series_roundtrip_selects_entities() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pv.zarr");
        let data: Vec<f32> = (0..20).map(|v| v as f32).collect();
        write_timeseries_zarr(&path, &series_metadata(), &data).unwrap();

        let store = ZarrTimeSeriesStore::open_dir(&path, &geospatial::Osgb::new()).unwrap();
        assert_eq!(store.metadata(), &series_metadata());

        let window = store.read_window(1..3, &[3, 1]).await.unwrap();
        assert_eq!(window, vec![7.0, 5.0, 11.0, 9.0]);
    }

    #[tokio::test]
    async fn test_series_lat_lon_projected_at_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("gsp.zarr");
        let data = vec![1.0; 20];
        write_timeseries_zarr_lat_lon(&path, &series_metadata(), &data).unwrap();

        let store = ZarrTimeSeriesStore::open_dir(&path, &geospatial::Osgb::new()).unwrap();
        let expected = series_metadata();
        for i in 0..4 {
            assert_approx_eq!(store.metadata().x_coords[i], expected.x_coords[i], 1.0);
            assert_approx_eq!(store.metadata().y_coords[i], expected.y_coords[i], 1.0);
        }
    }

    #[test]
    fn test_open_missing_store_is_permanent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = ZarrGridStore::open_dir(&temp_dir.path().join("missing.zarr"));
        assert!(matches!(result, Err(NowcastingError::Io { transient: false, .. })));
    }
}
