//! In-memory stores, used by tests and by sources built from prepared arrays.

use async_trait::async_trait;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use geospatial::GeoReference;
use nowcasting_common::{NowcastingError, NowcastingResult};

use super::{check_range, GridStore, TimeSeriesStore};
use crate::types::{GridMetadata, TimeSeriesMetadata};

/// Grid held in memory.
pub struct MemoryGridStore {
    metadata: GridMetadata,
    data: Vec<f32>,
    failures: AtomicUsize,
}

impl MemoryGridStore {
    /// Create a store from metadata and row-major `[time, y, x, channel]` data.
    pub fn new(metadata: GridMetadata, data: Vec<f32>) -> NowcastingResult<Self> {
        metadata.ensure_sorted_times()?;
        if metadata.len() != data.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "grid shape {:?} needs {} values, got {}",
                metadata.shape(),
                metadata.len(),
                data.len()
            )));
        }
        Ok(Self {
            metadata,
            data,
            failures: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` reads fail with a transient I/O error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

/// Consume one injected failure, if any are pending.
fn take_failure(failures: &AtomicUsize) -> NowcastingResult<()> {
    let pending = failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if pending {
        return Err(NowcastingError::transient("injected read failure"));
    }
    Ok(())
}

#[async_trait]
impl GridStore for MemoryGridStore {
    fn metadata(&self) -> &GridMetadata {
        &self.metadata
    }

    async fn read_window(
        &self,
        times: Range<usize>,
        ys: Range<usize>,
        xs: Range<usize>,
    ) -> NowcastingResult<Vec<f32>> {
        take_failure(&self.failures)?;
        let [nt, ny, nx, nc] = self.metadata.shape();
        check_range("time", &times, nt)?;
        check_range("y", &ys, ny)?;
        check_range("x", &xs, nx)?;

        let mut out = Vec::with_capacity(times.len() * ys.len() * xs.len() * nc);
        for t in times.clone() {
            for y in ys.clone() {
                let row = ((t * ny + y) * nx) * nc;
                out.extend_from_slice(&self.data[row + xs.start * nc..row + xs.end * nc]);
            }
        }
        debug!(times = ?times, ys = ?ys, xs = ?xs, "Read grid window from memory");
        Ok(out)
    }
}

/// Station series held in memory.
pub struct MemoryTimeSeriesStore {
    metadata: TimeSeriesMetadata,
    data: Vec<f32>,
    failures: AtomicUsize,
}

impl MemoryTimeSeriesStore {
    /// Create a store from metadata and row-major `[time, id]` data.
    pub fn new(metadata: TimeSeriesMetadata, data: Vec<f32>) -> NowcastingResult<Self> {
        metadata.validate()?;
        if metadata.len() != data.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "series shape {:?} needs {} values, got {}",
                metadata.shape(),
                metadata.len(),
                data.len()
            )));
        }
        Ok(Self {
            metadata,
            data,
            failures: AtomicUsize::new(0),
        })
    }

    /// Create a store whose entities are given in geographic coordinates.
    ///
    /// Coordinates are projected once here; any invalid coordinate fails
    /// with `InvalidCoordinate`.
    pub fn from_lat_lon(
        geo: &dyn GeoReference,
        times: Vec<chrono::DateTime<chrono::Utc>>,
        ids: Vec<i32>,
        lats: &[f64],
        lons: &[f64],
        data: Vec<f32>,
    ) -> NowcastingResult<Self> {
        let (x_coords, y_coords) = geo.geographic_many_to_projected(lats, lons)?;
        Self::new(
            TimeSeriesMetadata {
                times,
                ids,
                x_coords,
                y_coords,
            },
            data,
        )
    }

    /// Make the next `n` reads fail with a transient I/O error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    fn metadata(&self) -> &TimeSeriesMetadata {
        &self.metadata
    }

    async fn read_window(&self, times: Range<usize>, entities: &[usize]) -> NowcastingResult<Vec<f32>> {
        take_failure(&self.failures)?;
        let [nt, nid] = self.metadata.shape();
        check_range("time", &times, nt)?;
        if let Some(bad) = entities.iter().find(|e| **e >= nid) {
            return Err(NowcastingError::out_of_bounds(
                format!("entity {}", bad),
                format!("{} entities", nid),
            ));
        }

        let mut out = Vec::with_capacity(times.len() * entities.len());
        for t in times.clone() {
            out.extend(entities.iter().map(|e| self.data[t * nid + e]));
        }
        debug!(times = ?times, entities = entities.len(), "Read series window from memory");
        Ok(out)
    }
}
