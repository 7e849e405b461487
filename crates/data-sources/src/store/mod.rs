//! Backing stores for grid and station sources.

mod memory;
mod zarr;

pub use memory::{MemoryGridStore, MemoryTimeSeriesStore};
pub use zarr::{ZarrGridStore, ZarrTimeSeriesStore};

use async_trait::async_trait;
use std::ops::Range;

use nowcasting_common::NowcastingResult;

use crate::types::{GridMetadata, TimeSeriesMetadata};

/// Read access to a `[time, y, x, channel]` f32 grid.
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Axis and channel metadata, read once at open.
    fn metadata(&self) -> &GridMetadata;

    /// Read a window of the grid, all channels.
    ///
    /// # Returns
    /// Row-major `[time, y, x, channel]` values.
    async fn read_window(
        &self,
        times: Range<usize>,
        ys: Range<usize>,
        xs: Range<usize>,
    ) -> NowcastingResult<Vec<f32>>;
}

/// Read access to a `[time, id]` f32 station series.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Entity and time metadata, read once at open.
    fn metadata(&self) -> &TimeSeriesMetadata;

    /// Read a time window for the given entity indices, in that order.
    ///
    /// # Returns
    /// Row-major `[time, id]` values.
    async fn read_window(&self, times: Range<usize>, entities: &[usize]) -> NowcastingResult<Vec<f32>>;
}

/// Check a range lies within an axis of `len` elements.
pub(crate) fn check_range(axis: &str, range: &Range<usize>, len: usize) -> NowcastingResult<()> {
    if range.start > range.end || range.end > len {
        return Err(nowcasting_common::NowcastingError::out_of_bounds(
            format!("{} {:?}", axis, range),
            format!("{} axis of {}", axis, len),
        ));
    }
    Ok(())
}
