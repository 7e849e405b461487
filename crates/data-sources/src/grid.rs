//! Gridded image sources: satellite imagery and NWP fields.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

use nowcasting_common::time::to_unix_seconds;
use nowcasting_common::{
    retry_with_backoff, Example, FieldArray, GridSourceConfig, Location, NowcastingError,
    NowcastingResult, RetryPolicy, TimeWindow,
};

use crate::source::DataSource;
use crate::store::GridStore;
use crate::types::{RegularAxis, SourceKind};

/// Relative tolerance between the store's axis spacing and `meters_per_pixel`.
const RESOLUTION_TOLERANCE: f64 = 1e-6;

fn check_resolution(kind: SourceKind, axis: &RegularAxis, meters_per_pixel: f64) -> NowcastingResult<()> {
    let spacing = axis.step.abs();
    if (spacing - meters_per_pixel).abs() > RESOLUTION_TOLERANCE * meters_per_pixel {
        return Err(NowcastingError::config(format!(
            "{} store is spaced {} m per pixel, configured meters_per_pixel is {}",
            kind, spacing, meters_per_pixel
        )));
    }
    Ok(())
}

/// A square crop of a `[time, y, x, channel]` store around each center.
pub struct GridDataSource {
    kind: SourceKind,
    store: Arc<dyn GridStore>,
    window: TimeWindow,
    image_size_pixels: usize,
    /// Store channel index for each output channel.
    channel_indices: Vec<usize>,
    x_axis: RegularAxis,
    y_axis: RegularAxis,
    available: Vec<DateTime<Utc>>,
    retry: RetryPolicy,
}

impl GridDataSource {
    /// Open a grid source over `store`.
    ///
    /// Fails with `InvalidConfiguration` if a configured channel is missing
    /// from the store, the coordinates are not regularly spaced, or their
    /// spacing differs from `meters_per_pixel`.
    pub fn new(
        kind: SourceKind,
        store: Arc<dyn GridStore>,
        config: &GridSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        if !kind.is_grid() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} is not a grid source",
                kind
            )));
        }
        let metadata = store.metadata();

        let channel_indices = config
            .channels
            .iter()
            .map(|name| {
                metadata.channels.iter().position(|c| c == name).ok_or_else(|| {
                    NowcastingError::config(format!(
                        "{} channel '{}' not in store (available: {:?})",
                        kind, name, metadata.channels
                    ))
                })
            })
            .collect::<NowcastingResult<Vec<_>>>()?;

        let x_axis = RegularAxis::from_coords("x", &metadata.x_coords)
            .map_err(|e| NowcastingError::config(format!("{}: {}", kind, e)))?;
        let y_axis = RegularAxis::from_coords("y", &metadata.y_coords)
            .map_err(|e| NowcastingError::config(format!("{}: {}", kind, e)))?;
        for axis in [&x_axis, &y_axis] {
            check_resolution(kind, axis, config.meters_per_pixel)?;
        }

        let available = window.available_t0s(&metadata.times);
        debug!(
            source = kind.as_str(),
            timestamps = metadata.times.len(),
            available = available.len(),
            "Opened grid source"
        );

        Ok(Self {
            kind,
            store,
            window,
            image_size_pixels: config.image_size_pixels,
            channel_indices,
            x_axis,
            y_axis,
            available,
            retry,
        })
    }

    /// Satellite imagery source.
    pub fn satellite(
        store: Arc<dyn GridStore>,
        config: &GridSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        Self::new(SourceKind::Satellite, store, config, window, retry)
    }

    /// NWP source.
    pub fn nwp(
        store: Arc<dyn GridStore>,
        config: &GridSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        Self::new(SourceKind::Nwp, store, config, window, retry)
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Select configured channels from an all-channel window.
    fn select_channels(&self, data: &[f32]) -> Vec<f32> {
        let nc = self.store.metadata().channels.len();
        let pixels = data.len() / nc;
        let mut out = Vec::with_capacity(pixels * self.channel_indices.len());
        for pixel in data.chunks_exact(nc) {
            out.extend(self.channel_indices.iter().map(|c| pixel[*c]));
        }
        out
    }
}

#[async_trait]
impl DataSource for GridDataSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn available_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.available.clone()
    }

    /// A random center whose crop lies inside the grid, one per t0.
    async fn get_locations_for_batch(
        &self,
        t0s: &[DateTime<Utc>],
        rng: &mut StdRng,
    ) -> NowcastingResult<Vec<Location>> {
        let half = self.image_size_pixels / 2;
        if self.image_size_pixels > self.x_axis.len || self.image_size_pixels > self.y_axis.len {
            return Err(NowcastingError::out_of_bounds(
                format!("{} px crop", self.image_size_pixels),
                format!("{}x{} grid", self.x_axis.len, self.y_axis.len),
            ));
        }
        Ok(t0s
            .iter()
            .map(|_| {
                let col = rng.gen_range(half..=self.x_axis.len - half);
                let row = rng.gen_range(half..=self.y_axis.len - half);
                Location::new(self.x_axis.coord(col), self.y_axis.coord(row))
            })
            .collect())
    }

    async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
        center.ensure_finite()?;
        let metadata = self.store.metadata();
        let times = self.window.locate(&metadata.times, t0)?;
        let xs = self.x_axis.crop("x", center.x, self.image_size_pixels)?;
        let ys = self.y_axis.crop("y", center.y, self.image_size_pixels)?;

        let raw = retry_with_backoff(&self.retry, self.kind.as_str(), || {
            self.store.read_window(times.clone(), ys.clone(), xs.clone())
        })
        .await?;
        let data = self.select_channels(&raw);

        let names = self.kind.field_names();
        let nt = times.len();
        let size = self.image_size_pixels;
        let x_coords = metadata.x_coords[xs].iter().map(|v| *v as f32).collect();
        let y_coords = metadata.y_coords[ys].iter().map(|v| *v as f32).collect();
        let time_index = to_unix_seconds(&metadata.times[times]);

        Example::new(t0, center)
            .with_field(
                names.data,
                FieldArray::f32(
                    &["time", "y", "x", "channel"],
                    vec![nt, size, size, self.channel_indices.len()],
                    data,
                )?,
            )?
            .with_field(names.x, FieldArray::vector_f32("x", x_coords))?
            .with_field(names.y, FieldArray::vector_f32("y", y_coords))?
            .with_field(names.time, FieldArray::vector_i64("time", time_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGridStore;
    use crate::types::GridMetadata;
    use rand::SeedableRng;
    use test_utils::fixtures::grid::SAT_64;
    use test_utils::{create_constant_frames, create_indexed_frames, reference_start, regular_axis, regular_timestamps};

    fn config(size: usize, channels: &[&str]) -> GridSourceConfig {
        GridSourceConfig {
            zarr_path: "unused".into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            image_size_pixels: size,
            meters_per_pixel: 2000.0,
            sample_period_minutes: 5,
            history_minutes: None,
            forecast_minutes: None,
        }
    }

    fn store() -> Arc<MemoryGridStore> {
        let metadata = GridMetadata {
            times: regular_timestamps(reference_start(), 5, 12),
            x_coords: SAT_64.x_coords(),
            y_coords: SAT_64.y_coords(),
            channels: vec!["HRV".into(), "IR_016".into(), "IR_039".into()],
        };
        Arc::new(MemoryGridStore::new(metadata, create_indexed_frames(12, 64, 64, 3)).unwrap())
    }

    fn source(size: usize, channels: &[&str]) -> GridDataSource {
        GridDataSource::satellite(
            store(),
            &config(size, channels),
            TimeWindow::new(10, 15, 5).unwrap(),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_crop_shape_and_values() {
        let source = source(8, &["IR_039", "HRV"]);
        let t0 = source.available_timestamps()[0];
        let (x, y) = SAT_64.pixel(20, 30);

        let example = source.get_example(t0, Location::new(x, y)).await.unwrap();
        let data = example.field("sat_data").unwrap();
        assert_eq!(data.shape, vec![6, 8, 8, 2]);

        // First value: t=0, row=26, col=16, channel IR_039 (store index 2).
        let values = data.as_f32().unwrap();
        assert!((values[0] - (26_016.0 + 0.002)).abs() < 1e-3);
        assert!((values[1] - 26_016.0).abs() < 1e-3);

        let xs = example.field("sat_x_coords").unwrap().as_f32().unwrap();
        assert_eq!(xs.len(), 8);
        assert_eq!(xs[0], SAT_64.pixel(16, 0).0 as f32);

        let times = example.field("sat_datetime_index").unwrap().as_i64().unwrap();
        assert_eq!(times.len(), 6);
        assert_eq!(times[2], t0.timestamp());
    }

    #[tokio::test]
    async fn test_available_timestamps_exclude_edges() {
        let source = source(8, &["HRV"]);
        let times = regular_timestamps(reference_start(), 5, 12);
        assert_eq!(source.available_timestamps(), times[2..9].to_vec());
    }

    #[tokio::test]
    async fn test_out_of_bounds_one_pixel_past_edge() {
        let source = source(32, &["HRV"]);
        let t0 = source.available_timestamps()[0];

        // Centred on pixel 48 the crop is [32, 64); pixel 49 overflows.
        let (x, y) = SAT_64.pixel(48, 32);
        assert!(source.get_example(t0, Location::new(x, y)).await.is_ok());

        let (x, y) = SAT_64.pixel(49, 32);
        assert!(matches!(
            source.get_example(t0, Location::new(x, y)).await,
            Err(NowcastingError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_finite_center() {
        let source = source(8, &["HRV"]);
        let t0 = source.available_timestamps()[0];
        let err = source
            .get_example(t0, Location::new(f64::NAN, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, NowcastingError::InvalidCoordinate(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_fatal() {
        let result = GridDataSource::satellite(
            store(),
            &config(8, &["WV_062"]),
            TimeWindow::new(10, 15, 5).unwrap(),
            RetryPolicy::none(),
        );
        assert!(matches!(result, Err(NowcastingError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_resolution_mismatch_is_fatal() {
        let metadata = GridMetadata {
            times: regular_timestamps(reference_start(), 5, 12),
            x_coords: regular_axis(300_000.0, 1_000.0, 64),
            y_coords: regular_axis(500_000.0, -1_000.0, 64),
            channels: vec!["HRV".to_string()],
        };
        let store = Arc::new(MemoryGridStore::new(metadata, create_constant_frames(12, 64, 64, 1, 1.0)).unwrap());
        let result = GridDataSource::satellite(
            store,
            &config(8, &["HRV"]),
            TimeWindow::new(10, 15, 5).unwrap(),
            RetryPolicy::none(),
        );
        assert!(matches!(result, Err(NowcastingError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_locations_fit_inside_grid() {
        let source = source(32, &["HRV"]);
        let mut rng = StdRng::seed_from_u64(3);
        let t0s = source.available_timestamps();

        let locations = source.get_locations_for_batch(&t0s, &mut rng).await.unwrap();
        assert_eq!(locations.len(), t0s.len());
        for (t0, location) in t0s.iter().zip(&locations) {
            assert!(source.get_example(*t0, *location).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_transient_reads_are_retried() {
        let store = store();
        let source = GridDataSource::satellite(
            store.clone(),
            &config(8, &["HRV"]),
            TimeWindow::new(10, 15, 5).unwrap(),
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 1,
            },
        )
        .unwrap();
        let t0 = source.available_timestamps()[0];
        let (x, y) = SAT_64.pixel(32, 32);

        store.fail_next_reads(2);
        assert!(source.get_example(t0, Location::new(x, y)).await.is_ok());

        store.fail_next_reads(3);
        assert!(source
            .get_example(t0, Location::new(x, y))
            .await
            .unwrap_err()
            .is_transient());
    }

    #[tokio::test]
    async fn test_get_batch_matches_get_example() {
        let source = source(8, &["HRV", "IR_016"]);
        let t0s = source.available_timestamps()[..3].to_vec();
        let centers: Vec<Location> = [(10, 12), (30, 40), (50, 8)]
            .iter()
            .map(|(c, r)| {
                let (x, y) = SAT_64.pixel(*c, *r);
                Location::new(x, y)
            })
            .collect();

        let batch = source.get_batch(&t0s, &centers).await.unwrap();
        for (i, example) in batch.iter().enumerate() {
            assert_eq!(example, &source.get_example(t0s[i], centers[i]).await.unwrap());
        }

        assert!(matches!(
            source.get_batch(&t0s, &centers[..2]).await,
            Err(NowcastingError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_hourly_nwp_source() {
        use test_utils::fixtures::grid::NWP_40;
        use test_utils::NWP_CHANNELS;

        let metadata = GridMetadata {
            times: regular_timestamps(reference_start(), 60, 10),
            x_coords: NWP_40.x_coords(),
            y_coords: NWP_40.y_coords(),
            channels: NWP_CHANNELS.iter().map(|c| c.to_string()).collect(),
        };
        let store = Arc::new(MemoryGridStore::new(metadata, create_constant_frames(10, 40, 40, 10, 280.0)).unwrap());
        let mut cfg = config(4, &["dswrf", "t"]);
        cfg.meters_per_pixel = 4000.0;
        cfg.sample_period_minutes = 60;
        let source = GridDataSource::nwp(store, &cfg, TimeWindow::new(60, 120, 60).unwrap(), RetryPolicy::none()).unwrap();

        assert_eq!(source.kind(), SourceKind::Nwp);
        assert_eq!(source.available_timestamps().len(), 7);

        let t0 = source.available_timestamps()[0];
        let (x, y) = NWP_40.pixel(20, 20);
        let example = source.get_example(t0, Location::new(x, y)).await.unwrap();
        let data = example.require("nwp").unwrap();
        assert_eq!(data.shape, vec![4, 4, 4, 2]);
        assert!(data.as_f32().unwrap().iter().all(|v| *v == 280.0));
        source.validate(&example).unwrap();
    }
}
