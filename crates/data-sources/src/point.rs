//! Station sources: PV systems and grid supply points.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use nowcasting_common::time::to_unix_seconds;
use nowcasting_common::{
    retry_with_backoff, Example, FieldArray, Location, NowcastingError, NowcastingResult,
    PointSourceConfig, RetryPolicy, TimeWindow,
};

use crate::source::DataSource;
use crate::store::TimeSeriesStore;
use crate::types::SourceKind;

/// The nearest complete station series around each center.
pub struct PointDataSource {
    kind: SourceKind,
    store: Arc<dyn TimeSeriesStore>,
    window: TimeWindow,
    n_entities: usize,
    /// Half the side of the square search area, in metres.
    half_side_m: f64,
    available: Vec<DateTime<Utc>>,
    retry: RetryPolicy,
}

impl PointDataSource {
    pub fn new(
        kind: SourceKind,
        store: Arc<dyn TimeSeriesStore>,
        config: &PointSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        if !kind.is_point() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} is not a station source",
                kind
            )));
        }
        let metadata = store.metadata();
        let available = window.available_t0s(&metadata.times);
        debug!(
            source = kind.as_str(),
            entities = metadata.ids.len(),
            available = available.len(),
            "Opened station source"
        );

        Ok(Self {
            kind,
            store,
            window,
            n_entities: config.n_entities_per_example,
            half_side_m: config.search_radius_m(),
            available,
            retry,
        })
    }

    /// PV system source.
    pub fn pv(
        store: Arc<dyn TimeSeriesStore>,
        config: &PointSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        Self::new(SourceKind::Pv, store, config, window, retry)
    }

    /// Grid supply point source.
    pub fn gsp(
        store: Arc<dyn TimeSeriesStore>,
        config: &PointSourceConfig,
        window: TimeWindow,
        retry: RetryPolicy,
    ) -> NowcastingResult<Self> {
        Self::new(SourceKind::Gsp, store, config, window, retry)
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Entities inside the search square, nearest first.
    fn candidates(&self, center: &Location) -> Vec<usize> {
        let metadata = self.store.metadata();
        let mut nearby: Vec<(f64, usize)> = (0..metadata.ids.len())
            .filter_map(|i| {
                let dx = metadata.x_coords[i] - center.x;
                let dy = metadata.y_coords[i] - center.y;
                (dx.abs() <= self.half_side_m && dy.abs() <= self.half_side_m)
                    .then(|| (dx.hypot(dy), i))
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        nearby.into_iter().map(|(_, i)| i).collect()
    }
}

#[async_trait]
impl DataSource for PointDataSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn available_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.available.clone()
    }

    /// The position of a random entity with finite data at each t0.
    async fn get_locations_for_batch(
        &self,
        t0s: &[DateTime<Utc>],
        rng: &mut StdRng,
    ) -> NowcastingResult<Vec<Location>> {
        let metadata = self.store.metadata();
        let all: Vec<usize> = (0..metadata.ids.len()).collect();
        let mut locations = Vec::with_capacity(t0s.len());

        for t0 in t0s {
            let idx = metadata.times.binary_search(t0).map_err(|_| {
                NowcastingError::TimestampUnavailable(format!("{} not in {} store", t0, self.kind))
            })?;
            let row = retry_with_backoff(&self.retry, self.kind.as_str(), || {
                self.store.read_window(idx..idx + 1, &all)
            })
            .await?;

            let finite: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .map(|(i, _)| i)
                .collect();
            let chosen = finite.choose(rng).ok_or_else(|| {
                NowcastingError::TimestampUnavailable(format!("no {} entity has data at {}", self.kind, t0))
            })?;
            locations.push(Location::new(metadata.x_coords[*chosen], metadata.y_coords[*chosen]));
        }
        Ok(locations)
    }

    async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
        center.ensure_finite()?;
        let metadata = self.store.metadata();
        let times = self.window.locate(&metadata.times, t0)?;

        let candidates = self.candidates(&center);
        let data = if candidates.is_empty() {
            Vec::new()
        } else {
            retry_with_backoff(&self.retry, self.kind.as_str(), || {
                self.store.read_window(times.clone(), &candidates)
            })
            .await?
        };

        // Keep the nearest entities with a complete window.
        let n_candidates = candidates.len();
        let selected: Vec<usize> = (0..n_candidates)
            .filter(|c| (0..times.len()).all(|t| !data[t * n_candidates + c].is_nan()))
            .take(self.n_entities)
            .collect();
        if selected.len() < self.n_entities {
            return Err(NowcastingError::InsufficientEntities {
                required: self.n_entities,
                found: selected.len(),
                x: center.x,
                y: center.y,
            });
        }

        let nt = times.len();
        let mut values = Vec::with_capacity(nt * selected.len());
        for t in 0..nt {
            values.extend(selected.iter().map(|c| data[t * n_candidates + c]));
        }
        let entities: Vec<usize> = selected.iter().map(|c| candidates[*c]).collect();

        let names = self.kind.field_names();
        let ids = entities.iter().map(|e| metadata.ids[*e]).collect();
        let xs = entities.iter().map(|e| metadata.x_coords[*e] as f32).collect();
        let ys = entities.iter().map(|e| metadata.y_coords[*e] as f32).collect();
        let id_field = names.id.unwrap_or("id");

        Example::new(t0, center)
            .with_field(
                names.data,
                FieldArray::f32(&["time", "id"], vec![nt, self.n_entities], values)?,
            )?
            .with_field(id_field, FieldArray::vector_i32("id", ids))?
            .with_field(names.x, FieldArray::vector_f32("id", xs))?
            .with_field(names.y, FieldArray::vector_f32("id", ys))?
            .with_field(names.time, FieldArray::vector_i64("time", to_unix_seconds(&metadata.times[times])))
    }
}
