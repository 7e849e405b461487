//! Optical-flow extrapolation of satellite imagery.
//!
//! A derived source: it is built from an assembled batch rather than raw
//! storage. For each example the motion between the t0 satellite frame and
//! an earlier frame is estimated per channel with windowed Lucas-Kanade, then
//! the t0 frame is advected forward along that motion for every forecast
//! step. Source positions that leave the frame take the nearest edge pixel,
//! so a computed forecast never carries [`OPTICAL_FLOW_SENTINEL`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nalgebra::{Matrix2, Vector2};
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

use nowcasting_common::{
    Batch, Example, FieldArray, Location, NowcastingError, NowcastingResult, OpticalFlowConfig,
    TimeWindow,
};

use crate::source::DataSource;
use crate::types::SourceKind;
use crate::validation::OPTICAL_FLOW_SENTINEL;

/// Structure tensors with a smaller eigenvalue than this give zero flow.
const MIN_EIGENVALUE: f64 = 1e-10;

/// A single-channel frame, row-major.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [f32],
    pub height: usize,
    pub width: usize,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [f32], height: usize, width: usize) -> Self {
        debug_assert_eq!(data.len(), height * width);
        Self { data, height, width }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col] as f64
    }

    /// Bilinear sample at fractional `(row, col)`; `None` outside the frame.
    pub fn sample(&self, row: f64, col: f64) -> Option<f32> {
        let max_row = (self.height - 1) as f64;
        let max_col = (self.width - 1) as f64;
        if !(0.0..=max_row).contains(&row) || !(0.0..=max_col).contains(&col) {
            return None;
        }
        let r0 = row.floor() as usize;
        let c0 = col.floor() as usize;
        let r1 = (r0 + 1).min(self.height - 1);
        let c1 = (c0 + 1).min(self.width - 1);
        let fr = row - r0 as f64;
        let fc = col - c0 as f64;

        let top = self.at(r0, c0) * (1.0 - fc) + self.at(r0, c1) * fc;
        let bottom = self.at(r1, c0) * (1.0 - fc) + self.at(r1, c1) * fc;
        Some((top * (1.0 - fr) + bottom * fr) as f32)
    }

    /// Bilinear sample with the position clamped onto the frame, replicating
    /// the border.
    pub fn sample_clamped(&self, row: f64, col: f64) -> f32 {
        let row = row.clamp(0.0, (self.height - 1) as f64);
        let col = col.clamp(0.0, (self.width - 1) as f64);
        self.sample(row, col).unwrap_or(OPTICAL_FLOW_SENTINEL)
    }
}

/// Dense motion `(d_col, d_row)` from `previous` to `current` at each pixel of
/// `rows x cols`, in pixels per frame gap.
pub fn lucas_kanade(
    previous: &Frame<'_>,
    current: &Frame<'_>,
    rows: Range<usize>,
    cols: Range<usize>,
    radius: usize,
) -> Vec<(f64, f64)> {
    let (h, w) = (current.height, current.width);
    let mean = |r: usize, c: usize| 0.5 * (previous.at(r, c) + current.at(r, c));

    // Central differences of the mean frame, one-sided at the border.
    let gradient = |r: usize, c: usize| -> (f64, f64) {
        let (c_lo, c_hi) = (c.saturating_sub(1), (c + 1).min(w - 1));
        let (r_lo, r_hi) = (r.saturating_sub(1), (r + 1).min(h - 1));
        let ix = if c_hi > c_lo {
            (mean(r, c_hi) - mean(r, c_lo)) / (c_hi - c_lo) as f64
        } else {
            0.0
        };
        let iy = if r_hi > r_lo {
            (mean(r_hi, c) - mean(r_lo, c)) / (r_hi - r_lo) as f64
        } else {
            0.0
        };
        (ix, iy)
    };

    let mut flow = Vec::with_capacity(rows.len() * cols.len());
    for r in rows {
        for c in cols.clone() {
            let mut tensor = Matrix2::<f64>::zeros();
            let mut rhs = Vector2::<f64>::zeros();
            for wr in r.saturating_sub(radius)..=(r + radius).min(h - 1) {
                for wc in c.saturating_sub(radius)..=(c + radius).min(w - 1) {
                    let (ix, iy) = gradient(wr, wc);
                    let it = current.at(wr, wc) - previous.at(wr, wc);
                    tensor[(0, 0)] += ix * ix;
                    tensor[(0, 1)] += ix * iy;
                    tensor[(1, 1)] += iy * iy;
                    rhs[0] -= ix * it;
                    rhs[1] -= iy * it;
                }
            }
            tensor[(1, 0)] = tensor[(0, 1)];

            let trace = tensor.trace();
            let det = tensor.determinant();
            let min_eigen = 0.5 * (trace - (trace * trace - 4.0 * det).max(0.0).sqrt());
            let uv = if min_eigen > MIN_EIGENVALUE {
                tensor.try_inverse().map(|inv| inv * rhs)
            } else {
                None
            };
            flow.push(uv.map(|v| (v[0], v[1])).unwrap_or((0.0, 0.0)));
        }
    }
    flow
}

/// Advect `current` along `flow` for `steps` forecast steps.
///
/// `flow` covers `rows x cols` and is measured over `gap` frames. Returns
/// `[step, row, col]` values for the same window. Positions advected from
/// outside the frame take the nearest edge value.
pub fn extrapolate(
    current: &Frame<'_>,
    flow: &[(f64, f64)],
    rows: Range<usize>,
    cols: Range<usize>,
    steps: usize,
    gap: usize,
) -> Vec<f32> {
    let mut out = Vec::with_capacity(steps * rows.len() * cols.len());
    for step in 1..=steps {
        let scale = step as f64 / gap as f64;
        let mut i = 0;
        for r in rows.clone() {
            for c in cols.clone() {
                let (u, v) = flow[i];
                i += 1;
                out.push(current.sample_clamped(r as f64 - v * scale, c as f64 - u * scale));
            }
        }
    }
    out
}

/// Derived source predicting future satellite frames from optical flow.
pub struct OpticalFlowDataSource {
    batch: Arc<Batch>,
    previous_timestep_for_flow: usize,
    /// Index of t0 along the satellite time axis.
    t0_index: usize,
    forecast_steps: usize,
    period: Duration,
    image_size_pixels: usize,
    window_radius: usize,
}

impl OpticalFlowDataSource {
    /// Build from a completed batch holding `sat_data`.
    ///
    /// `window` is the flow window: satellite history, flow forecast, at
    /// the satellite sample period.
    pub fn from_batch(
        batch: Arc<Batch>,
        config: &OpticalFlowConfig,
        window: TimeWindow,
    ) -> NowcastingResult<Self> {
        if config.previous_timestep_for_flow == 0 || config.previous_timestep_for_flow > window.history_steps() {
            return Err(NowcastingError::config(format!(
                "optical flow needs {} history frames before t0, satellite has {}",
                config.previous_timestep_for_flow,
                window.history_steps()
            )));
        }
        debug!(examples = batch.len(), "Built optical flow source");
        Ok(Self {
            batch,
            previous_timestep_for_flow: config.previous_timestep_for_flow,
            t0_index: window.history_steps(),
            forecast_steps: window.forecast_steps(),
            period: window.period(),
            image_size_pixels: config.image_size_pixels,
            window_radius: config.window_radius,
        })
    }

    fn find(&self, t0: DateTime<Utc>, center: &Location) -> NowcastingResult<&Example> {
        self.batch.find(t0, center).ok_or_else(|| {
            NowcastingError::TimestampUnavailable(format!(
                "no satellite example at {} {} in the backing batch",
                t0, center
            ))
        })
    }
}

#[async_trait]
impl DataSource for OpticalFlowDataSource {
    fn kind(&self) -> SourceKind {
        SourceKind::OpticalFlow
    }

    fn available_timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut t0s: Vec<DateTime<Utc>> = self.batch.examples.iter().map(|e| e.t0).collect();
        t0s.sort();
        t0s.dedup();
        t0s
    }

    /// The centers the backing batch used, in slot order.
    ///
    /// Each requested t0 takes the next unclaimed example with that t0, so
    /// slots sharing a t0 keep their own centers.
    async fn get_locations_for_batch(
        &self,
        t0s: &[DateTime<Utc>],
        _rng: &mut StdRng,
    ) -> NowcastingResult<Vec<Location>> {
        let mut claimed = vec![false; self.batch.examples.len()];
        t0s.iter()
            .map(|t0| {
                let index = self
                    .batch
                    .examples
                    .iter()
                    .enumerate()
                    .position(|(i, e)| !claimed[i] && e.t0 == *t0)
                    .ok_or_else(|| NowcastingError::TimestampUnavailable(format!("{} not in backing batch", t0)))?;
                claimed[index] = true;
                Ok(self.batch.examples[index].center)
            })
            .collect()
    }

    async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
        let source = self.find(t0, &center)?;
        let sat = source.require(SourceKind::Satellite.field_names().data)?;
        let values = sat
            .as_f32()
            .ok_or_else(|| NowcastingError::internal("sat_data must be float32"))?;
        let [nt, h, w, nc] = match sat.shape[..] {
            [nt, h, w, nc] => [nt, h, w, nc],
            _ => {
                return Err(NowcastingError::internal(format!(
                    "sat_data must be 4-d, got {:?}",
                    sat.shape
                )))
            }
        };
        if self.t0_index >= nt {
            return Err(NowcastingError::TimestampUnavailable(format!(
                "sat_data has {} frames, t0 is frame {}",
                nt, self.t0_index
            )));
        }
        let size = self.image_size_pixels;
        if size > h || size > w {
            return Err(NowcastingError::out_of_bounds(
                format!("{} px optical flow crop", size),
                format!("{}x{} satellite frame", w, h),
            ));
        }

        let rows = (h - size) / 2..(h - size) / 2 + size;
        let cols = (w - size) / 2..(w - size) / 2 + size;
        let prev_index = self.t0_index - self.previous_timestep_for_flow;
        let frame_len = h * w * nc;
        let channel_frame = |t: usize, c: usize| -> Vec<f32> {
            values[t * frame_len..(t + 1) * frame_len]
                .iter()
                .skip(c)
                .step_by(nc)
                .copied()
                .collect()
        };

        let per_channel: Vec<Vec<f32>> = (0..nc)
            .into_par_iter()
            .map(|c| {
                let previous = channel_frame(prev_index, c);
                let current = channel_frame(self.t0_index, c);
                let previous = Frame::new(&previous, h, w);
                let current = Frame::new(&current, h, w);
                let flow = lucas_kanade(&previous, &current, rows.clone(), cols.clone(), self.window_radius);
                extrapolate(
                    &current,
                    &flow,
                    rows.clone(),
                    cols.clone(),
                    self.forecast_steps,
                    self.previous_timestep_for_flow,
                )
            })
            .collect();

        // Interleave channels into [step, row, col, channel].
        let plane = size * size;
        let mut data = Vec::with_capacity(self.forecast_steps * plane * nc);
        for i in 0..self.forecast_steps * plane {
            data.extend(per_channel.iter().map(|channel| channel[i]));
        }

        let time_index: Vec<i64> = (1..=self.forecast_steps)
            .map(|k| (t0 + self.period * k as i32).timestamp())
            .collect();

        let names = SourceKind::OpticalFlow.field_names();
        Example::new(t0, center)
            .with_field(
                names.data,
                FieldArray::f32(
                    &["time", "y", "x", "channel"],
                    vec![self.forecast_steps, size, size, nc],
                    data,
                )?,
            )?
            .with_field(names.time, FieldArray::vector_i64("time", time_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use test_utils::{create_moving_blob_frames, reference_start};

    fn flow_config(size: usize) -> OpticalFlowConfig {
        OpticalFlowConfig {
            previous_timestep_for_flow: 1,
            image_size_pixels: size,
            window_radius: 3,
            forecast_minutes: None,
        }
    }

    fn satellite_example(t0: DateTime<Utc>, center: Location, frames: usize, side: usize, channels: usize, shift: f32) -> Example {
        let data = create_moving_blob_frames(frames, side, side, channels, shift);
        Example::new(t0, center)
            .with_field(
                "sat_data",
                FieldArray::f32(&["time", "y", "x", "channel"], vec![frames, side, side, channels], data).unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_bilinear_sample() {
        let data = [0.0, 1.0, 2.0, 3.0];
        let frame = Frame::new(&data, 2, 2);
        assert_eq!(frame.sample(0.0, 0.0), Some(0.0));
        assert_eq!(frame.sample(0.5, 0.5), Some(1.5));
        assert_eq!(frame.sample(1.0, 1.0), Some(3.0));
        assert_eq!(frame.sample(-0.1, 0.0), None);
        assert_eq!(frame.sample(0.0, 1.01), None);
    }

    #[test]
    fn test_lucas_kanade_recovers_translation() {
        let frames = create_moving_blob_frames(2, 48, 48, 1, 1.0);
        let (prev, curr) = frames.split_at(48 * 48);
        let previous = Frame::new(prev, 48, 48);
        let current = Frame::new(curr, 48, 48);

        let flow = lucas_kanade(&previous, &current, 16..32, 16..32, 3);
        let (u, v) = flow[8 * 16 + 8];
        assert!((u - 1.0).abs() < 0.2, "u {}", u);
        assert!(v.abs() < 0.2, "v {}", v);
    }

    #[test]
    fn test_static_scene_has_zero_flow() {
        let frame = create_moving_blob_frames(1, 32, 32, 1, 0.0);
        let f = Frame::new(&frame, 32, 32);
        let flow = lucas_kanade(&f, &f, 0..32, 0..32, 2);
        assert!(flow.iter().all(|(u, v)| u.abs() < 1e-9 && v.abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_forecast_shape_without_sentinel() {
        let t0 = reference_start();
        let center = Location::new(400_000.0, 300_000.0);
        // 30 minutes history at 5 minutes plus t0 and 12 forecast frames.
        let batch = Arc::new(Batch::new(vec![satellite_example(t0, center, 19, 64, 12, 1.0)]));
        let window = TimeWindow::new(30, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(batch, &flow_config(32), window).unwrap();

        let example = source.get_example(t0, center).await.unwrap();
        let data = example.field("opticalflow_data").unwrap();
        assert_eq!(data.shape, vec![12, 32, 32, 12]);
        assert!(data.as_f32().unwrap().iter().all(|v| *v != OPTICAL_FLOW_SENTINEL));
        assert!(source.validate(&example).is_ok());

        let times = example.field("opticalflow_datetime_index").unwrap().as_i64().unwrap();
        assert_eq!(times.len(), 12);
        assert_eq!(times[0], (t0 + Duration::minutes(5)).timestamp());
    }

    #[tokio::test]
    async fn test_full_frame_crop_replicates_border() {
        let t0 = reference_start();
        let center = Location::new(0.0, 0.0);
        // Full-frame crop: the leftmost columns advect from outside.
        let batch = Arc::new(Batch::new(vec![satellite_example(t0, center, 19, 32, 1, 1.0)]));
        let window = TimeWindow::new(30, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(batch, &flow_config(32), window).unwrap();

        let example = source.get_example(t0, center).await.unwrap();
        let data = example.field("opticalflow_data").unwrap().as_f32().unwrap();
        assert!(data.iter().all(|v| v.is_finite() && *v != OPTICAL_FLOW_SENTINEL));
        assert!(source.validate(&example).is_ok());
    }

    #[tokio::test]
    async fn test_noisy_full_frame_input() {
        let t0 = reference_start();
        let center = Location::new(0.0, 0.0);
        let (frames, side, channels) = (3, 32, 12);
        let mut rng = StdRng::seed_from_u64(3);
        let data: Vec<f32> = (0..frames * side * side * channels).map(|_| rng.gen_range(0.0..1.0)).collect();
        let example = Example::new(t0, center)
            .with_field(
                "sat_data",
                FieldArray::f32(&["time", "y", "x", "channel"], vec![frames, side, side, channels], data).unwrap(),
            )
            .unwrap();
        let window = TimeWindow::new(10, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(Arc::new(Batch::new(vec![example])), &flow_config(32), window).unwrap();

        let example = source.get_example(t0, center).await.unwrap();
        let flow = example.field("opticalflow_data").unwrap();
        assert_eq!(flow.shape, vec![12, 32, 32, 12]);
        assert_eq!(flow.as_f32().unwrap().iter().filter(|v| **v == OPTICAL_FLOW_SENTINEL).count(), 0);
        assert!(source.validate(&example).is_ok());
    }

    #[test]
    fn test_clamped_sample_replicates_edge() {
        let data = [0.0, 1.0, 2.0, 3.0];
        let frame = Frame::new(&data, 2, 2);
        assert_eq!(frame.sample_clamped(-4.0, 0.0), 0.0);
        assert_eq!(frame.sample_clamped(0.5, 9.0), 2.0);
        assert_eq!(frame.sample_clamped(5.0, 5.0), 3.0);
    }

    #[tokio::test]
    async fn test_locations_follow_slot_order() {
        let t0 = reference_start();
        let first = Location::new(100_000.0, 200_000.0);
        let second = Location::new(150_000.0, 250_000.0);
        let batch = Arc::new(Batch::new(vec![
            satellite_example(t0, first, 19, 32, 1, 0.0),
            satellite_example(t0, second, 19, 32, 1, 0.0),
        ]));
        let window = TimeWindow::new(30, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(batch, &flow_config(16), window).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let locations = source.get_locations_for_batch(&[t0, t0], &mut rng).await.unwrap();
        assert_eq!(locations, vec![first, second]);
        assert!(source.get_locations_for_batch(&[t0, t0, t0], &mut rng).await.is_err());
    }

    #[tokio::test]
    async fn test_crop_larger_than_frame() {
        let t0 = reference_start();
        let center = Location::new(0.0, 0.0);
        let batch = Arc::new(Batch::new(vec![satellite_example(t0, center, 19, 16, 1, 0.0)]));
        let window = TimeWindow::new(30, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(batch, &flow_config(32), window).unwrap();

        assert!(matches!(
            source.get_example(t0, center).await,
            Err(NowcastingError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_example_is_unavailable() {
        let t0 = reference_start();
        let center = Location::new(0.0, 0.0);
        let batch = Arc::new(Batch::new(vec![satellite_example(t0, center, 19, 32, 1, 0.0)]));
        let window = TimeWindow::new(30, 60, 5).unwrap();
        let source = OpticalFlowDataSource::from_batch(batch, &flow_config(16), window).unwrap();

        let later = t0 + Duration::minutes(5);
        assert!(matches!(
            source.get_example(later, center).await,
            Err(NowcastingError::TimestampUnavailable(_))
        ));

        let mut rng = StdRng::seed_from_u64(0);
        let locations = source.get_locations_for_batch(&[t0], &mut rng).await.unwrap();
        assert_eq!(locations, vec![center]);
    }

    #[test]
    fn test_requires_history_for_flow() {
        let batch = Arc::new(Batch::default());
        let window = TimeWindow::new(0, 60, 5).unwrap();
        assert!(OpticalFlowDataSource::from_batch(batch, &flow_config(16), window).is_err());
    }
}
