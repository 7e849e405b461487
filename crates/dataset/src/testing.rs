//! Scripted sources for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicUsize, Ordering};

use data_sources::{DataSource, SourceKind};
use nowcasting_common::{Example, FieldArray, Location, NowcastingError, NowcastingResult};

#[derive(Debug, Clone, Copy)]
pub enum FakeBehaviour {
    /// Always a valid one-field fragment.
    Ok,
    /// Returns a fragment for a different center.
    WrongCenter,
    /// NaN data at this center.
    NanAt(Location),
    /// Recoverable `OutOfBounds` at this center.
    OutOfBoundsAt(Location),
    /// Recoverable failure everywhere.
    AlwaysOutOfBounds,
    /// Fatal storage failure.
    Fatal,
}

/// A satellite-kind source producing a single field named after itself.
///
/// Batch location draws return `x = slot index` for multi-t0 calls and
/// `x = 100` for single redraws.
pub struct FakeSource {
    name: &'static str,
    behaviour: FakeBehaviour,
    calls: AtomicUsize,
    timestamps: Vec<DateTime<Utc>>,
}

impl FakeSource {
    pub fn new(name: &'static str, behaviour: FakeBehaviour) -> Self {
        Self {
            name,
            behaviour,
            calls: AtomicUsize::new(0),
            timestamps: Vec::new(),
        }
    }

    pub fn with_timestamps(mut self, timestamps: Vec<DateTime<Utc>>) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for FakeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Satellite
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn available_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.clone()
    }

    async fn get_locations_for_batch(
        &self,
        t0s: &[DateTime<Utc>],
        _rng: &mut StdRng,
    ) -> NowcastingResult<Vec<Location>> {
        if t0s.len() == 1 {
            return Ok(vec![Location::new(100.0, 0.0)]);
        }
        Ok((0..t0s.len()).map(|i| Location::new(i as f64, 0.0)).collect())
    }

    async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = match self.behaviour {
            FakeBehaviour::Fatal => return Err(NowcastingError::Storage("disk gone".into())),
            FakeBehaviour::AlwaysOutOfBounds => {
                return Err(NowcastingError::out_of_bounds(center.to_string(), "nowhere"))
            }
            FakeBehaviour::OutOfBoundsAt(bad) if bad == center => {
                return Err(NowcastingError::out_of_bounds(center.to_string(), "fake grid"))
            }
            FakeBehaviour::NanAt(bad) if bad == center => f32::NAN,
            _ => center.x as f32,
        };
        let center = match self.behaviour {
            FakeBehaviour::WrongCenter => Location::new(center.x + 1.0, center.y),
            _ => center,
        };
        Example::new(t0, center).with_field(self.name, FieldArray::vector_f32("x", vec![value, 1.0]))
    }
}
