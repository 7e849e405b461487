//! Building one batch: sampling, assembly with bounded redraws, derivation
//! and validation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use data_sources::{DataSource, SourceKind};
use nowcasting_common::{Batch, Example, Location, NowcastingError, NowcastingResult, ProcessConfig, SplitName};

use crate::assembler::ExampleAssembler;
use crate::persist::Persister;

/// Where a batch is in its lifecycle. Stages only advance in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchStage {
    Empty,
    Sampling,
    Assembling,
    Validated,
    Serialized,
}

impl BatchStage {
    fn next(self) -> Option<BatchStage> {
        match self {
            Self::Empty => Some(Self::Sampling),
            Self::Sampling => Some(Self::Assembling),
            Self::Assembling => Some(Self::Validated),
            Self::Validated => Some(Self::Serialized),
            Self::Serialized => None,
        }
    }
}

/// A slot that produced no example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFailure {
    pub slot: usize,
    /// Draws tried, including the first.
    pub attempts: u32,
    pub error: String,
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub split: SplitName,
    pub batch_idx: usize,
    pub requested: usize,
    pub produced: usize,
    /// Redraws across all slots that eventually succeeded or degraded.
    pub redraws: u32,
    pub failures: Vec<SlotFailure>,
}

/// Outcome of a slot's retry loop.
enum SlotOutcome {
    Assembled { example: Example, attempts: u32 },
    Degraded(SlotFailure),
}

/// The source whose locations anchor each example: the first PV source,
/// else GSP, else the first grid source.
pub fn select_anchor(sources: &[Arc<dyn DataSource>]) -> Option<Arc<dyn DataSource>> {
    [SourceKind::Pv, SourceKind::Gsp]
        .iter()
        .find_map(|kind| sources.iter().find(|s| s.kind() == *kind))
        .or_else(|| sources.iter().find(|s| s.kind().is_grid()))
        .or_else(|| sources.first())
        .cloned()
}

/// SplitMix64 finaliser, used to derive independent seeds.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Seed of the batch-level RNG for `(seed, split, batch_idx)`.
pub fn batch_seed(seed: u64, split: SplitName, batch_idx: usize) -> u64 {
    mix(mix(mix(seed) ^ split.index()) ^ batch_idx as u64)
}

fn slot_seed(batch_seed: u64, slot: usize) -> u64 {
    mix(batch_seed ^ mix(slot as u64 + 1))
}

/// Shared, read-only inputs of every slot's retry loop.
struct SlotContext<'a> {
    assembler: &'a ExampleAssembler,
    anchor: &'a dyn DataSource,
    timestamps: &'a [DateTime<Utc>],
    max_retries: u32,
}

impl SlotContext<'_> {
    async fn draw(&self, rng: &mut StdRng) -> NowcastingResult<(DateTime<Utc>, Location)> {
        let t0 = *self
            .timestamps
            .choose(rng)
            .ok_or_else(|| NowcastingError::InvalidArgument("no timestamps to draw from".into()))?;
        let center = self
            .anchor
            .get_locations_for_batch(&[t0], rng)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| NowcastingError::internal("anchor returned no location"))?;
        Ok((t0, center))
    }

    /// Assemble one slot, redrawing on recoverable failures until the
    /// budget is spent.
    async fn run(
        &self,
        slot: usize,
        seed: u64,
        first: Option<(DateTime<Utc>, Location)>,
    ) -> NowcastingResult<SlotOutcome> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut next = first;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = match next.take() {
                Some((t0, center)) => self.assembler.assemble(t0, center).await,
                None => match self.draw(&mut rng).await {
                    Ok((t0, center)) => self.assembler.assemble(t0, center).await,
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(example) => return Ok(SlotOutcome::Assembled { example, attempts }),
                Err(e) if e.is_recoverable() => {
                    if attempts > self.max_retries {
                        warn!(slot, attempts, error = %e, "Slot degraded");
                        return Ok(SlotOutcome::Degraded(SlotFailure {
                            slot,
                            attempts,
                            error: e.to_string(),
                        }));
                    }
                    debug!(slot, attempts, error = %e, "Redrawing slot");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builds one batch through `Empty -> Sampling -> Assembling -> Validated ->
/// Serialized`.
pub struct BatchBuilder<'a> {
    stage: BatchStage,
    split: SplitName,
    batch_idx: usize,
    batch_size: usize,
    max_retries: u32,
    seed: u64,
    assembler: &'a ExampleAssembler,
    anchor: Arc<dyn DataSource>,
    timestamps: &'a [DateTime<Utc>],
    draws: Vec<Option<(DateTime<Utc>, Location)>>,
    /// Assembled examples and the slot each came from.
    examples: Vec<(usize, Example)>,
    redraws: u32,
    failures: Vec<SlotFailure>,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(
        assembler: &'a ExampleAssembler,
        anchor: Arc<dyn DataSource>,
        timestamps: &'a [DateTime<Utc>],
        process: &ProcessConfig,
        split: SplitName,
        batch_idx: usize,
    ) -> Self {
        Self {
            stage: BatchStage::Empty,
            split,
            batch_idx,
            batch_size: process.batch_size,
            max_retries: process.max_example_retries,
            seed: batch_seed(process.seed, split, batch_idx),
            assembler,
            anchor,
            timestamps,
            draws: Vec::new(),
            examples: Vec::new(),
            redraws: 0,
            failures: Vec::new(),
        }
    }

    pub fn stage(&self) -> BatchStage {
        self.stage
    }

    fn advance(&mut self, to: BatchStage) -> NowcastingResult<()> {
        if self.stage.next() != Some(to) {
            return Err(NowcastingError::internal(format!(
                "batch {} {}: illegal transition {:?} -> {:?}",
                self.split, self.batch_idx, self.stage, to
            )));
        }
        debug!(split = self.split.as_str(), batch_idx = self.batch_idx, stage = ?to, "Batch stage");
        self.stage = to;
        Ok(())
    }

    /// Draw `batch_size` t0s and the anchor's locations for them.
    ///
    /// If the anchor cannot place the whole draw, each slot draws its own
    /// location during assembly instead.
    pub async fn sample(&mut self) -> NowcastingResult<()> {
        self.advance(BatchStage::Sampling)?;
        if self.timestamps.is_empty() {
            return Err(NowcastingError::InvalidArgument(format!(
                "split {} has no usable timestamps",
                self.split
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let t0s: Vec<DateTime<Utc>> = (0..self.batch_size)
            .filter_map(|_| self.timestamps.choose(&mut rng).copied())
            .collect();

        self.draws = match self.anchor.get_locations_for_batch(&t0s, &mut rng).await {
            Ok(centers) if centers.len() == t0s.len() => t0s.into_iter().zip(centers).map(Some).collect(),
            Ok(centers) => {
                return Err(NowcastingError::internal(format!(
                    "{} returned {} locations for {} t0s",
                    self.anchor.name(),
                    centers.len(),
                    t0s.len()
                )))
            }
            Err(e) if e.is_recoverable() => {
                warn!(source = self.anchor.name(), error = %e, "Batch draw failed, drawing per slot");
                vec![None; self.batch_size]
            }
            Err(e) => return Err(e),
        };
        Ok(())
    }

    /// Assemble every slot concurrently; results stay in slot order.
    ///
    /// A fatal error from any slot aborts the batch.
    pub async fn assemble(&mut self) -> NowcastingResult<()> {
        self.advance(BatchStage::Assembling)?;
        let ctx = SlotContext {
            assembler: self.assembler,
            anchor: self.anchor.as_ref(),
            timestamps: self.timestamps,
            max_retries: self.max_retries,
        };

        let outcomes = join_all(
            self.draws
                .iter()
                .enumerate()
                .map(|(slot, first)| ctx.run(slot, slot_seed(self.seed, slot), *first)),
        )
        .await;

        for (slot, outcome) in outcomes.into_iter().enumerate() {
            match outcome? {
                SlotOutcome::Assembled { example, attempts } => {
                    self.redraws += attempts - 1;
                    self.examples.push((slot, example));
                }
                SlotOutcome::Degraded(failure) => {
                    self.redraws += failure.attempts - 1;
                    self.failures.push(failure);
                }
            }
        }
        Ok(())
    }

    /// The examples assembled so far, for building derived sources.
    pub fn snapshot(&self) -> Arc<Batch> {
        Arc::new(Batch::new(self.examples.iter().map(|(_, e)| e.clone()).collect()))
    }

    /// Run derived sources over every assembled example.
    ///
    /// Examples whose derivation fails recoverably are dropped and recorded
    /// as failures of their slot.
    pub async fn derive(&mut self, derived: &ExampleAssembler) -> NowcastingResult<()> {
        if self.stage != BatchStage::Assembling {
            return Err(NowcastingError::internal(format!(
                "derivation requires an assembling batch, stage is {:?}",
                self.stage
            )));
        }

        let examples = std::mem::take(&mut self.examples);
        let results = join_all(examples.into_iter().map(|(slot, example)| async move {
            (slot, derived.derive(example).await)
        }))
        .await;

        for (slot, result) in results {
            match result {
                Ok(example) => self.examples.push((slot, example)),
                Err(e) if e.is_recoverable() => {
                    warn!(slot, error = %e, "Derivation failed, dropping example");
                    self.failures.push(SlotFailure {
                        slot,
                        attempts: 1,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.failures.sort_by_key(|f| f.slot);
        Ok(())
    }

    /// Check every example shares field names, shapes and dtypes.
    pub fn validate(&mut self) -> NowcastingResult<()> {
        self.advance(BatchStage::Validated)?;
        let batch = Batch::new(self.examples.iter().map(|(_, e)| e.clone()).collect());
        batch.ensure_uniform()?;
        if batch.is_empty() {
            warn!(
                split = self.split.as_str(),
                batch_idx = self.batch_idx,
                "Every slot degraded, batch is empty"
            );
        }
        Ok(())
    }

    /// Write the validated batch.
    pub fn persist(&mut self, persister: &Persister) -> NowcastingResult<PathBuf> {
        self.advance(BatchStage::Serialized)?;
        let batch = Batch::new(self.examples.iter().map(|(_, e)| e.clone()).collect());
        persister.write(&batch, self.split, self.batch_idx)
    }

    /// Consume the builder, returning the examples and the summary.
    pub fn finish(self) -> (Batch, BatchSummary) {
        let summary = self.summary();
        let batch = Batch::new(self.examples.into_iter().map(|(_, e)| e).collect());
        (batch, summary)
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            split: self.split,
            batch_idx: self.batch_idx,
            requested: self.batch_size,
            produced: self.examples.len(),
            redraws: self.redraws,
            failures: self.failures.clone(),
        }
    }
}

/// Log a batch summary at info level.
pub fn log_summary(summary: &BatchSummary) {
    info!(
        split = summary.split.as_str(),
        batch_idx = summary.batch_idx,
        requested = summary.requested,
        produced = summary.produced,
        redraws = summary.redraws,
        failures = summary.failures.len(),
        "Batch complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehaviour, FakeSource};
    use test_utils::{reference_start, regular_timestamps};

    fn process(batch_size: usize, retries: u32) -> ProcessConfig {
        ProcessConfig {
            batch_size,
            seed: 99,
            max_example_retries: retries,
            num_workers: 1,
            n_train_batches: 1,
            n_validation_batches: 0,
            n_test_batches: 0,
            read_retry: Default::default(),
        }
    }

    async fn build(
        sources: Vec<Arc<dyn DataSource>>,
        retries: u32,
    ) -> NowcastingResult<(Batch, BatchSummary)> {
        let timestamps = regular_timestamps(reference_start(), 5, 20);
        let anchor = select_anchor(&sources).unwrap();
        let assembler = ExampleAssembler::new(sources)?;
        let process = process(10, retries);

        let mut builder = BatchBuilder::new(&assembler, anchor, &timestamps, &process, SplitName::Train, 0);
        builder.sample().await?;
        builder.assemble().await?;
        builder.validate()?;
        Ok(builder.finish())
    }

    #[tokio::test]
    async fn test_full_batch() {
        let (batch, summary) = build(vec![Arc::new(FakeSource::new("a", FakeBehaviour::Ok))], 3)
            .await
            .unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(summary.produced, 10);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.redraws, 0);
        // Slot order is kept: slot i is centred at x = i.
        for (i, example) in batch.examples.iter().enumerate() {
            assert_eq!(example.center.x, i as f64);
        }
    }

    #[tokio::test]
    async fn test_one_persistently_invalid_slot() {
        let sources: Vec<Arc<dyn DataSource>> = vec![
            Arc::new(FakeSource::new("a", FakeBehaviour::Ok)),
            Arc::new(FakeSource::new("b", FakeBehaviour::NanAt(Location::new(3.0, 0.0)))),
        ];
        let (batch, summary) = build(sources, 0).await.unwrap();

        assert_eq!(batch.len(), 9);
        assert_eq!(summary.requested, 10);
        assert_eq!(summary.produced, 9);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].slot, 3);
        assert_eq!(summary.failures[0].attempts, 1);
        assert!(batch.examples.iter().all(|e| e.center.x != 3.0));
    }

    #[tokio::test]
    async fn test_redraw_recovers_slot() {
        let sources: Vec<Arc<dyn DataSource>> =
            vec![Arc::new(FakeSource::new("a", FakeBehaviour::OutOfBoundsAt(Location::new(3.0, 0.0))))];
        let (batch, summary) = build(sources, 2).await.unwrap();

        assert_eq!(batch.len(), 10);
        assert_eq!(summary.redraws, 1);
        // The redrawn slot keeps its position.
        assert_eq!(batch.examples[3].center.x, 100.0);
    }

    #[tokio::test]
    async fn test_every_slot_degraded() {
        let source = Arc::new(FakeSource::new("a", FakeBehaviour::AlwaysOutOfBounds));
        let (batch, summary) = build(vec![source.clone()], 2).await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(summary.failures.len(), 10);
        assert!(summary.failures.iter().all(|f| f.attempts == 3));
        assert_eq!(source.calls(), 30);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(FakeSource::new("a", FakeBehaviour::Fatal))];
        assert!(matches!(build(sources, 5).await, Err(NowcastingError::Storage(_))));
    }

    #[tokio::test]
    async fn test_derivation_drops_failures() {
        let timestamps = regular_timestamps(reference_start(), 5, 20);
        let sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(FakeSource::new("a", FakeBehaviour::Ok))];
        let anchor = select_anchor(&sources).unwrap();
        let assembler = ExampleAssembler::new(sources).unwrap();
        let derived = ExampleAssembler::new(vec![Arc::new(FakeSource::new(
            "d",
            FakeBehaviour::OutOfBoundsAt(Location::new(5.0, 0.0)),
        ))])
        .unwrap();
        let process = process(10, 0);

        let mut builder = BatchBuilder::new(&assembler, anchor, &timestamps, &process, SplitName::Train, 0);
        builder.sample().await.unwrap();
        builder.assemble().await.unwrap();
        builder.derive(&derived).await.unwrap();
        builder.validate().unwrap();
        let (batch, summary) = builder.finish();

        assert_eq!(batch.len(), 9);
        assert_eq!(summary.failures[0].slot, 5);
        assert!(batch.examples.iter().all(|e| e.field("d").is_some()));
    }

    #[tokio::test]
    async fn test_illegal_transition() {
        let timestamps = regular_timestamps(reference_start(), 5, 20);
        let sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(FakeSource::new("a", FakeBehaviour::Ok))];
        let anchor = select_anchor(&sources).unwrap();
        let assembler = ExampleAssembler::new(sources).unwrap();
        let process = process(2, 0);

        let mut builder = BatchBuilder::new(&assembler, anchor, &timestamps, &process, SplitName::Test, 4);
        assert!(matches!(builder.assemble().await, Err(NowcastingError::Internal(_))));
        assert!(matches!(builder.validate(), Err(NowcastingError::Internal(_))));
        assert_eq!(builder.stage(), BatchStage::Empty);
    }

    #[test]
    fn test_seeds_are_distinct_and_stable() {
        let a = batch_seed(1, SplitName::Train, 0);
        assert_eq!(a, batch_seed(1, SplitName::Train, 0));
        assert_ne!(a, batch_seed(1, SplitName::Train, 1));
        assert_ne!(a, batch_seed(1, SplitName::Validation, 0));
        assert_ne!(a, batch_seed(2, SplitName::Train, 0));
        assert_ne!(slot_seed(a, 0), slot_seed(a, 1));
    }

    #[test]
    fn test_anchor_prefers_stations() {
        struct Kind(SourceKind);
        #[async_trait::async_trait]
        impl DataSource for Kind {
            fn kind(&self) -> SourceKind {
                self.0
            }
            fn available_timestamps(&self) -> Vec<DateTime<Utc>> {
                Vec::new()
            }
            async fn get_locations_for_batch(
                &self,
                _t0s: &[DateTime<Utc>],
                _rng: &mut StdRng,
            ) -> NowcastingResult<Vec<Location>> {
                Ok(Vec::new())
            }
            async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
                Ok(Example::new(t0, center))
            }
        }

        let sources: Vec<Arc<dyn DataSource>> = vec![
            Arc::new(Kind(SourceKind::Satellite)),
            Arc::new(Kind(SourceKind::Gsp)),
            Arc::new(Kind(SourceKind::Pv)),
        ];
        assert_eq!(select_anchor(&sources).unwrap().kind(), SourceKind::Pv);
        assert_eq!(select_anchor(&sources[..2]).unwrap().kind(), SourceKind::Gsp);
        assert_eq!(select_anchor(&sources[..1]).unwrap().kind(), SourceKind::Satellite);
        assert!(select_anchor(&[]).is_none());
    }
}
