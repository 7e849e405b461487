//! Split-level orchestration: candidate t0s, splitting, and the worker pool
//! that builds, persists and uploads batches.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use data_sources::{DataSource, OpticalFlowDataSource, SourceFactory};
use nowcasting_common::time::intersect_sorted;
use nowcasting_common::{Configuration, NowcastingError, NowcastingResult, SplitName};
use storage::ObjectStorage;

use crate::assembler::ExampleAssembler;
use crate::batch::{log_summary, select_anchor, BatchBuilder, BatchSummary};
use crate::persist::Persister;
use crate::split::{split_from_config, Split};
use crate::upload::upload_batch;

/// A batch that could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_idx: usize,
    pub error: String,
}

/// Outcome of one split.
#[derive(Debug, Clone)]
pub struct SplitReport {
    pub split: SplitName,
    pub requested: usize,
    /// Summaries of batches written, ordered by index
    pub batches: Vec<BatchSummary>,
    pub failures: Vec<BatchFailure>,
}

impl SplitReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn examples(&self) -> usize {
        self.batches.iter().map(|b| b.produced).sum()
    }

    pub fn degraded_slots(&self) -> usize {
        self.batches.iter().map(|b| b.failures.len()).sum()
    }
}

/// Drives dataset preparation for one configuration.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Configuration>,
    factory: Arc<dyn SourceFactory>,
    storage: Option<Arc<ObjectStorage>>,
}

impl Pipeline {
    pub fn new(config: Arc<Configuration>, factory: Arc<dyn SourceFactory>) -> Self {
        Self {
            config,
            factory,
            storage: None,
        }
    }

    /// Upload every written batch to `storage`, deleting it locally after.
    pub fn with_storage(mut self, storage: Arc<ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// t0s every source can serve, divided between the splits.
    pub async fn splits(&self) -> NowcastingResult<Split> {
        let sources = self.factory.open_sources().await?;
        let candidates = candidate_timestamps(&sources);
        info!(candidates = candidates.len(), "Computed t0 candidates");
        split_from_config(&candidates, &self.config.split, self.config.process.seed)
    }

    /// Produce every configured split, or only `only`.
    ///
    /// Fatal errors before any batch starts are returned; batch failures are
    /// collected in the reports.
    pub async fn run(&self, only: Option<SplitName>) -> NowcastingResult<Vec<SplitReport>> {
        let split = self.splits().await?;
        let mut reports = Vec::new();
        for name in SplitName::ALL {
            if only.is_some_and(|o| o != name) {
                continue;
            }
            let timestamps = split.get(name).to_vec();
            reports.push(self.run_split(name, Arc::new(timestamps)).await);
        }
        Ok(reports)
    }

    /// Build `n_<split>_batches` batches with `num_workers` worker tasks.
    ///
    /// Worker `w` builds batch indices `w, w + num_workers, ...` with its own
    /// sources. A failed batch is reported; its siblings continue.
    #[instrument(skip(self, timestamps), fields(timestamps = timestamps.len()))]
    pub async fn run_split(&self, split: SplitName, timestamps: Arc<Vec<DateTime<Utc>>>) -> SplitReport {
        let requested = self.config.n_batches(split);
        let mut report = SplitReport {
            split,
            requested,
            batches: Vec::new(),
            failures: Vec::new(),
        };
        if requested == 0 {
            info!(split = split.as_str(), "No batches requested");
            return report;
        }

        let start = Instant::now();
        let workers = self.config.process.num_workers.min(requested);
        info!(split = split.as_str(), batches = requested, workers, "Starting split");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let pipeline = self.clone();
            let timestamps = timestamps.clone();
            let indices: Vec<usize> = (worker..requested).step_by(workers).collect();
            handles.push((
                indices.clone(),
                tokio::spawn(async move { pipeline.run_worker(split, worker, indices, timestamps).await }),
            ));
        }

        for (indices, handle) in handles {
            match handle.await {
                Ok(results) => {
                    for result in results {
                        match result {
                            Ok(summary) => report.batches.push(summary),
                            Err(failure) => report.failures.push(failure),
                        }
                    }
                }
                Err(e) => {
                    error!(split = split.as_str(), error = %e, "Worker task panicked");
                    report.failures.extend(indices.into_iter().map(|batch_idx| BatchFailure {
                        batch_idx,
                        error: format!("worker task failed: {}", e),
                    }));
                }
            }
        }

        report.batches.sort_by_key(|b| b.batch_idx);
        report.failures.sort_by_key(|f| f.batch_idx);

        info!(
            split = split.as_str(),
            written = report.batches.len(),
            failed = report.failures.len(),
            examples = report.examples(),
            degraded_slots = report.degraded_slots(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Split complete"
        );
        report
    }

    async fn run_worker(
        &self,
        split: SplitName,
        worker: usize,
        indices: Vec<usize>,
        timestamps: Arc<Vec<DateTime<Utc>>>,
    ) -> Vec<Result<BatchSummary, BatchFailure>> {
        let fail_all = |indices: &[usize], e: &NowcastingError| {
            indices
                .iter()
                .map(|&batch_idx| {
                    Err(BatchFailure {
                        batch_idx,
                        error: e.to_string(),
                    })
                })
                .collect::<Vec<_>>()
        };

        let sources = match self.factory.open_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                error!(split = split.as_str(), worker, error = %e, "Worker could not open sources");
                return fail_all(&indices, &e);
            }
        };
        let anchor = match select_anchor(&sources) {
            Some(anchor) => anchor,
            None => return fail_all(&indices, &NowcastingError::config("no data sources opened")),
        };
        let assembler = match ExampleAssembler::new(sources) {
            Ok(assembler) => assembler,
            Err(e) => return fail_all(&indices, &e),
        };

        let mut results = Vec::with_capacity(indices.len());
        for batch_idx in indices {
            let result = self
                .build_batch(&assembler, anchor.clone(), &timestamps, split, batch_idx)
                .await
                .map_err(|e| {
                    error!(split = split.as_str(), batch_idx, worker, error = %e, "Batch failed");
                    BatchFailure {
                        batch_idx,
                        error: e.to_string(),
                    }
                });
            results.push(result);
        }
        results
    }

    async fn build_batch(
        &self,
        assembler: &ExampleAssembler,
        anchor: Arc<dyn DataSource>,
        timestamps: &[DateTime<Utc>],
        split: SplitName,
        batch_idx: usize,
    ) -> NowcastingResult<BatchSummary> {
        let config = &self.config;
        let mut builder = BatchBuilder::new(assembler, anchor, timestamps, &config.process, split, batch_idx);
        builder.sample().await?;
        builder.assemble().await?;

        if let (Some(flow), Some(satellite)) = (&config.input_data.optical_flow, &config.input_data.satellite) {
            let window = flow.window(&config.input_data, satellite)?;
            let source = OpticalFlowDataSource::from_batch(builder.snapshot(), flow, window)?;
            let derived = ExampleAssembler::new(vec![Arc::new(source)])?;
            builder.derive(&derived).await?;
        }

        builder.validate()?;
        let path = builder.persist(&Persister::from_config(&config.output))?;

        if let (Some(storage), Some(upload)) = (&self.storage, &config.output.upload) {
            let prefix = format!(
                "{}/{}/{:06}.zarr",
                upload.prefix.trim_matches('/'),
                split.as_str(),
                batch_idx
            );
            upload_batch(storage, &path, &prefix, &config.output.upload_retry).await?;
        } else if self.storage.is_some() {
            warn!("Object storage given without output.upload, keeping batch locally");
        }

        let summary = builder.summary();
        log_summary(&summary);
        Ok(summary)
    }
}

/// Timestamps present in every source's available t0s.
pub fn candidate_timestamps(sources: &[Arc<dyn DataSource>]) -> Vec<DateTime<Utc>> {
    let lists: Vec<Vec<DateTime<Utc>>> = sources.iter().map(|s| s.available_timestamps()).collect();
    intersect_sorted(&lists)
}
