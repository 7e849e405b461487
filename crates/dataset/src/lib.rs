//! Dataset preparation: splitting t0s, assembling examples into batches,
//! and writing batches as Zarr directories.
//!
//! # Architecture
//!
//! ```text
//! SourceFactory ──▶ Pipeline ──▶ worker 0..n ──▶ BatchBuilder
//!                      │                           │  sample
//!                      ▼                           │  assemble ◀── ExampleAssembler
//!                    Split                         │  derive   ◀── OpticalFlowDataSource
//!                                                  │  validate
//!                                                  ▼
//!                                              Persister ──▶ upload_batch
//! ```

pub mod assembler;
pub mod batch;
pub mod persist;
pub mod pipeline;
pub mod split;
pub mod upload;

#[cfg(test)]
mod testing;

pub use assembler::ExampleAssembler;
pub use batch::{select_anchor, BatchBuilder, BatchStage, BatchSummary, SlotFailure};
pub use persist::{load, Persister, FORMAT_VERSION};
pub use pipeline::{candidate_timestamps, BatchFailure, Pipeline, SplitReport};
pub use split::{split, split_from_config, Split};
pub use upload::{upload_batch, UploadResult};
