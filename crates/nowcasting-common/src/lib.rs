//! Common types and utilities shared across the nowcasting dataset crates.

pub mod config;
pub mod error;
pub mod example;
pub mod retry;
pub mod time;

pub use config::{
    Configuration, GridSourceConfig, InputDataConfig, OpticalFlowConfig, OutputConfig,
    PointSourceConfig, ProcessConfig, SplitConfig, SplitMethod, SplitName, UploadConfig,
    YearSplit,
};
pub use error::{NowcastingError, NowcastingResult};
pub use example::{ArrayData, Batch, DType, Example, FieldArray, Location};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use time::TimeWindow;
