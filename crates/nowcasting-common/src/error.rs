//! Error types for the nowcasting dataset pipeline.

use thiserror::Error;

/// Result type alias using NowcastingError.
pub type NowcastingResult<T> = Result<T, NowcastingError>;

/// Primary error type for dataset preparation.
///
/// Variants fall into three classes, see [`NowcastingError::is_recoverable`]
/// and [`NowcastingError::is_transient`]. Everything else is fatal.
#[derive(Debug, Error)]
pub enum NowcastingError {
    // === Setup Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unsupported split method: {0}")]
    UnsupportedSplitMethod(String),

    // === Sampling Errors (recoverable) ===
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Requested region {requested} is outside {extent}")]
    OutOfBounds { requested: String, extent: String },

    #[error("Only {found} of {required} entities available near ({x}, {y})")]
    InsufficientEntities {
        required: usize,
        found: usize,
        x: f64,
        y: f64,
    },

    #[error("Timestamp not available: {0}")]
    TimestampUnavailable(String),

    #[error("Inconsistent fragment from {data_source}: {message}")]
    InconsistentFragment { data_source: String, message: String },

    #[error("Validation failed for {data_source}.{field}: {reason}")]
    DataValidation {
        data_source: String,
        field: String,
        reason: String,
    },

    // === I/O Errors ===
    #[error("I/O error ({}): {message}", if *.transient { "transient" } else { "permanent" })]
    Io { transient: bool, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Zarr error: {0}")]
    Zarr(String),

    // === Programming Errors ===
    #[error("Field collision: {0}")]
    FieldCollision(String),

    #[error("Batch shape mismatch: {0}")]
    BatchShapeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NowcastingError {
    /// Whether the example slot may be retried with a fresh (t0, location) draw.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NowcastingError::InvalidCoordinate(_)
                | NowcastingError::OutOfBounds { .. }
                | NowcastingError::InsufficientEntities { .. }
                | NowcastingError::TimestampUnavailable(_)
                | NowcastingError::InconsistentFragment { .. }
                | NowcastingError::DataValidation { .. }
        )
    }

    /// Whether the same operation may be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, NowcastingError::Io { transient: true, .. })
    }

    /// Create an InvalidConfiguration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an OutOfBounds error.
    pub fn out_of_bounds(requested: impl Into<String>, extent: impl Into<String>) -> Self {
        Self::OutOfBounds {
            requested: requested.into(),
            extent: extent.into(),
        }
    }

    /// Create a DataValidation error.
    pub fn validation(
        data_source: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DataValidation {
            data_source: data_source.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient I/O error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Io {
            transient: true,
            message: msg.into(),
        }
    }

    /// Create a permanent I/O error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Io {
            transient: false,
            message: msg.into(),
        }
    }

    /// Create a Zarr error.
    pub fn zarr(msg: impl Into<String>) -> Self {
        Self::Zarr(msg.into())
    }

    /// Create an Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<geospatial::GeoError> for NowcastingError {
    fn from(err: geospatial::GeoError) -> Self {
        NowcastingError::InvalidCoordinate(err.to_string())
    }
}

// Local filesystem failures are not retried.
impl From<std::io::Error> for NowcastingError {
    fn from(err: std::io::Error) -> Self {
        let transient = matches!(
            err.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        );
        NowcastingError::Io {
            transient,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for NowcastingError {
    fn from(err: serde_json::Error) -> Self {
        NowcastingError::Zarr(format!("JSON attribute error: {}", err))
    }
}

impl From<serde_yaml::Error> for NowcastingError {
    fn from(err: serde_yaml::Error) -> Self {
        NowcastingError::InvalidConfiguration(format!("YAML error: {}", err))
    }
}
