//! Error types for coordinate transforms.

use thiserror::Error;

/// Result type alias using GeoError.
pub type GeoResult<T> = Result<T, GeoError>;

/// Errors raised by coordinate transforms.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoError {
    /// NaN or infinite input coordinate.
    #[error("invalid coordinate ({first}, {second}): {reason}")]
    InvalidCoordinate {
        first: f64,
        second: f64,
        reason: String,
    },

    /// Coordinate slices of different lengths.
    #[error("coordinate length mismatch: {first} vs {second}")]
    LengthMismatch { first: usize, second: usize },
}

impl GeoError {
    /// Create an InvalidCoordinate error.
    pub fn invalid(first: f64, second: f64, reason: impl Into<String>) -> Self {
        Self::InvalidCoordinate {
            first,
            second,
            reason: reason.into(),
        }
    }
}

/// Reject NaN and infinite coordinate pairs.
pub(crate) fn ensure_finite(first: f64, second: f64) -> GeoResult<()> {
    if first.is_finite() && second.is_finite() {
        Ok(())
    } else {
        Err(GeoError::invalid(first, second, "coordinates must be finite"))
    }
}
