//! History/forecast windows around a target timestamp.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::ops::Range;

use crate::error::{NowcastingError, NowcastingResult};

/// A sampling window: `history` before t0, t0 itself, and `forecast` after,
/// at a fixed period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub history_minutes: i64,
    pub forecast_minutes: i64,
    pub sample_period_minutes: i64,
}

impl TimeWindow {
    /// Create a window, checking that both spans are non-negative multiples
    /// of the sample period.
    pub fn new(
        history_minutes: i64,
        forecast_minutes: i64,
        sample_period_minutes: i64,
    ) -> NowcastingResult<Self> {
        if sample_period_minutes <= 0 {
            return Err(NowcastingError::config(format!(
                "sample_period_minutes must be > 0, got {}",
                sample_period_minutes
            )));
        }
        for (name, value) in [("history_minutes", history_minutes), ("forecast_minutes", forecast_minutes)] {
            if value < 0 || value % sample_period_minutes != 0 {
                return Err(NowcastingError::config(format!(
                    "{} ({}) must be a non-negative multiple of the sample period ({})",
                    name, value, sample_period_minutes
                )));
            }
        }
        Ok(Self {
            history_minutes,
            forecast_minutes,
            sample_period_minutes,
        })
    }

    pub fn history_steps(&self) -> usize {
        (self.history_minutes / self.sample_period_minutes) as usize
    }

    pub fn forecast_steps(&self) -> usize {
        (self.forecast_minutes / self.sample_period_minutes) as usize
    }

    /// Number of timesteps in the window, including t0.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.history_steps() + 1 + self.forecast_steps()
    }

    pub fn period(&self) -> Duration {
        Duration::minutes(self.sample_period_minutes)
    }

    pub fn start(&self, t0: DateTime<Utc>) -> DateTime<Utc> {
        t0 - Duration::minutes(self.history_minutes)
    }

    pub fn end(&self, t0: DateTime<Utc>) -> DateTime<Utc> {
        t0 + Duration::minutes(self.forecast_minutes)
    }

    /// Every timestamp in the window, oldest first.
    pub fn timestamps(&self, t0: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let start = self.start(t0);
        (0..self.len())
            .map(|i| start + self.period() * i as i32)
            .collect()
    }

    /// Index range of the window in a sorted timestamp axis.
    ///
    /// Fails with `TimestampUnavailable` unless every window timestamp is
    /// present and contiguous in `times`.
    pub fn locate(&self, times: &[DateTime<Utc>], t0: DateTime<Utc>) -> NowcastingResult<Range<usize>> {
        let unavailable = || {
            NowcastingError::TimestampUnavailable(format!(
                "window {} .. {} around {}",
                self.start(t0),
                self.end(t0),
                t0
            ))
        };

        let idx = times.binary_search(&t0).map_err(|_| unavailable())?;
        let start = idx.checked_sub(self.history_steps()).ok_or_else(unavailable)?;
        let end = idx + self.forecast_steps() + 1;
        if end > times.len() {
            return Err(unavailable());
        }

        let expected = self.timestamps(t0);
        if times[start..end] != expected[..] {
            return Err(unavailable());
        }
        Ok(start..end)
    }

    /// t0 candidates that [`TimeWindow::locate`] accepts in `times`.
    ///
    /// Edge timestamps are excluded, never clamped.
    pub fn available_t0s(&self, times: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
        times
            .iter()
            .copied()
            .filter(|t0| self.locate(times, *t0).is_ok())
            .collect()
    }
}

/// Seconds since the Unix epoch for each timestamp.
pub fn to_unix_seconds(times: &[DateTime<Utc>]) -> Vec<i64> {
    times.iter().map(|t| t.timestamp()).collect()
}

/// Inverse of [`to_unix_seconds`].
pub fn from_unix_seconds(seconds: i64) -> NowcastingResult<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| NowcastingError::InvalidArgument(format!("timestamp out of range: {}", seconds)))
}

/// Parse a list of Unix-second timestamps.
pub fn from_unix_seconds_many(seconds: &[i64]) -> NowcastingResult<Vec<DateTime<Utc>>> {
    seconds.iter().map(|s| from_unix_seconds(*s)).collect()
}

/// Strict intersection of several sorted timestamp lists, preserving order.
pub fn intersect_sorted(lists: &[Vec<DateTime<Utc>>]) -> Vec<DateTime<Utc>> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let sets: Vec<HashSet<&DateTime<Utc>>> = rest.iter().map(|l| l.iter().collect()).collect();
    first
        .iter()
        .filter(|t| sets.iter().all(|s| s.contains(t)))
        .copied()
        .collect()
}
