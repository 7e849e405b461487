//! The data-source capability shared by every source variant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;

use nowcasting_common::{Example, Location, NowcastingError, NowcastingResult};

use crate::types::SourceKind;
use crate::validation;

/// A source of example fragments around `(t0, center)`.
///
/// Implementations own their store handles; a handle is never shared between
/// workers.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> SourceKind;

    /// Name used in logs and validation errors.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// t0 candidates whose full history and forecast window exists.
    ///
    /// Edge timestamps are excluded, never clamped.
    fn available_timestamps(&self) -> Vec<DateTime<Utc>>;

    /// One center per t0, drawn with `rng`.
    async fn get_locations_for_batch(
        &self,
        t0s: &[DateTime<Utc>],
        rng: &mut StdRng,
    ) -> NowcastingResult<Vec<Location>>;

    /// Extract this source's fragment for one example.
    async fn get_example(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example>;

    /// Extract fragments for several examples.
    ///
    /// The result is identical to calling [`DataSource::get_example`] for
    /// each pair in order.
    async fn get_batch(
        &self,
        t0s: &[DateTime<Utc>],
        centers: &[Location],
    ) -> NowcastingResult<Vec<Example>> {
        if t0s.len() != centers.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} t0s but {} centers",
                t0s.len(),
                centers.len()
            )));
        }
        let mut examples = Vec::with_capacity(t0s.len());
        for (t0, center) in t0s.iter().zip(centers) {
            examples.push(self.get_example(*t0, *center).await?);
        }
        Ok(examples)
    }

    /// Check a fragment against this variant's validity predicate.
    fn validate(&self, example: &Example) -> NowcastingResult<()> {
        validation::validate_fragment(self.kind(), example)
    }
}
