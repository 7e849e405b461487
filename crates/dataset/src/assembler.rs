//! Merging per-source fragments into complete examples.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

use data_sources::DataSource;
use nowcasting_common::{Example, Location, NowcastingError, NowcastingResult};

/// Builds examples from a fixed, ordered set of sources.
pub struct ExampleAssembler {
    sources: Vec<Arc<dyn DataSource>>,
}

impl ExampleAssembler {
    pub fn new(sources: Vec<Arc<dyn DataSource>>) -> NowcastingResult<Self> {
        if sources.is_empty() {
            return Err(NowcastingError::InvalidArgument(
                "an assembler needs at least one source".to_string(),
            ));
        }
        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[Arc<dyn DataSource>] {
        &self.sources
    }

    /// Pull every source's fragment for `(t0, center)` and merge them.
    ///
    /// Fragments are validated with their source's predicate. Recoverable
    /// failures (bounds, missing timestamps, invalid data) propagate so the
    /// caller can redraw; a field name claimed by two sources is
    /// `FieldCollision`.
    pub async fn assemble(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
        let mut example = Example::new(t0, center);
        for fragment in self.fragments(t0, center).await? {
            example.merge(fragment)?;
        }
        Ok(example)
    }

    /// Run these (derived) sources against an existing example and merge
    /// their fragments into it.
    pub async fn derive(&self, mut example: Example) -> NowcastingResult<Example> {
        for fragment in self.fragments(example.t0, example.center).await? {
            example.merge(fragment)?;
        }
        Ok(example)
    }

    async fn fragments(&self, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Vec<Example>> {
        let results = join_all(
            self.sources
                .iter()
                .map(|source| fetch_fragment(source.as_ref(), t0, center)),
        )
        .await;
        results.into_iter().collect()
    }
}

async fn fetch_fragment(source: &dyn DataSource, t0: DateTime<Utc>, center: Location) -> NowcastingResult<Example> {
    let result = async {
        let fragment = source.get_example(t0, center).await?;
        if fragment.t0 != t0 || fragment.center != center {
            return Err(NowcastingError::InconsistentFragment {
                data_source: source.name().to_string(),
                message: format!(
                    "requested {} at {}, got {} at {}",
                    t0, center, fragment.t0, fragment.center
                ),
            });
        }
        source.validate(&fragment)?;
        Ok(fragment)
    }
    .await;

    if let Err(e) = &result {
        match e {
            NowcastingError::DataValidation { field, reason, .. } => warn!(
                source = source.name(),
                field = %field,
                reason = %reason,
                t0 = %t0,
                "Rejected fragment"
            ),
            e if e.is_recoverable() => warn!(
                source = source.name(),
                error = %e,
                t0 = %t0,
                "Rejected fragment"
            ),
            _ => {}
        }
    }
    result
}
