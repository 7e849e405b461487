//! Dividing t0 candidates between train, validation and test.

use chrono::{DateTime, Datelike, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::info;

use nowcasting_common::{NowcastingError, NowcastingResult, SplitConfig, SplitMethod, SplitName, YearSplit};

/// Timestamps for each split, each in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<DateTime<Utc>>,
    pub validation: Vec<DateTime<Utc>>,
    pub test: Vec<DateTime<Utc>>,
}

impl Split {
    pub fn get(&self, name: SplitName) -> &[DateTime<Utc>] {
        match name {
            SplitName::Train => &self.train,
            SplitName::Validation => &self.validation,
            SplitName::Test => &self.test,
        }
    }

    fn push(&mut self, name: SplitName, t: DateTime<Utc>) {
        match name {
            SplitName::Train => self.train.push(t),
            SplitName::Validation => self.validation.push(t),
            SplitName::Test => self.test.push(t),
        }
    }

    /// Assign every timestamp with `assign`; `None` drops it.
    fn from_assignment<F>(timestamps: &[DateTime<Utc>], mut assign: F) -> Self
    where
        F: FnMut(&DateTime<Utc>) -> Option<SplitName>,
    {
        let mut split = Split::default();
        for t in timestamps {
            if let Some(name) = assign(t) {
                split.push(name, *t);
            }
        }
        split
    }
}

/// Split according to the configuration section.
pub fn split_from_config(
    timestamps: &[DateTime<Utc>],
    config: &SplitConfig,
    seed: u64,
) -> NowcastingResult<Split> {
    split(timestamps, config.method()?, config.ratios, &config.years, seed)
}

/// Split `timestamps` with `method`.
///
/// `ratios` are train/validation/test proportions for the day and week
/// methods; `years` maps years for [`SplitMethod::Year`]. Random methods
/// shuffle with a `StdRng` seeded from `seed`, so equal inputs give equal
/// splits.
pub fn split(
    timestamps: &[DateTime<Utc>],
    method: SplitMethod,
    ratios: [u32; 3],
    years: &YearSplit,
    seed: u64,
) -> NowcastingResult<Split> {
    if ratios.iter().any(|r| *r == 0) {
        return Err(NowcastingError::config(format!(
            "split ratios must all be > 0, got {:?}",
            ratios
        )));
    }

    let result = match method {
        SplitMethod::Same => Split {
            train: timestamps.to_vec(),
            validation: timestamps.to_vec(),
            test: timestamps.to_vec(),
        },
        SplitMethod::Day => Split::from_assignment(timestamps, |t| Some(by_modulo(t.ordinal(), ratios))),
        SplitMethod::Week => {
            Split::from_assignment(timestamps, |t| Some(by_modulo(t.iso_week().week(), ratios)))
        }
        SplitMethod::DayRandom => {
            let assignment = shuffled_assignment(timestamps, |t| t.date_naive(), ratios, seed);
            Split::from_assignment(timestamps, |t| assignment.get(&t.date_naive()).copied())
        }
        SplitMethod::WeekRandom => {
            let week = |t: &DateTime<Utc>| {
                let w = t.iso_week();
                (w.year(), w.week())
            };
            let assignment = shuffled_assignment(timestamps, week, ratios, seed);
            Split::from_assignment(timestamps, |t| assignment.get(&week(t)).copied())
        }
        SplitMethod::Year => Split::from_assignment(timestamps, |t| years.split_for(t.year())),
    };

    info!(
        method = %method,
        train = result.train.len(),
        validation = result.validation.len(),
        test = result.test.len(),
        "Split timestamps"
    );
    Ok(result)
}

/// `period % (a + b + c)`: below `a` is train, below `a + b` validation.
fn by_modulo(period: u32, [a, b, c]: [u32; 3]) -> SplitName {
    let m = period % (a + b + c);
    if m < a {
        SplitName::Train
    } else if m < a + b {
        SplitName::Validation
    } else {
        SplitName::Test
    }
}

/// Shuffle the distinct `key`s and cut them proportionally to `ratios`.
fn shuffled_assignment<K, F>(
    timestamps: &[DateTime<Utc>],
    key: F,
    [a, b, c]: [u32; 3],
    seed: u64,
) -> HashMap<K, SplitName>
where
    K: Eq + Hash + Ord + Copy,
    F: Fn(&DateTime<Utc>) -> K,
{
    let mut keys: Vec<K> = timestamps.iter().map(key).collect();
    keys.sort();
    keys.dedup();

    let mut rng = StdRng::seed_from_u64(seed);
    keys.shuffle(&mut rng);

    let n = keys.len() as u64;
    let total = (a + b + c) as u64;
    let n_train = (n * a as u64 / total) as usize;
    let n_validation = (n * b as u64 / total) as usize;

    keys.into_iter()
        .enumerate()
        .map(|(i, k)| {
            let name = if i < n_train {
                SplitName::Train
            } else if i < n_train + n_validation {
                SplitName::Validation
            } else {
                SplitName::Test
            };
            (k, name)
        })
        .collect()
}
