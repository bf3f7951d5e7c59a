//! Cumulative histogram snapshots and the arithmetic done on them.
//!
//! A [`Histogram`] is an immutable observation of a named, bucketed counter
//! at one instant. Two snapshots of the same histogram taken before and after
//! a scenario are subtracted with [`Histogram::diff`]; the result holds only
//! the samples that arrived in between. Statistics (mean, counts above a
//! threshold) are always computed on diffs, never on raw cumulative data.
//!
//! All counting is done with checked arithmetic. A snapshot whose totals do
//! not fit the format is reported as [`HistogramError::Overflow`] instead of
//! wrapping around.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistogramError {
    #[error("cannot diff histogram {after} against a snapshot of {before}")]
    NameMismatch { before: String, after: String },

    #[error("bucket [{min}, {max}) of {name} disappeared between snapshots")]
    MissingBucket { name: String, min: i64, max: i64 },

    #[error("bucket [{min}, {max}) of {name} went backwards: {before} -> {after}")]
    NotMonotonic {
        name: String,
        min: i64,
        max: i64,
        before: i64,
        after: i64,
    },

    #[error("sample totals of {name} overflow the snapshot format")]
    Overflow { name: String },

    #[error("histogram {name} has no samples")]
    Empty { name: String },
}

/// `[min, max)` range with the number of samples that fell into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub min: i64,
    pub max: i64,
    pub count: i64,
}

impl HistogramBucket {
    pub fn new(min: i64, max: i64, count: i64) -> Self {
        Self { min, max, count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    /// Sum of all recorded sample values.
    pub sum: i64,
    pub buckets: Vec<HistogramBucket>,
}

impl Histogram {
    /// The zero snapshot: no samples at all.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sum: 0,
            buckets: Vec::new(),
        }
    }

    /// Number of samples across all buckets.
    pub fn total_count(&self) -> Result<i64, HistogramError> {
        self.buckets.iter().try_fold(0i64, |acc, b| {
            acc.checked_add(b.count)
                .ok_or_else(|| self.overflow())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.count == 0)
    }

    /// Activity between `before` and `self`.
    ///
    /// Each bucket of `self` keeps `self[b] - before[b]`; buckets that end up
    /// with no samples are dropped, so two snapshots with no activity in
    /// between diff to [`Histogram::empty`]. Every bucket of `before` must
    /// still exist in `self` with at least the same count.
    pub fn diff(&self, before: &Histogram) -> Result<Histogram, HistogramError> {
        if self.name != before.name {
            return Err(HistogramError::NameMismatch {
                before: before.name.clone(),
                after: self.name.clone(),
            });
        }
        if self.total_count()? < before.total_count()? {
            let b = before.buckets.first().copied().unwrap_or(HistogramBucket::new(0, 0, 0));
            return Err(HistogramError::NotMonotonic {
                name: self.name.clone(),
                min: b.min,
                max: b.max,
                before: before.total_count()?,
                after: self.total_count()?,
            });
        }
        for old in &before.buckets {
            if old.count == 0 {
                continue;
            }
            if !self
                .buckets
                .iter()
                .any(|b| b.min == old.min && b.max == old.max)
            {
                return Err(HistogramError::MissingBucket {
                    name: self.name.clone(),
                    min: old.min,
                    max: old.max,
                });
            }
        }

        let mut buckets = Vec::with_capacity(self.buckets.len());
        for new in &self.buckets {
            let old = before
                .buckets
                .iter()
                .find(|b| b.min == new.min && b.max == new.max)
                .map_or(0, |b| b.count);
            if new.count < old {
                return Err(HistogramError::NotMonotonic {
                    name: self.name.clone(),
                    min: new.min,
                    max: new.max,
                    before: old,
                    after: new.count,
                });
            }
            let count = new.count - old;
            if count > 0 {
                buckets.push(HistogramBucket::new(new.min, new.max, count));
            }
        }
        let sum = self
            .sum
            .checked_sub(before.sum)
            .ok_or_else(|| self.overflow())?;
        Ok(Histogram {
            name: self.name.clone(),
            sum,
            buckets,
        })
    }

    /// `Σ(bucket.min × bucket.count) / Σ bucket.count`.
    pub fn mean(&self) -> Result<f64, HistogramError> {
        let total = self.total_count()?;
        if total == 0 {
            return Err(HistogramError::Empty {
                name: self.name.clone(),
            });
        }
        let weighted = self.buckets.iter().try_fold(0i128, |acc, b| {
            acc.checked_add(i128::from(b.min) * i128::from(b.count))
                .ok_or_else(|| self.overflow())
        })?;
        Ok(weighted as f64 / total as f64)
    }

    /// Number of samples in buckets whose lower bound exceeds `threshold`.
    pub fn count_above(&self, threshold: i64) -> Result<i64, HistogramError> {
        self.buckets
            .iter()
            .filter(|b| b.min > threshold)
            .try_fold(0i64, |acc, b| {
                acc.checked_add(b.count).ok_or_else(|| self.overflow())
            })
    }

    /// Smallest bucket lower bound holding samples.
    pub fn min_bucket(&self) -> Option<i64> {
        self.buckets.iter().filter(|b| b.count > 0).map(|b| b.min).min()
    }

    /// Largest bucket lower bound holding samples.
    pub fn max_bucket(&self) -> Option<i64> {
        self.buckets.iter().filter(|b| b.count > 0).map(|b| b.min).max()
    }

    /// Fold another diff of the same histogram into this one.
    ///
    /// Buckets are concatenated rather than merged; statistics stay exact
    /// because they only depend on `(min, count)` pairs.
    pub fn combine(&mut self, other: &Histogram) -> Result<(), HistogramError> {
        if self.name != other.name {
            return Err(HistogramError::NameMismatch {
                before: self.name.clone(),
                after: other.name.clone(),
            });
        }
        self.sum = self
            .sum
            .checked_add(other.sum)
            .ok_or_else(|| self.overflow())?;
        self.buckets.extend_from_slice(&other.buckets);
        self.total_count()?;
        Ok(())
    }

    fn overflow(&self) -> HistogramError {
        HistogramError::Overflow {
            name: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(name: &str, buckets: &[(i64, i64)]) -> Histogram {
        Histogram {
            name: name.into(),
            sum: buckets.iter().map(|(min, count)| min * count).sum(),
            buckets: buckets
                .iter()
                .map(|&(min, count)| HistogramBucket::new(min, min + 1, count))
                .collect(),
        }
    }

    #[test]
    fn diff_keeps_only_new_samples() {
        let before = hist("Ash.A", &[(50, 1), (70, 2)]);
        let after = hist("Ash.A", &[(50, 2), (70, 2), (90, 1)]);
        let d = after.diff(&before).unwrap();
        assert_eq!(d.buckets, vec![
            HistogramBucket::new(50, 51, 1),
            HistogramBucket::new(90, 91, 1)
        ]);
        assert_eq!(d.sum, 140);
        assert_eq!(d.total_count().unwrap(), 2);
    }

    #[test]
    fn identical_snapshots_diff_to_zero() {
        let snap = hist("Ash.A", &[(10, 3), (20, 4)]);
        assert_eq!(snap.diff(&snap).unwrap(), Histogram::empty("Ash.A"));
    }

    #[test]
    fn diff_rejects_incomparable_snapshots() {
        let before = hist("Ash.A", &[(10, 3)]);
        assert!(matches!(
            hist("Ash.B", &[(10, 3)]).diff(&before),
            Err(HistogramError::NameMismatch { .. })
        ));
        assert!(matches!(
            hist("Ash.A", &[(10, 2), (20, 5)]).diff(&before),
            Err(HistogramError::NotMonotonic { .. })
        ));
        assert!(matches!(
            hist("Ash.A", &[(20, 5)]).diff(&before),
            Err(HistogramError::MissingBucket { .. })
        ));
    }

    #[test]
    fn mean_is_bucket_weighted_and_bounded() {
        let d = hist("Ash.A", &[(50, 1), (70, 1)]);
        assert_eq!(d.mean().unwrap(), 60.0);

        let skewed = hist("Ash.A", &[(1, 9), (100, 1)]);
        let m = skewed.mean().unwrap();
        assert!(m >= skewed.min_bucket().unwrap() as f64);
        assert!(m <= skewed.max_bucket().unwrap() as f64);
    }

    #[test]
    fn mean_of_empty_is_an_error() {
        assert_eq!(
            Histogram::empty("Ash.A").mean(),
            Err(HistogramError::Empty {
                name: "Ash.A".into()
            })
        );
    }

    #[test]
    fn count_above_is_strict_and_monotone() {
        let d = hist("Ash.B", &[(40, 2), (50, 3), (60, 2), (75, 1), (90, 1)]);
        assert_eq!(d.count_above(50).unwrap(), 4);
        assert_eq!(d.count_above(80).unwrap(), 1);
        assert!(d.count_above(80).unwrap() <= d.count_above(50).unwrap());
    }

    #[test]
    fn overflow_is_detected() {
        let h = Histogram {
            name: "Ash.A".into(),
            sum: 0,
            buckets: vec![
                HistogramBucket::new(1, 2, i64::MAX),
                HistogramBucket::new(2, 3, 1),
            ],
        };
        assert!(matches!(h.total_count(), Err(HistogramError::Overflow { .. })));
        assert!(matches!(h.mean(), Err(HistogramError::Overflow { .. })));
    }

    #[test]
    fn combine_concatenates_runs() {
        let mut acc = Histogram::empty("Ash.A");
        acc.combine(&hist("Ash.A", &[(50, 1), (70, 1)])).unwrap();
        acc.combine(&hist("Ash.A", &[(80, 2)])).unwrap();
        assert_eq!(acc.total_count().unwrap(), 4);
        assert_eq!(acc.mean().unwrap(), 70.0);
        assert!(acc.combine(&Histogram::empty("Ash.B")).is_err());
    }
}
