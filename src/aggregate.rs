//! Multi-iteration aggregation.
//!
//! The [`Runner`](crate::Runner) collects the samples of every iteration into
//! an [`Aggregation`], which keeps the raw per-iteration values and only
//! derives summaries when it is turned into [`PerfValues`]. How a metric is
//! summarized is decided per metric by a [`StoreStrategy`].
//!
//! # Strategies
//!
//! | strategy                  | reported                                             |
//! |---------------------------|------------------------------------------------------|
//! | `StoreAll`                | every iteration value, as a multi-value metric       |
//! | `StoreMean`               | the arithmetic mean                                  |
//! | `StoreLatency`            | variants `mean`, `p50` and `p95`                     |
//! | `StoreAllWithHeuristics`  | every value plus the median under variant `median`   |
//!
//! Percentiles use the nearest-rank method. `StoreAllWithHeuristics` also
//! infers unit and direction from the metric name: `AnimationSmoothness`
//! metrics are percentages where bigger is better, `Latency`,
//! `PresentationTime` and `Duration` metrics are milliseconds where smaller
//! is better.
//!
//! Iterations that produced no sample for a metric contribute nothing to
//! it; a metric with no samples at all is not reported.
//!
//! # Example
//! ```rust
//! use cuj_recorder::{
//!     aggregate::{Aggregation, StoreStrategy},
//!     metric::{Direction, Unit},
//!     recorder::Sample,
//!     values::PerfMetric,
//! };
//! use std::collections::HashMap;
//!
//! let metric = PerfMetric::new("Ash.A", Unit::Percent, Direction::BiggerIsBetter);
//! let mut agg = Aggregation::new();
//! agg.push_iteration(vec![Sample { metric: metric.clone(), value: 60.0 }]);
//! agg.push_iteration(vec![Sample { metric, value: 80.0 }]);
//!
//! let values = agg.to_values(StoreStrategy::StoreMean, &HashMap::new()).unwrap();
//! assert_eq!(values.values("Ash.A"), Some(&[70.0][..]));
//! ```

use std::{collections::HashMap, fmt, str::FromStr};

use crate::{
    error::Error,
    metric::{Direction, Unit},
    recorder::Sample,
    values::{DEFAULT_VARIANT, PerfMetric, PerfValues, ValuesError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StoreStrategy {
    #[default]
    StoreAll,
    StoreMean,
    StoreLatency,
    StoreAllWithHeuristics,
}

impl FromStr for StoreStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StoreAll" => Ok(StoreStrategy::StoreAll),
            "StoreMean" => Ok(StoreStrategy::StoreMean),
            "StoreLatency" => Ok(StoreStrategy::StoreLatency),
            "StoreAllWithHeuristics" => Ok(StoreStrategy::StoreAllWithHeuristics),
            other => Err(Error::config(format!("unknown store strategy {other:?}"))),
        }
    }
}

impl fmt::Display for StoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
struct Series {
    metric: PerfMetric,
    values: Vec<f64>,
}

/// Per-metric samples of every iteration, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    series: Vec<Series>,
    index: HashMap<(String, String), usize>,
    iterations: usize,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the samples of one iteration.
    pub fn push_iteration(&mut self, samples: impl IntoIterator<Item = Sample>) {
        self.iterations += 1;
        for Sample { metric, value } in samples {
            let key = (metric.name.clone(), metric.variant.clone());
            match self.index.get(&key) {
                Some(&i) => self.series[i].values.push(value),
                None => {
                    self.index.insert(key, self.series.len());
                    self.series.push(Series {
                        metric,
                        values: vec![value],
                    });
                }
            }
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Samples collected so far for `name`'s `summary` variant.
    pub fn samples(&self, name: &str) -> Option<&[f64]> {
        self.index
            .get(&(name.to_string(), DEFAULT_VARIANT.to_string()))
            .map(|&i| self.series[i].values.as_slice())
    }

    /// Summarize with `default`, or the strategy `overrides` names for a
    /// metric.
    pub fn to_values(
        &self,
        default: StoreStrategy,
        overrides: &HashMap<String, StoreStrategy>,
    ) -> Result<PerfValues, ValuesError> {
        let mut out = PerfValues::new();
        for Series { metric, values } in &self.series {
            let strategy = overrides.get(&metric.name).copied().unwrap_or(default);
            store(strategy, metric, values, &mut out)?;
        }
        Ok(out)
    }
}

/// Write `samples` of `metric` into `values` according to `strategy`.
pub fn store(
    strategy: StoreStrategy,
    metric: &PerfMetric,
    samples: &[f64],
    values: &mut PerfValues,
) -> Result<(), ValuesError> {
    if samples.is_empty() {
        return Ok(());
    }
    let single = PerfMetric {
        multiple: false,
        ..metric.clone()
    };
    match strategy {
        StoreStrategy::StoreAll => {
            let multi = metric.clone().multiple();
            for &v in samples {
                values.append(multi.clone(), v)?;
            }
        }
        StoreStrategy::StoreMean => values.set(single, mean(samples))?,
        StoreStrategy::StoreLatency => {
            let mut sorted = samples.to_vec();
            sorted.sort_by(f64::total_cmp);
            values.set(derived(&single, "mean"), mean(samples))?;
            values.set(derived(&single, "p50"), nearest_rank(&sorted, 50.0))?;
            values.set(derived(&single, "p95"), nearest_rank(&sorted, 95.0))?;
        }
        StoreStrategy::StoreAllWithHeuristics => {
            let (unit, direction) = infer(&metric.name).unwrap_or((metric.unit, metric.direction));
            let multi = PerfMetric {
                unit,
                direction,
                ..metric.clone()
            }
            .multiple();
            for &v in samples {
                values.append(multi.clone(), v)?;
            }
            let median_metric = PerfMetric {
                multiple: false,
                ..derived(&multi, "median")
            };
            values.set(median_metric, median(samples))?;
        }
    }
    Ok(())
}

fn derived(metric: &PerfMetric, suffix: &str) -> PerfMetric {
    let variant = if metric.variant == DEFAULT_VARIANT {
        suffix.to_string()
    } else {
        format!("{}_{suffix}", metric.variant)
    };
    metric.clone().with_variant(variant)
}

fn infer(name: &str) -> Option<(Unit, Direction)> {
    if name.contains("AnimationSmoothness") {
        Some((Unit::Percent, Direction::BiggerIsBetter))
    } else if ["Latency", "PresentationTime", "Duration"].iter().any(|k| name.contains(k)) {
        Some((Unit::Milliseconds, Direction::SmallerIsBetter))
    } else {
        None
    }
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn median(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, value: f64) -> Sample {
        Sample {
            metric: PerfMetric::new(name, Unit::Count, Direction::SmallerIsBetter),
            value,
        }
    }

    fn aggregate(iterations: &[&[(&str, f64)]]) -> Aggregation {
        let mut agg = Aggregation::new();
        for it in iterations {
            agg.push_iteration(it.iter().map(|&(n, v)| sample(n, v)));
        }
        agg
    }

    #[test]
    fn store_all_keeps_iteration_order() {
        let agg = aggregate(&[&[("A", 60.0)], &[("A", 80.0)]]);
        let pv = agg.to_values(StoreStrategy::StoreAll, &HashMap::new()).unwrap();
        let (metric, values) = pv.get("A", DEFAULT_VARIANT).unwrap();
        assert!(metric.multiple);
        assert_eq!(values, &[60.0, 80.0]);
    }

    #[test]
    fn missing_iterations_contribute_nothing() {
        let agg = aggregate(&[&[("A", 10.0), ("B", 1.0)], &[("A", 20.0)], &[]]);
        assert_eq!(agg.iterations(), 3);
        let pv = agg.to_values(StoreStrategy::StoreMean, &HashMap::new()).unwrap();
        assert_eq!(pv.values("A"), Some(&[15.0][..]));
        assert_eq!(pv.values("B"), Some(&[1.0][..]));
        assert_eq!(pv.values("C"), None);
    }

    #[test]
    fn latency_reports_nearest_rank_percentiles() {
        let agg = aggregate(&[&[("L", 30.0)], &[("L", 10.0)], &[("L", 20.0)], &[("L", 100.0)]]);
        let overrides = HashMap::from([("L".to_string(), StoreStrategy::StoreLatency)]);
        let pv = agg.to_values(StoreStrategy::StoreAll, &overrides).unwrap();
        let get = |variant| pv.get("L", variant).map(|(_, v)| v[0]);
        assert_eq!(get("mean"), Some(40.0));
        assert_eq!(get("p50"), Some(20.0));
        assert_eq!(get("p95"), Some(100.0));
        assert_eq!(get(DEFAULT_VARIANT), None);
    }

    #[test]
    fn heuristics_infer_units_and_add_a_median() {
        let agg = aggregate(&[
            &[("Ash.Overview.AnimationSmoothness.Enter", 70.0), ("Ash.Drag.PresentationTime", 12.0)],
            &[("Ash.Overview.AnimationSmoothness.Enter", 90.0), ("Ash.Drag.PresentationTime", 18.0)],
            &[("Ash.Overview.AnimationSmoothness.Enter", 80.0), ("Ash.Drag.PresentationTime", 14.0)],
        ]);
        let pv = agg
            .to_values(StoreStrategy::StoreAllWithHeuristics, &HashMap::new())
            .unwrap();

        let (smooth, values) = pv.get("Ash.Overview.AnimationSmoothness.Enter", DEFAULT_VARIANT).unwrap();
        assert_eq!((smooth.unit, smooth.direction), (Unit::Percent, Direction::BiggerIsBetter));
        assert_eq!(values, &[70.0, 90.0, 80.0]);
        let (median, values) = pv.get("Ash.Overview.AnimationSmoothness.Enter", "median").unwrap();
        assert!(!median.multiple);
        assert_eq!(values, &[80.0]);

        let (drag, _) = pv.get("Ash.Drag.PresentationTime", DEFAULT_VARIANT).unwrap();
        assert_eq!(drag.unit, Unit::Milliseconds);
        assert_eq!(pv.get("Ash.Drag.PresentationTime", "median").map(|(_, v)| v[0]), Some(14.0));
    }

    #[test]
    fn even_median_is_the_midpoint() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(nearest_rank(&[5.0], 95.0), 5.0);
    }

    #[test]
    fn strategies_parse_by_name() {
        assert_eq!("StoreLatency".parse::<StoreStrategy>().unwrap(), StoreStrategy::StoreLatency);
        assert!("StoreMedian".parse::<StoreStrategy>().is_err());
        assert_eq!(StoreStrategy::StoreMean.to_string(), "StoreMean");
    }
}
