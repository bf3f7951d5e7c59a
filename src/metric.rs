use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Histogram names that used to be synthesized group entries and may not be
/// registered as metrics.
const RESERVED_NAMES: [&str; 2] = ["AnimationSmoothness", "InputLatency"];

/// Whether smaller or bigger values of a metric are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SmallerIsBetter,
    BiggerIsBetter,
}

impl Direction {
    /// The `up` / `down` spelling used by `results-chart.json`.
    pub fn as_chart_str(self) -> &'static str {
        match self {
            Direction::SmallerIsBetter => "down",
            Direction::BiggerIsBetter => "up",
        }
    }
}

/// Measurement unit of a metric.
///
/// Unknown spellings are rejected when parsed, so every [`MetricConfig`]
/// carries a unit the report consumers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    Percent,
    Milliseconds,
    Microseconds,
    Seconds,
    Janks,
    Count,
    Apps,
    Tabs,
    Milliwatts,
    Unitless,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Percent => "percent",
            Unit::Milliseconds => "ms",
            Unit::Microseconds => "microseconds",
            Unit::Seconds => "s",
            Unit::Janks => "janks",
            Unit::Count => "count",
            Unit::Apps => "apps",
            Unit::Tabs => "tabs",
            Unit::Milliwatts => "mW",
            Unit::Unitless => "unitless",
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "percent" => Unit::Percent,
            "ms" => Unit::Milliseconds,
            "microsecond" | "microseconds" | "us" => Unit::Microseconds,
            "s" => Unit::Seconds,
            "janks" => Unit::Janks,
            "count" => Unit::Count,
            "apps" => Unit::Apps,
            "tabs" => Unit::Tabs,
            "mW" => Unit::Milliwatts,
            "unitless" => Unit::Unitless,
            other => return Err(Error::config(format!("unrecognized unit {other:?}"))),
        })
    }
}

impl TryFrom<String> for Unit {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Unit> for String {
    fn from(value: Unit) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process a histogram is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// The foreground UI (shell) process.
    #[default]
    Ui,
    /// The browser process.
    Browser,
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSource::Ui => f.write_str("ui"),
            MetricSource::Browser => f.write_str("browser"),
        }
    }
}

/// `(warn, fail)` pair; samples above either one are counted as janks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JankThresholds {
    pub warn: i64,
    pub fail: i64,
}

impl JankThresholds {
    pub fn new(warn: i64, fail: i64) -> Self {
        Self { warn, fail }
    }
}

/// A `MetricConfig` declares one histogram the recorder collects around a
/// scenario.
///
/// Configs are immutable values: build one with [`MetricConfig::custom`],
/// [`MetricConfig::smoothness`] or [`MetricConfig::latency`] and refine it
/// with the `with_*` methods. They are validated when handed to
/// [`Recorder::add`](crate::Recorder::add).
///
/// ## Derived metrics
/// Every diffed histogram produces its mean under [`name`](Self::name). When
/// [`jank_thresholds`](Self::jank_thresholds) are present two more counts are
/// reported, `<name>.JankyAboveWarn` and `<name>.JankyAboveFail`.
///
/// ## Example
/// ```rust
/// use cuj_recorder::metric::{Direction, JankThresholds, MetricConfig, MetricSource, Unit};
///
/// let config = MetricConfig::custom("Ash.B", Unit::Milliseconds, Direction::SmallerIsBetter)
///     .with_jank_thresholds(JankThresholds::new(50, 80))
///     .with_source(MetricSource::Browser);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricConfig {
    name: String,
    unit: Unit,
    direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jank_thresholds: Option<JankThresholds>,
    #[serde(default)]
    source: MetricSource,
    #[serde(default)]
    optional: bool,
}

impl MetricConfig {
    /// A histogram reported as-is with the given unit and direction.
    pub fn custom(name: impl Into<String>, unit: Unit, direction: Direction) -> Self {
        Self {
            name: name.into(),
            unit,
            direction,
            jank_thresholds: None,
            source: MetricSource::default(),
            optional: false,
        }
    }

    /// Animation smoothness in percent, bigger is better.
    pub fn smoothness(name: impl Into<String>) -> Self {
        Self::custom(name, Unit::Percent, Direction::BiggerIsBetter)
    }

    /// Input latency in milliseconds, smaller is better, with the usual
    /// 100 ms / 250 ms jank thresholds.
    pub fn latency(name: impl Into<String>) -> Self {
        Self::custom(name, Unit::Milliseconds, Direction::SmallerIsBetter)
            .with_jank_thresholds(JankThresholds::new(100, 250))
    }

    pub fn with_jank_thresholds(mut self, thresholds: JankThresholds) -> Self {
        self.jank_thresholds = Some(thresholds);
        self
    }

    pub fn with_source(mut self, source: MetricSource) -> Self {
        self.source = source;
        self
    }

    /// Optional metrics are expected to stay empty in some runs; an empty
    /// diff is not worth a warning for them.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn jank_thresholds(&self) -> Option<JankThresholds> {
        self.jank_thresholds
    }

    pub fn source(&self) -> MetricSource {
        self.source
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Name of the derived "count above warn threshold" metric.
    pub fn jank_warn_name(&self) -> String {
        format!("{}.JankyAboveWarn", self.name)
    }

    /// Name of the derived "count above fail threshold" metric.
    pub fn jank_fail_name(&self) -> String {
        format!("{}.JankyAboveFail", self.name)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::config("metric name must not be empty"));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(Error::config(format!(
                "invalid histogram name: {}",
                self.name
            )));
        }
        match self.jank_thresholds {
            Some(t) if t.warn > t.fail => Err(Error::config(format!(
                "jank thresholds of {} are inverted: warn {} > fail {}",
                self.name, t.warn, t.fail
            ))),
            _ => Ok(()),
        }
    }
}
