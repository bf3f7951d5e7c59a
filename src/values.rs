//! Performance values and the `results-chart.json` report.
//!
//! [`PerfValues`] is an append-only mapping from a [`PerfMetric`] descriptor
//! to its samples. Single-value metrics accept exactly one value (setting the
//! same value again is a no-op); metrics declared [`multiple`](PerfMetric::multiple)
//! collect an ordered list. Nothing is ever overwritten.
//!
//! ## Chart format
//! ```json
//! {
//!   "Ash.A": {
//!     "summary": {
//!       "type": "list_of_scalar_values",
//!       "unit": "percent",
//!       "direction": "up",
//!       "important": false,
//!       "values": [60.0, 80.0]
//!     }
//!   }
//! }
//! ```
//! Metrics and variants keep insertion order, so a saved chart parsed back
//! and saved again is byte-identical.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::metric::{Direction, Unit};

pub const CHART_FILE: &str = "results-chart.json";
pub const DEFAULT_VARIANT: &str = "summary";

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("{0} already holds a different value")]
    AlreadySet(String),

    #[error("{0} is not declared multiple; use set")]
    NotMultiple(String),

    #[error("{0} is declared multiple; use append")]
    NotSingle(String),

    #[error("conflicting values for {0}")]
    Conflict(String),

    #[error("value of {metric} is not finite: {value}")]
    NonFinite { metric: String, value: f64 },

    #[error("malformed chart: {0}")]
    Invalid(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ValuesError {
    /// Misuse by the caller, as opposed to a broken file or disk.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ValuesError::AlreadySet(_)
                | ValuesError::NotMultiple(_)
                | ValuesError::NotSingle(_)
                | ValuesError::Conflict(_)
                | ValuesError::NonFinite { .. }
        )
    }
}

/// Descriptor of one reported metric. Identity is `(name, variant)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerfMetric {
    pub name: String,
    pub variant: String,
    pub unit: Unit,
    pub direction: Direction,
    pub multiple: bool,
    pub important: bool,
}

impl PerfMetric {
    pub fn new(name: impl Into<String>, unit: Unit, direction: Direction) -> Self {
        Self {
            name: name.into(),
            variant: DEFAULT_VARIANT.to_string(),
            unit,
            direction,
            multiple: false,
            important: false,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }

    fn key(&self) -> (String, String) {
        (self.name.clone(), self.variant.clone())
    }

    fn label(&self) -> String {
        if self.variant == DEFAULT_VARIANT {
            self.name.clone()
        } else {
            format!("{}/{}", self.name, self.variant)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    metric: PerfMetric,
    values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfValues {
    entries: Vec<Entry>,
    index: HashMap<(String, String), usize>,
}

impl PerfValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single-value metric. Fails if a different value is already
    /// present.
    pub fn set(&mut self, metric: PerfMetric, value: f64) -> Result<(), ValuesError> {
        check_finite(&metric, value)?;
        if metric.multiple {
            return Err(ValuesError::NotSingle(metric.label()));
        }
        match self.index.get(&metric.key()) {
            Some(&i) => {
                let entry = &self.entries[i];
                if entry.metric == metric && entry.values == [value] {
                    Ok(())
                } else {
                    Err(ValuesError::AlreadySet(metric.label()))
                }
            }
            None => {
                self.push(metric, vec![value]);
                Ok(())
            }
        }
    }

    /// Append to a multi-value metric.
    pub fn append(&mut self, metric: PerfMetric, value: f64) -> Result<(), ValuesError> {
        check_finite(&metric, value)?;
        if !metric.multiple {
            return Err(ValuesError::NotMultiple(metric.label()));
        }
        match self.index.get(&metric.key()) {
            Some(&i) if self.entries[i].metric == metric => {
                self.entries[i].values.push(value);
                Ok(())
            }
            Some(_) => Err(ValuesError::Conflict(metric.label())),
            None => {
                self.push(metric, vec![value]);
                Ok(())
            }
        }
    }

    /// Union of both mappings.
    ///
    /// Overlapping multi-value metrics are concatenated; any other overlap is
    /// a [`ValuesError::Conflict`] and leaves `self` untouched.
    pub fn merge(&mut self, other: &PerfValues) -> Result<(), ValuesError> {
        for entry in &other.entries {
            if let Some(&i) = self.index.get(&entry.metric.key()) {
                let mine = &self.entries[i].metric;
                if !(mine.multiple && *mine == entry.metric) {
                    return Err(ValuesError::Conflict(entry.metric.label()));
                }
            }
        }
        for entry in &other.entries {
            match self.index.get(&entry.metric.key()) {
                Some(&i) => self.entries[i].values.extend_from_slice(&entry.values),
                None => self.push(entry.metric.clone(), entry.values.clone()),
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str, variant: &str) -> Option<(&PerfMetric, &[f64])> {
        self.index
            .get(&(name.to_string(), variant.to_string()))
            .map(|&i| (&self.entries[i].metric, self.entries[i].values.as_slice()))
    }

    /// Values of the `summary` variant of `name`.
    pub fn values(&self, name: &str) -> Option<&[f64]> {
        self.get(name, DEFAULT_VARIANT).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PerfMetric, &[f64])> {
        self.entries.iter().map(|e| (&e.metric, e.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_chart_json(&self) -> Value {
        let mut chart = Map::new();
        for Entry { metric, values } in &self.entries {
            let mut entry = Map::new();
            let kind = if metric.multiple {
                "list_of_scalar_values"
            } else {
                "scalar"
            };
            entry.insert("type".into(), json!(kind));
            entry.insert("unit".into(), json!(metric.unit.as_str()));
            entry.insert("direction".into(), json!(metric.direction.as_chart_str()));
            entry.insert("important".into(), json!(metric.important));
            if metric.multiple {
                entry.insert("values".into(), json!(values));
            } else if let Some(v) = values.first() {
                entry.insert("value".into(), json!(v));
            }
            let variants = chart
                .entry(metric.name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(variants) = variants {
                variants.insert(metric.variant.clone(), Value::Object(entry));
            }
        }
        Value::Object(chart)
    }

    pub fn from_chart_json(chart: &Value) -> Result<Self, ValuesError> {
        let metrics = chart
            .as_object()
            .ok_or_else(|| ValuesError::Invalid("top level is not an object".into()))?;
        let mut out = PerfValues::new();
        for (name, variants) in metrics {
            let variants = variants
                .as_object()
                .ok_or_else(|| ValuesError::Invalid(format!("{name} is not an object")))?;
            for (variant, entry) in variants {
                let (metric, values) = parse_entry(name, variant, entry)?;
                if out.index.contains_key(&metric.key()) {
                    return Err(ValuesError::Invalid(format!("{} appears twice", metric.label())));
                }
                out.push(metric, values);
            }
        }
        Ok(out)
    }

    /// Write `dir/results-chart.json` and return its path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ValuesError> {
        let path = dir.join(CHART_FILE);
        let mut text = serde_json::to_string_pretty(&self.to_chart_json())?;
        text.push('\n');
        fs::write(&path, text).map_err(|source| ValuesError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), metrics = self.len(), "saved perf values");
        Ok(path)
    }

    /// Parse a chart previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, ValuesError> {
        let text = fs::read_to_string(path).map_err(|source| ValuesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_chart_json(&serde_json::from_str(&text)?)
    }

    fn push(&mut self, metric: PerfMetric, values: Vec<f64>) {
        self.index.insert(metric.key(), self.entries.len());
        self.entries.push(Entry { metric, values });
    }
}

fn check_finite(metric: &PerfMetric, value: f64) -> Result<(), ValuesError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValuesError::NonFinite {
            metric: metric.label(),
            value,
        })
    }
}

fn parse_entry(name: &str, variant: &str, entry: &Value) -> Result<(PerfMetric, Vec<f64>), ValuesError> {
    let invalid = |what: &str| ValuesError::Invalid(format!("{name}/{variant}: {what}"));
    let field = |key: &str| entry.get(key).ok_or_else(|| invalid(&format!("missing {key}")));

    let unit: Unit = field("unit")?
        .as_str()
        .ok_or_else(|| invalid("unit is not a string"))?
        .parse()
        .map_err(|_| invalid("unknown unit"))?;
    let direction = match field("direction")?.as_str() {
        Some("up") => Direction::BiggerIsBetter,
        Some("down") => Direction::SmallerIsBetter,
        _ => return Err(invalid("direction must be up or down")),
    };
    let important = entry
        .get("important")
        .map(|v| v.as_bool().ok_or_else(|| invalid("important is not a bool")))
        .transpose()?
        .unwrap_or(false);
    let number = |v: &Value| v.as_f64().ok_or_else(|| invalid("value is not a number"));

    let mut metric = PerfMetric::new(name, unit, direction).with_variant(variant);
    metric.important = important;
    let values = match field("type")?.as_str() {
        Some("scalar") => vec![number(field("value")?)?],
        Some("list_of_scalar_values") => {
            metric.multiple = true;
            field("values")?
                .as_array()
                .ok_or_else(|| invalid("values is not an array"))?
                .iter()
                .map(number)
                .collect::<Result<_, _>>()?
        }
        _ => return Err(invalid("unknown type")),
    };
    Ok((metric, values))
}
