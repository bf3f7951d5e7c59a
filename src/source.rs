use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

use crate::{
    error::Error,
    histogram::{Histogram, HistogramBucket, HistogramError},
    metric::MetricSource,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The `HistogramSource` trait is the recorder's only view of an observed
/// process.
///
/// A source hands out cumulative [`Histogram`] snapshots by name. The
/// recorder never looks at raw counters directly: it snapshots every
/// registered metric before and after a scenario and works on the
/// [`diff`](Histogram::diff) of the two.
///
/// # Contract
///
/// - [`snapshot`](Self::snapshot) returns the current cumulative snapshot, or
///   [`Error::SourceUnavailable`] when the process cannot be reached. A
///   histogram that never received a sample is reported as
///   [`Histogram::empty`], not as an error.
/// - Snapshots are monotonic: repeated calls return totals that never
///   decrease.
/// - [`wait_for_update`](Self::wait_for_update) resolves as soon as the total
///   sample count grows past its value at call time, or fails with
///   [`Error::Timeout`].
///
/// The provided `wait_for_update` polls `snapshot`; implementations that can
/// be notified of new samples should override it.
#[async_trait]
pub trait HistogramSource: Send + Sync {
    async fn snapshot(&self, name: &str) -> Result<Histogram, Error>;

    async fn wait_for_update(&self, name: &str, timeout: Duration) -> Result<Histogram, Error> {
        let deadline = Instant::now() + timeout;
        let initial = self.snapshot(name).await?.total_count()?;
        loop {
            let current = self.snapshot(name).await?;
            if current.total_count()? > initial {
                return Ok(current);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no new sample of {name} within {timeout:?}"
                )));
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + POLL_INTERVAL)).await;
        }
    }
}

/// One [`HistogramSource`] per observed process.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<MetricSource, Arc<dyn HistogramSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry where every process is served by the same source.
    pub fn shared(source: Arc<dyn HistogramSource>) -> Self {
        Self::new()
            .with(MetricSource::Ui, Arc::clone(&source))
            .with(MetricSource::Browser, source)
    }

    pub fn with(mut self, process: MetricSource, source: Arc<dyn HistogramSource>) -> Self {
        self.insert(process, source);
        self
    }

    pub fn insert(&mut self, process: MetricSource, source: Arc<dyn HistogramSource>) {
        self.sources.insert(process, source);
    }

    pub fn get(&self, process: MetricSource) -> Result<Arc<dyn HistogramSource>, Error> {
        self.sources
            .get(&process)
            .cloned()
            .ok_or_else(|| Error::config(format!("no histogram source for the {process} process")))
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sources.keys()).finish()
    }
}

/// How [`InMemoryHistogramSource::add_sample`] maps a value to a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BucketLayout {
    /// Every value gets its own `[v, v + 1)` bucket.
    #[default]
    Exact,
    /// Fixed-width buckets `[k·width, (k + 1)·width)`.
    Linear { width: i64 },
}

impl BucketLayout {
    fn bounds(self, value: i64) -> (i64, i64) {
        match self {
            BucketLayout::Exact => (value, value.saturating_add(1)),
            BucketLayout::Linear { width } => {
                let width = width.max(1);
                let min = value.div_euclid(width) * width;
                (min, min.saturating_add(width))
            }
        }
    }
}

#[derive(Default)]
struct State {
    histograms: HashMap<String, Histogram>,
    layouts: HashMap<String, BucketLayout>,
    unreachable: bool,
}

/// A process-local histogram store.
///
/// Scenario bodies (or fake UI drivers in tests) feed it with
/// [`add_sample`](Self::add_sample); the recorder reads it through
/// [`HistogramSource`]. Waiters are woken as soon as a sample lands.
#[derive(Default)]
pub struct InMemoryHistogramSource {
    state: Mutex<State>,
    updated: Notify,
}

impl InMemoryHistogramSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(self, name: impl Into<String>, layout: BucketLayout) -> Self {
        self.lock().layouts.insert(name.into(), layout);
        self
    }

    /// Record one sample of `name`. A sample that would overflow the
    /// histogram is logged and dropped; see [`try_add_sample`](Self::try_add_sample).
    pub fn add_sample(&self, name: &str, value: i64) {
        if let Err(e) = self.try_add_sample(name, value) {
            tracing::error!(error = %e, value, "sample dropped");
        }
    }

    /// Record one sample of `name`, leaving the histogram untouched if its sum
    /// or bucket count would overflow.
    pub fn try_add_sample(&self, name: &str, value: i64) -> Result<(), HistogramError> {
        {
            let mut state = self.lock();
            let layout = state.layouts.get(name).copied().unwrap_or_default();
            let (min, max) = layout.bounds(value);
            let hist = state
                .histograms
                .entry(name.to_string())
                .or_insert_with(|| Histogram::empty(name));
            let overflow = || HistogramError::Overflow { name: name.to_string() };
            let sum = hist.sum.checked_add(value).ok_or_else(overflow)?;
            match hist.buckets.iter_mut().find(|b| b.min == min) {
                Some(bucket) => bucket.count = bucket.count.checked_add(1).ok_or_else(overflow)?,
                None => {
                    let at = hist.buckets.partition_point(|b| b.min < min);
                    hist.buckets.insert(at, HistogramBucket::new(min, max, 1));
                }
            }
            hist.sum = sum;
        }
        self.updated.notify_waiters();
        Ok(())
    }

    /// Replace the cumulative state of a histogram wholesale.
    pub fn set_histogram(&self, histogram: Histogram) {
        self.lock()
            .histograms
            .insert(histogram.name.clone(), histogram);
        self.updated.notify_waiters();
    }

    /// Simulate the observed process going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self, name: &str) -> Result<Histogram, Error> {
        let state = self.lock();
        if state.unreachable {
            return Err(Error::SourceUnavailable {
                name: name.to_string(),
                reason: "process is not reachable".into(),
            });
        }
        Ok(state
            .histograms
            .get(name)
            .cloned()
            .unwrap_or_else(|| Histogram::empty(name)))
    }
}

#[async_trait]
impl HistogramSource for InMemoryHistogramSource {
    async fn snapshot(&self, name: &str) -> Result<Histogram, Error> {
        let hist = self.current(name)?;
        tracing::debug!(name, samples = hist.total_count()?, "snapshot");
        Ok(hist)
    }

    async fn wait_for_update(&self, name: &str, timeout: Duration) -> Result<Histogram, Error> {
        let deadline = Instant::now() + timeout;
        let initial = self.current(name)?.total_count()?;
        loop {
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.current(name)?;
            if current.total_count()? > initial {
                return Ok(current);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!(
                    "no new sample of {name} within {timeout:?}"
                )));
            }
        }
    }
}
