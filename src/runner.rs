//! Repeated execution of one scenario.
//!
//! A [`Runner`] drives a [`Recorder`] through a fixed number of iterations,
//! collects the samples of each one and summarizes them with the configured
//! [`StoreStrategy`]. Before every iteration it waits (bounded) for the CPU to
//! settle; it may also keep the device on battery power, either around the
//! whole loop or per iteration.
//!
//! ```rust,ignore
//! let runner = Runner::builder()
//!     .iterations(5)
//!     .strategy(StoreStrategy::StoreMean)
//!     .idle(Arc::new(ProcStatIdleWaiter::default()) as Arc<dyn CpuIdleWaiter>)
//!     .build();
//!
//! let values = runner
//!     .run(&RunContext::background(), &mut recorder, |ctx| async move {
//!         open_overview(&ctx).await
//!     })
//!     .await?;
//! values.save(out_dir)?;
//! ```

use std::{
    collections::HashMap,
    future::Future,
    io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::{Aggregation, StoreStrategy},
    battery::{BatteryGuard, Discharge},
    context::RunContext,
    error::{BoxError, Error, ErrorKind},
    histogram::Histogram,
    recorder::Recorder,
    source::HistogramSource,
    values::PerfValues,
};

pub const DEFAULT_ITERATIONS: usize = 3;

/// Waits until the machine is quiet enough to measure.
#[async_trait]
pub trait CpuIdleWaiter: Send + Sync {
    /// Resolve once the CPU is idle, or fail with [`Error::Timeout`] after
    /// `timeout`.
    async fn wait_until_idle(&self, timeout: Duration) -> Result<(), Error>;
}

/// Samples the aggregate `cpu` line of `/proc/stat`.
///
/// The CPU counts as idle once the busy share between consecutive samples
/// stays at or below `max_busy` percent for `stable_samples` samples in a
/// row.
#[derive(Debug, Clone)]
pub struct ProcStatIdleWaiter {
    path: PathBuf,
    interval: Duration,
    max_busy: f64,
    stable_samples: usize,
}

impl Default for ProcStatIdleWaiter {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/stat"),
            interval: Duration::from_secs(1),
            max_busy: 10.0,
            stable_samples: 3,
        }
    }
}

impl ProcStatIdleWaiter {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_busy(mut self, percent: f64) -> Self {
        self.max_busy = percent;
        self
    }

    pub fn with_stable_samples(mut self, samples: usize) -> Self {
        self.stable_samples = samples.max(1);
        self
    }

    async fn cpu_times(&self) -> Result<CpuTimes, Error> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        text.lines()
            .find_map(CpuTimes::parse)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no cpu line in {}", self.path.display()),
                )
                .into()
            })
    }
}

#[async_trait]
impl CpuIdleWaiter for ProcStatIdleWaiter {
    async fn wait_until_idle(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut previous = self.cpu_times().await?;
        let mut stable = 0;
        let mut last_busy = 0.0;
        while stable < self.stable_samples {
            if Instant::now() + self.interval > deadline {
                return Err(Error::Timeout(format!(
                    "cpu still {last_busy:.1}% busy after {timeout:?}"
                )));
            }
            tokio::time::sleep(self.interval).await;
            let current = self.cpu_times().await?;
            last_busy = current.busy_since(&previous);
            previous = current;
            if last_busy <= self.max_busy {
                stable += 1;
            } else {
                stable = 0;
            }
            tracing::debug!(busy = last_busy, stable, "cpu sample");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let ticks: Vec<u64> = fields.map(str::parse).collect::<Result<_, _>>().ok()?;
        if ticks.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = ticks[3] + ticks.get(4).copied().unwrap_or(0);
        Some(Self {
            idle,
            total: ticks.iter().sum(),
        })
    }

    /// Busy percentage between `earlier` and `self`. No elapsed ticks count
    /// as idle.
    pub(crate) fn busy_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle).min(total);
        (total - idle) as f64 * 100.0 / total as f64
    }
}

/// When the runner keeps the device on battery power.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatteryPolicy {
    #[default]
    Disabled,
    /// Engage before and release after every iteration.
    PerIteration,
    /// Engage once before the first iteration, release after the last.
    AroundLoop,
}

/// A failed iteration, with the summary of the iterations that completed.
#[derive(Debug, Error)]
#[error("iteration {} failed after {completed} completed: {source}", .completed + 1)]
pub struct RunnerError {
    pub completed: usize,
    pub partial: PerfValues,
    pub source: Error,
}

impl RunnerError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(TypedBuilder)]
pub struct Runner {
    #[builder(default = DEFAULT_ITERATIONS)]
    pub iterations: usize,
    #[builder(default)]
    pub strategy: StoreStrategy,
    /// Per-metric strategies, keyed by metric name.
    #[builder(default)]
    pub overrides: HashMap<String, StoreStrategy>,
    #[builder(default, setter(strip_option))]
    pub idle: Option<Arc<dyn CpuIdleWaiter>>,
    #[builder(default = Duration::from_secs(60))]
    pub idle_timeout: Duration,
    #[builder(default, setter(strip_option))]
    pub battery: Option<BatteryGuard>,
    #[builder(default)]
    pub battery_policy: BatteryPolicy,
}

impl Runner {
    /// Run `scenario` [`iterations`](Self::iterations) times through
    /// `recorder` and summarize the samples.
    ///
    /// The first failing iteration stops the loop. Its error is returned
    /// together with the summary of the iterations before it.
    pub async fn run<F, Fut>(
        &self,
        ctx: &RunContext,
        recorder: &mut Recorder,
        mut scenario: F,
    ) -> Result<PerfValues, RunnerError>
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let mut aggregation = Aggregation::new();
        if self.iterations == 0 {
            return Ok(PerfValues::new());
        }

        let around = match self.battery_policy {
            BatteryPolicy::AroundLoop => self.engage_battery(),
            _ => None,
        };
        let mut failure = None;
        for n in 1..=self.iterations {
            let span = tracing::info_span!(parent: ctx.span(), "iteration", n, of = self.iterations);
            let iteration_ctx = ctx.with_span(span.clone());
            let result = async {
                tracing::info!("iteration started");
                self.wait_idle().await;
                let discharge = match self.battery_policy {
                    BatteryPolicy::PerIteration => self.engage_battery(),
                    _ => None,
                };
                let result = recorder.run(&iteration_ctx, &mut scenario).await;
                release(discharge);
                result?;
                let samples = recorder.last_samples()?;
                tracing::info!(samples = samples.len(), "iteration finished");
                Ok::<_, Error>(samples)
            }
            .instrument(span)
            .await;

            match result {
                Ok(samples) => aggregation.push_iteration(samples),
                Err(source) => {
                    failure = Some((n - 1, source));
                    break;
                }
            }
        }
        release(around);

        let summary = aggregation.to_values(self.strategy, &self.overrides);
        match (failure, summary) {
            (None, Ok(values)) => Ok(values),
            (None, Err(e)) => Err(RunnerError {
                completed: aggregation.iterations(),
                partial: PerfValues::new(),
                source: e.into(),
            }),
            (Some((completed, source)), summary) => {
                let partial = summary.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "could not summarize completed iterations");
                    PerfValues::new()
                });
                Err(RunnerError {
                    completed,
                    partial,
                    source,
                })
            }
        }
    }

    async fn wait_idle(&self) {
        let Some(idle) = &self.idle else {
            return;
        };
        if let Err(e) = idle.wait_until_idle(self.idle_timeout).await {
            tracing::warn!(error = %e, "cpu did not become idle, measuring anyway");
        }
    }

    fn engage_battery(&self) -> Option<Discharge> {
        match self.battery.as_ref()?.engage() {
            Ok(discharge) => Some(discharge),
            Err(e) => {
                tracing::warn!(error = %e, "running without forced battery discharge");
                None
            }
        }
    }
}

fn release(discharge: Option<Discharge>) {
    if let Some(Err(e)) = discharge.map(Discharge::release) {
        tracing::warn!(error = %e, "failed to restore normal charging");
    }
}

/// Run `body`, then wait until every histogram in `names` recorded at least
/// one sample since before `body` started. Returns those diffs in order.
pub async fn run_and_wait_all<Fut>(
    source: &dyn HistogramSource,
    names: &[&str],
    timeout: Duration,
    body: Fut,
) -> Result<Vec<Histogram>, Error>
where
    Fut: Future<Output = Result<(), BoxError>>,
{
    let mut before = Vec::with_capacity(names.len());
    for name in names {
        before.push(source.snapshot(name).await?);
    }
    body.await.map_err(|source| Error::ScenarioFailed {
        source,
        cleanup: Vec::new(),
    })?;

    let deadline = Instant::now() + timeout;
    let mut diffs = Vec::with_capacity(names.len());
    for (name, before) in names.iter().zip(&before) {
        loop {
            let diff = source.snapshot(name).await?.diff(before)?;
            if !diff.is_empty() {
                diffs.push(diff);
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Timeout(format!("no new sample of {name} within {timeout:?}")));
            }
            // Bounded so an update racing the snapshot above is still seen.
            match source.wait_for_update(name, left.min(Duration::from_millis(100))).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Timeout => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(diffs)
}
