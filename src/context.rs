//! The scoped handle handed to every scenario body.
//!
//! A [`RunContext`] carries everything a scenario needs to behave well under
//! the recorder: a deadline, any number of cancel signals, the
//! [`tracing::Span`] its log lines belong to, a per-iteration temporary
//! directory, the harness configuration, and a channel back to the recorder
//! for directly-measured scalar values.
//!
//! Contexts are cheap to clone and only ever narrow: a derived context can
//! have an earlier deadline or an extra cancel signal, never a later one.
//! Cancellation is observed, not thrown. Scenario bodies either poll
//! [`RunContext::is_cancelled`] or wrap their waits in [`RunContext::run`];
//! the recorder races the whole body against [`RunContext::done`].

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt, select_all};
use tempfile::TempDir;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::Span;

use crate::{config::ScenarioConfig, error::Error, recorder::Sample, values::PerfMetric};

#[derive(Clone)]
pub struct RunContext {
    deadline: Option<Instant>,
    cancel: Vec<watch::Receiver<bool>>,
    span: Span,
    temp_dir: Option<Arc<TempDir>>,
    config: Arc<ScenarioConfig>,
    scalars: Option<mpsc::UnboundedSender<Sample>>,
}

/// Cancels every context derived from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl RunContext {
    /// A context with no deadline and no cancel signal.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: Vec::new(),
            span: Span::current(),
            temp_dir: None,
            config: Arc::new(ScenarioConfig::default()),
            scalars: None,
        }
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut ctx = self.clone();
        ctx.cancel.push(rx);
        (ctx, CancelHandle { tx })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, at: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(self.deadline.map_or(at, |d| d.min(at)));
        ctx
    }

    /// Same context with `reserve` carved off the end of its deadline.
    ///
    /// Contexts without a deadline are returned unchanged.
    pub fn shorten(&self, reserve: Duration) -> Self {
        let mut ctx = self.clone();
        if let Some(deadline) = self.deadline {
            let floor = Instant::now().min(deadline);
            ctx.deadline = Some(deadline.checked_sub(reserve).map_or(floor, |d| d.max(floor)));
        }
        ctx
    }

    pub fn with_span(&self, span: Span) -> Self {
        let mut ctx = self.clone();
        ctx.span = span;
        ctx
    }

    pub fn with_config(&self, config: Arc<ScenarioConfig>) -> Self {
        let mut ctx = self.clone();
        ctx.config = config;
        ctx
    }

    pub(crate) fn with_temp_dir(&self, dir: Arc<TempDir>) -> Self {
        let mut ctx = self.clone();
        ctx.temp_dir = Some(dir);
        ctx
    }

    pub(crate) fn with_scalar_sink(&self, sink: mpsc::UnboundedSender<Sample>) -> Self {
        let mut ctx = self.clone();
        ctx.scalars = Some(sink);
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(|rx| *rx.borrow())
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes, with
    /// the [`Error::Timeout`] describing which one happened.
    pub async fn done(&self) -> Error {
        let cancelled = async {
            if self.cancel.is_empty() {
                return futures::future::pending::<()>().await;
            }
            let waits: Vec<BoxFuture<'static, ()>> = self
                .cancel
                .iter()
                .cloned()
                .map(|rx| wait_cancelled(rx).boxed())
                .collect();
            select_all(waits).await;
        };
        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Error::Timeout("context cancelled".into()),
            _ = expired => Error::Timeout("deadline exceeded".into()),
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Per-iteration scratch directory, removed once the iteration is over.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref().map(TempDir::path)
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Report a directly-measured value (elapsed time, start-up time, ...)
    /// to the recorder running this scenario.
    pub fn record_scalar(&self, metric: PerfMetric, value: f64) -> Result<(), Error> {
        let sink = self
            .scalars
            .as_ref()
            .ok_or_else(|| Error::config("no recorder is collecting scalars for this context"))?;
        sink.send(Sample { metric, value })
            .map_err(|_| Error::config("the recording this context belongs to is over"))
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        let fired = *rx.borrow_and_update();
        if fired {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling.
            futures::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("deadline", &self.deadline)
            .field("cancel_signals", &self.cancel.len())
            .field("temp_dir", &self.temp_dir())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, metric::{Direction, Unit}};

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_done() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = ctx.done().await;
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("deadline exceeded"));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_handle_reaches_derived_contexts() {
        let (ctx, handle) = RunContext::background().with_cancel();
        let child = ctx.with_timeout(Duration::from_secs(60));
        assert!(!child.is_cancelled());
        handle.cancel();
        assert!(child.is_cancelled());
        assert!(child.done().await.to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_only_narrow() {
        let parent = RunContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());

        let short = parent.shorten(Duration::from_millis(900));
        assert_eq!(short.remaining(), Some(Duration::from_millis(100)));

        let gone = parent.shorten(Duration::from_secs(5));
        assert_eq!(gone.remaining(), Some(Duration::ZERO));

        assert_eq!(RunContext::background().shorten(Duration::from_secs(1)).deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_interrupts_slow_futures() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(10));
        let out = ctx.run(tokio::time::sleep(Duration::from_secs(1))).await;
        assert_eq!(out.unwrap_err().kind(), ErrorKind::Timeout);

        let ok = RunContext::background().run(async { 5 }).await.unwrap();
        assert_eq!(ok, 5);
    }

    #[test]
    fn scalars_need_a_recorder() {
        let metric = PerfMetric::new("Browser.StartTime", Unit::Milliseconds, Direction::SmallerIsBetter);
        let ctx = RunContext::background();
        assert!(ctx.record_scalar(metric.clone(), 12.0).is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ctx.with_scalar_sink(tx);
        ctx.record_scalar(metric, 12.0).unwrap();
        assert_eq!(rx.try_recv().unwrap().value, 12.0);
    }
}
