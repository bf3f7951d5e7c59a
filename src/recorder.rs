//! The critical-user-journey recorder.
//!
//! A [`Recorder`] wraps one scenario invocation: it snapshots every
//! registered histogram, starts the optional collaborators (trace session,
//! screen recorder, screenshot schedule, battery guard), runs the scenario,
//! tears the collaborators down again, and diffs the final snapshots against
//! the baseline. [`Recorder::record`] turns the collected diffs into
//! [`PerfValues`].
//!
//! # Run protocol
//!
//! 1. Resolve every [`MetricConfig`] to its [`HistogramSource`].
//! 2. Engage the battery guard, if any.
//! 3. Take baseline snapshots in registration order. Any failure here aborts
//!    the run before the scenario starts.
//! 4. Start the platform timeline, tracing, screen recording and then the
//!    screenshot schedule. Unsupported tracing is logged and ignored; other
//!    start failures abort.
//! 5. Run the scenario on a context whose deadline leaves
//!    [`cleanup_reserve`](RecorderOptions::cleanup_reserve) for teardown.
//! 6. Stop screenshots and the timeline, then the screen recorder and the
//!    trace, each bounded by
//!    [`stop_timeout`](RecorderOptions::stop_timeout). A stop that times out
//!    is followed by an explicit abort.
//! 7. Take final snapshots and diff them. Empty diffs are dropped, and a
//!    metric whose source fails here does not cost the others their diffs.
//! 8. Query the tab health check.
//!
//! Scenario failures never skip steps 6 to 8, and whatever was collected
//! stays available to [`Recorder::record`] and [`Recorder::save_histograms`].
//!
//! # State machine
//!
//! ```text
//! Fresh ──add/attach──▶ Configured ──run──▶ Running ──▶ Finished ──close──▶ Closed
//!   └───────────────────────run──────────────────────────▶ ▲   │
//!                                                          └run┘
//! ```
//! Configuration is only accepted before the first run. A finished recorder
//! may run again; diffs of all runs are combined when recording.

use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use serde_json::{Map, Value, json};
use tokio::{sync::mpsc, time::Instant};
use tracing::Instrument;
use typed_builder::TypedBuilder;

use crate::{
    battery::{BatteryGuard, BatteryMode, DEFAULT_DISCHARGE_THRESHOLD, Discharge, PowerSupply, SysfsPowerSupply},
    config::ScenarioConfig,
    context::RunContext,
    error::{BoxError, CollaboratorError, Error, ErrorKind},
    health::{Health, TabHealthCheck},
    histogram::Histogram,
    metric::{Direction, MetricConfig, Unit},
    screen::{CaptureScreenRecorder, DEFAULT_RECORDING_NAME, FrameSource, MediaBlob, ScreenRecorder, Screenshots},
    source::{HistogramSource, SourceRegistry},
    timeline::{CPU_METRIC, PlatformSampler, RAM_METRIC, Timeline, TimelineData},
    trace::TraceSession,
    values::{PerfMetric, PerfValues},
};

pub const HISTOGRAMS_FILE: &str = "recorder_histograms.json";
pub const HISTOGRAMS_DIR: &str = "histograms";
pub const COLLABORATOR_FAILED_METRIC: &str = "Recorder.CollaboratorFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderState {
    Fresh,
    Configured,
    Running,
    Finished,
    Closed,
}

/// One value destined for [`PerfValues`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: PerfMetric,
    pub value: f64,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RecorderOptions {
    /// Bound on a single histogram snapshot.
    #[builder(default = Duration::from_secs(5))]
    pub snapshot_timeout: Duration,
    /// Carved off the caller's deadline for collaborator teardown and final
    /// snapshots.
    #[builder(default = Duration::from_secs(2))]
    pub cleanup_reserve: Duration,
    /// Bound on stopping the screen recorder or the trace session.
    #[builder(default = Duration::from_secs(10))]
    pub stop_timeout: Duration,
    /// Abort the run when forced discharge cannot be engaged.
    #[builder(default = false)]
    pub fail_on_discharge_err: bool,
    /// Also report cycle count, total run time and discharge status.
    #[builder(default = false)]
    pub report_run_metrics: bool,
    #[builder(default, setter(into))]
    pub config: Arc<ScenarioConfig>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Collaborators offered to [`Recorder::apply_config`]; the harness
/// configuration decides which of them are used.
#[derive(TypedBuilder)]
pub struct Collaborators {
    #[builder(default, setter(strip_option))]
    pub frame_source: Option<Arc<dyn FrameSource>>,
    #[builder(default, setter(strip_option))]
    pub trace_session: Option<Box<dyn TraceSession>>,
    #[builder(default, setter(strip_option, into))]
    pub trace_config: Option<PathBuf>,
    #[builder(default, setter(strip_option))]
    pub power_supply: Option<Arc<dyn PowerSupply>>,
    #[builder(default = DEFAULT_DISCHARGE_THRESHOLD)]
    pub discharge_threshold: f64,
}

/// Everything one scenario invocation produced.
#[derive(Debug, Clone)]
pub struct Recording {
    pub started_at: SystemTime,
    pub elapsed: Duration,
    /// Baseline snapshots in registration order.
    pub baselines: Vec<Histogram>,
    /// Final snapshots in registration order; `None` where a source could
    /// not be reached after the scenario.
    pub finals: Vec<Option<Histogram>>,
    /// Non-empty diffs in registration order.
    pub diffs: Vec<Histogram>,
    pub scalars: Vec<Sample>,
    pub trace: Option<PathBuf>,
    pub screen_recording: Option<MediaBlob>,
    pub screenshots: usize,
    pub timeline: TimelineData,
    pub discharged: bool,
    pub collaborator_errors: Vec<String>,
    pub error: Option<String>,
}

struct TraceSetup {
    session: Box<dyn TraceSession>,
    out_dir: PathBuf,
    config_path: PathBuf,
}

struct ScreenSetup {
    recorder: Box<dyn ScreenRecorder>,
    path: PathBuf,
}

struct ScreenshotSetup {
    source: Arc<dyn FrameSource>,
    out_dir: PathBuf,
    offset: Duration,
    count: usize,
}

pub struct Recorder {
    sources: SourceRegistry,
    options: RecorderOptions,
    state: RecorderState,
    configs: Vec<MetricConfig>,
    trace: Option<TraceSetup>,
    screen: Option<ScreenSetup>,
    screenshots: Option<ScreenshotSetup>,
    timeline: Option<PlatformSampler>,
    battery: Option<BatteryGuard>,
    health: Option<Box<dyn TabHealthCheck>>,
    recordings: Vec<Recording>,
    scalars: Vec<Sample>,
    collaborator_failures: usize,
    cycles: u64,
    total_run_time: Duration,
}

impl Recorder {
    pub fn new(sources: SourceRegistry, options: RecorderOptions) -> Self {
        Self {
            sources,
            options,
            state: RecorderState::Fresh,
            configs: Vec::new(),
            trace: None,
            screen: None,
            screenshots: None,
            timeline: None,
            battery: None,
            health: None,
            recordings: Vec::new(),
            scalars: Vec::new(),
            collaborator_failures: 0,
            cycles: 0,
            total_run_time: Duration::ZERO,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn configs(&self) -> &[MetricConfig] {
        &self.configs
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    pub fn options(&self) -> &RecorderOptions {
        &self.options
    }

    /// Register metrics. Names must be unique across all calls.
    pub fn add<I>(&mut self, configs: I) -> Result<&mut Self, Error>
    where
        I: IntoIterator<Item = MetricConfig>,
    {
        self.ensure("add", &[RecorderState::Fresh, RecorderState::Configured])?;
        let configs: Vec<MetricConfig> = configs.into_iter().collect();
        for (i, config) in configs.iter().enumerate() {
            config.validate()?;
            let taken = self.configs.iter().chain(&configs[..i]).any(|c| c.name() == config.name());
            if taken {
                return Err(Error::config(format!("duplicate metric {}", config.name())));
            }
        }
        self.configs.extend(configs);
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Wrap every run in a system trace saved to `out_dir/trace.data.gz`.
    pub fn enable_tracing(
        &mut self,
        session: Box<dyn TraceSession>,
        out_dir: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Result<&mut Self, Error> {
        self.ensure("enable_tracing", &[RecorderState::Fresh, RecorderState::Configured])?;
        self.trace = Some(TraceSetup {
            session,
            out_dir: out_dir.into(),
            config_path: config_path.into(),
        });
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Record the screen into `out_dir/name` while the scenario runs.
    pub fn attach_screen_recorder(
        &mut self,
        recorder: Box<dyn ScreenRecorder>,
        out_dir: &Path,
        name: &str,
    ) -> Result<&mut Self, Error> {
        self.ensure("attach_screen_recorder", &[RecorderState::Fresh, RecorderState::Configured])?;
        let name = if name.is_empty() { DEFAULT_RECORDING_NAME } else { name };
        self.screen = Some(ScreenSetup {
            recorder,
            path: out_dir.join(name),
        });
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Take `count` screenshots, `offset` apart, starting `offset` after the
    /// scenario begins.
    pub fn attach_screenshot_recorder(
        &mut self,
        source: Arc<dyn FrameSource>,
        out_dir: impl Into<PathBuf>,
        offset: Duration,
        count: usize,
    ) -> Result<&mut Self, Error> {
        self.ensure("attach_screenshot_recorder", &[RecorderState::Fresh, RecorderState::Configured])?;
        if count == 0 || offset.is_zero() {
            return Err(Error::config("screenshots need a positive offset and count"));
        }
        self.screenshots = Some(ScreenshotSetup {
            source,
            out_dir: out_dir.into(),
            offset,
            count,
        });
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Sample CPU and memory load in the background while the scenario
    /// runs.
    pub fn enable_timeline(&mut self, sampler: PlatformSampler) -> Result<&mut Self, Error> {
        self.ensure("enable_timeline", &[RecorderState::Fresh, RecorderState::Configured])?;
        self.timeline = Some(sampler);
        self.state = RecorderState::Configured;
        Ok(self)
    }

    pub fn attach_battery_guard(&mut self, guard: BatteryGuard) -> Result<&mut Self, Error> {
        self.ensure("attach_battery_guard", &[RecorderState::Fresh, RecorderState::Configured])?;
        self.battery = Some(guard);
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Install `check` now and query it after every run.
    pub async fn install_health_check(&mut self, mut check: Box<dyn TabHealthCheck>) -> Result<&mut Self, Error> {
        self.ensure("install_health_check", &[RecorderState::Fresh, RecorderState::Configured])?;
        check.install().await?;
        self.health = Some(check);
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Attach collaborators according to the harness configuration and make
    /// it visible to scenarios through [`RunContext::config`].
    pub fn apply_config(
        &mut self,
        config: ScenarioConfig,
        out_dir: &Path,
        collaborators: Collaborators,
    ) -> Result<&mut Self, Error> {
        self.ensure("apply_config", &[RecorderState::Fresh, RecorderState::Configured])?;
        let Collaborators {
            frame_source,
            trace_session,
            trace_config,
            power_supply,
            discharge_threshold,
        } = collaborators;

        if config.record {
            match frame_source {
                Some(source) => {
                    self.attach_screen_recorder(
                        Box::new(CaptureScreenRecorder::new(source)),
                        out_dir,
                        DEFAULT_RECORDING_NAME,
                    )?;
                }
                None => tracing::warn!("screen recording requested but no frame source is available"),
            }
        }
        if config.tracing {
            match (trace_session, trace_config) {
                (Some(session), Some(path)) => {
                    self.enable_tracing(session, out_dir, path)?;
                }
                _ => tracing::warn!("tracing requested but no trace session or config is available"),
            }
        }
        if config.battery_mode == BatteryMode::ForceDischarge {
            let supply = power_supply.unwrap_or_else(|| Arc::new(SysfsPowerSupply::default()));
            self.attach_battery_guard(BatteryGuard::new(supply, discharge_threshold))?;
        }
        self.options.config = Arc::new(config);
        self.state = RecorderState::Configured;
        Ok(self)
    }

    /// Report a directly-measured value alongside the histogram metrics.
    pub fn add_scalar(&mut self, metric: PerfMetric, value: f64) -> Result<(), Error> {
        if self.state == RecorderState::Closed {
            return Err(self.invalid("add_scalar"));
        }
        self.scalars.push(Sample { metric, value });
        Ok(())
    }

    /// Execute one scenario.
    ///
    /// Returns the most severe error observed: a tab crash
    /// ([`Error::PostCheckFailed`]) outranks a scenario error
    /// ([`Error::ScenarioFailed`]), which outranks teardown errors. Errors
    /// that were outranked are attached to the returned one.
    pub async fn run<F, Fut>(&mut self, ctx: &RunContext, scenario: F) -> Result<(), Error>
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        self.ensure("run", &[RecorderState::Fresh, RecorderState::Configured, RecorderState::Finished])?;
        let span = tracing::info_span!(parent: ctx.span(), "cuj_run", run = self.recordings.len() + 1);
        let ctx = ctx.with_span(span.clone());
        self.run_inner(&ctx, scenario).instrument(span).await
    }

    async fn run_inner<F, Fut>(&mut self, ctx: &RunContext, scenario: F) -> Result<(), Error>
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let sources = match self
            .configs
            .iter()
            .map(|c| self.sources.get(c.source()))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(sources) => sources,
            Err(e) => return self.abort_run(e),
        };
        let scratch = match tempfile::Builder::new().prefix("cuj-run").tempdir() {
            Ok(dir) => Arc::new(dir),
            Err(e) => return self.abort_run(e.into()),
        };
        self.state = RecorderState::Running;

        let discharge = match self.battery.as_ref().map(BatteryGuard::engage) {
            None => None,
            Some(Ok(discharge)) => Some(discharge),
            Some(Err(e)) if self.options.fail_on_discharge_err => return self.abort_run(e.into()),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "running without forced battery discharge");
                None
            }
        };
        let discharged = discharge.as_ref().is_some_and(Discharge::is_active);

        let baselines = match snapshot_all(ctx, &self.configs, &sources, self.options.snapshot_timeout)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(snapshots) => snapshots,
            Err(e) => {
                release_discharge(discharge, false);
                return self.abort_run(e);
            }
        };

        let timeline = match self.timeline.clone() {
            None => None,
            Some(sampler) => match Timeline::start(sampler).await {
                Ok(timeline) => Some(timeline),
                Err(e) => {
                    release_discharge(discharge, false);
                    return self.abort_run(e.into());
                }
            },
        };
        let mut tracing_active = false;
        if let Some(trace) = self.trace.as_mut() {
            match trace.session.start(&trace.config_path).await {
                Ok(()) => tracing_active = true,
                Err(CollaboratorError::Unsupported) => {
                    tracing::warn!("tracing is not supported on this device, running without a trace");
                }
                Err(e) => {
                    if let Some(timeline) = timeline {
                        timeline.stop().await;
                    }
                    release_discharge(discharge, false);
                    return self.abort_run(e.into());
                }
            }
        }
        let mut screen_active = false;
        if let Some(screen) = self.screen.as_mut() {
            match screen.recorder.start(Some(screen.path.as_path())).await {
                Ok(()) => screen_active = true,
                Err(e) => {
                    if tracing_active {
                        if let Some(trace) = self.trace.as_mut() {
                            trace.session.abort().await;
                        }
                    }
                    if let Some(timeline) = timeline {
                        timeline.stop().await;
                    }
                    release_discharge(discharge, false);
                    return self.abort_run(e.into());
                }
            }
        }
        let shots = self
            .screenshots
            .as_ref()
            .map(|s| Screenshots::spawn(Arc::clone(&s.source), s.out_dir.clone(), s.offset, s.count));

        let (scalar_tx, mut scalar_rx) = mpsc::unbounded_channel();
        let scenario_ctx = ctx
            .shorten(self.options.cleanup_reserve)
            .with_config(Arc::clone(&self.options.config))
            .with_temp_dir(Arc::clone(&scratch))
            .with_scalar_sink(scalar_tx);
        let watchdog = scenario_ctx.clone();

        tracing::info!(metrics = self.configs.len(), "scenario started");
        let started_at = SystemTime::now();
        let clock = Instant::now();
        let outcome: Result<(), BoxError> = tokio::select! {
            biased;
            result = scenario(scenario_ctx) => result,
            err = watchdog.done() => Err(BoxError::from(err)),
        };
        drop(watchdog);
        let elapsed = clock.elapsed();
        match &outcome {
            Ok(()) => tracing::info!(?elapsed, "scenario finished"),
            Err(e) => tracing::warn!(?elapsed, error = %e, "scenario failed"),
        }
        let mut scalars = Vec::new();
        while let Ok(sample) = scalar_rx.try_recv() {
            scalars.push(sample);
        }

        let mut cleanup: Vec<Error> = Vec::new();
        let screenshots = match shots {
            Some(shots) => shots.stop().await,
            None => 0,
        };
        let timeline = match timeline {
            Some(timeline) => timeline.stop().await,
            None => TimelineData::default(),
        };

        let mut media = None;
        if screen_active {
            if let Some(screen) = self.screen.as_mut() {
                let budget = stop_budget(ctx, self.options.stop_timeout);
                match tokio::time::timeout(budget, screen.recorder.stop()).await {
                    Ok(Ok(blob)) => media = Some(blob),
                    Ok(Err(e)) => cleanup.push(e.into()),
                    Err(_) => {
                        screen.recorder.abort().await;
                        cleanup.push(
                            CollaboratorError::Timeout {
                                what: "screen recorder stop",
                                after: budget,
                            }
                            .into(),
                        );
                    }
                }
            }
        }

        let mut trace_path = None;
        if tracing_active {
            if let Some(trace) = self.trace.as_mut() {
                let budget = stop_budget(ctx, self.options.stop_timeout);
                match tokio::time::timeout(budget, trace.session.stop()).await {
                    Ok(Ok(blob)) => match blob.save(&trace.out_dir) {
                        Ok(path) => trace_path = Some(path),
                        Err(e) => cleanup.push(CollaboratorError::Io(e).into()),
                    },
                    Ok(Err(e)) => cleanup.push(e.into()),
                    Err(_) => {
                        trace.session.abort().await;
                        cleanup.push(
                            CollaboratorError::Timeout {
                                what: "trace session stop",
                                after: budget,
                            }
                            .into(),
                        );
                    }
                }
            }
        }

        let mut finals = Vec::with_capacity(self.configs.len());
        for snapshot in snapshot_all(ctx, &self.configs, &sources, self.options.snapshot_timeout).await {
            match snapshot {
                Ok(hist) => finals.push(Some(hist)),
                Err(e) => {
                    tracing::warn!(error = %e, "final snapshot failed");
                    cleanup.push(e);
                    finals.push(None);
                }
            }
        }
        let mut diffs = Vec::new();
        for ((config, before), after) in self.configs.iter().zip(&baselines).zip(&finals) {
            let Some(after) = after else {
                continue;
            };
            match after.diff(before) {
                Ok(diff) if diff.is_empty() => {
                    if config.is_optional() {
                        tracing::debug!(metric = config.name(), "no samples, metric dropped");
                    } else {
                        tracing::warn!(metric = config.name(), "no samples during the scenario, metric dropped");
                    }
                }
                Ok(diff) => diffs.push(diff),
                Err(e) => cleanup.push(e.into()),
            }
        }

        let mut crash = None;
        if let Some(health) = &self.health {
            match health.check().await {
                Ok(Health::Healthy) => {}
                Ok(Health::Crashed(reason)) => crash = Some(reason),
                Err(e) => cleanup.push(e),
            }
        }
        if let Some(e) = release_discharge(discharge, self.options.fail_on_discharge_err) {
            cleanup.push(e);
        }

        let collaborator_errors: Vec<String> = cleanup
            .iter()
            .filter(|e| e.kind() == ErrorKind::CollaboratorFailed)
            .map(ToString::to_string)
            .collect();
        self.collaborator_failures += collaborator_errors.len();
        self.cycles += 1;
        self.total_run_time += elapsed;

        let error = assemble_error(outcome, crash, cleanup);
        self.recordings.push(Recording {
            started_at,
            elapsed,
            baselines,
            finals,
            diffs,
            scalars,
            trace: trace_path,
            screen_recording: media,
            screenshots,
            timeline,
            discharged,
            collaborator_errors,
            error: error.as_ref().map(ToString::to_string),
        });
        self.state = RecorderState::Finished;
        drop(scratch);

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `f` repeatedly inside a single recording until at least
    /// `minimum` has elapsed.
    pub async fn run_for<F, Fut>(&mut self, ctx: &RunContext, mut f: F, minimum: Duration) -> Result<(), Error>
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&cycles);
        let result = self
            .run(ctx, move |ctx| async move {
                let start = Instant::now();
                loop {
                    f(ctx.clone()).await?;
                    counter.fetch_add(1, Ordering::Relaxed);
                    if start.elapsed() >= minimum || ctx.is_cancelled() {
                        return Ok(());
                    }
                }
            })
            .await;
        self.cycles += cycles.load(Ordering::Relaxed).saturating_sub(1);
        result
    }

    /// Call [`run`](Self::run) until `total` has elapsed.
    pub async fn run_until<F, Fut>(&mut self, ctx: &RunContext, mut f: F, total: Duration) -> Result<(), Error>
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let start = Instant::now();
        loop {
            self.run(ctx, &mut f).await?;
            if start.elapsed() >= total || ctx.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// Flush everything collected so far into `values`.
    pub fn record(&self, values: &mut PerfValues) -> Result<(), Error> {
        self.ensure("record", &[RecorderState::Finished])?;
        for Sample { metric, value } in self.samples()? {
            if metric.multiple {
                values.append(metric, value)?;
            } else {
                values.set(metric, value)?;
            }
        }
        Ok(())
    }

    /// Samples of every run so far, with histogram diffs combined across
    /// runs.
    pub fn samples(&self) -> Result<Vec<Sample>, Error> {
        let mut out = Vec::new();
        for config in &self.configs {
            if let Some(combined) = self.combined(config.name())? {
                out.extend(histogram_samples(config, &combined)?);
            }
        }
        for recording in &self.recordings {
            out.extend(timeline_samples(&recording.timeline));
            out.extend(recording.scalars.iter().cloned());
        }
        out.extend(self.scalars.iter().cloned());

        if self.collaborator_failures > 0 {
            out.push(Sample {
                metric: PerfMetric::new(COLLABORATOR_FAILED_METRIC, Unit::Count, Direction::SmallerIsBetter),
                value: self.collaborator_failures as f64,
            });
        }
        if self.options.report_run_metrics && !self.recordings.is_empty() {
            let all_discharged = self.recordings.iter().all(|r| r.discharged);
            out.extend([
                Sample {
                    metric: PerfMetric::new(
                        "Power.MetricsCollectedWithBatteryDischarge",
                        Unit::Unitless,
                        Direction::BiggerIsBetter,
                    ),
                    value: if all_discharged { 1.0 } else { 0.0 },
                },
                Sample {
                    metric: PerfMetric::new("TestMetrics.TestCyclesCount", Unit::Count, Direction::SmallerIsBetter),
                    value: self.cycles as f64,
                },
                Sample {
                    metric: PerfMetric::new("TestMetrics.TotalTestRunTime", Unit::Seconds, Direction::BiggerIsBetter),
                    value: self.total_run_time.as_secs_f64(),
                },
            ]);
        }
        Ok(out)
    }

    /// Samples of the most recent run only.
    pub fn last_samples(&self) -> Result<Vec<Sample>, Error> {
        let Some(last) = self.recordings.last() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for config in &self.configs {
            if let Some(diff) = last.diffs.iter().find(|d| d.name == config.name()) {
                out.extend(histogram_samples(config, diff)?);
            }
        }
        out.extend(timeline_samples(&last.timeline));
        out.extend(last.scalars.iter().cloned());
        Ok(out)
    }

    /// Persist the raw snapshots.
    ///
    /// Writes `recorder_histograms.json` (combined diffs keyed by metric) and
    /// `histograms/<metric>.json` holding every run's baseline, final
    /// snapshot and diff.
    pub fn save_histograms(&self, dir: &Path) -> Result<PathBuf, Error> {
        self.ensure("save_histograms", &[RecorderState::Finished])?;
        let per_metric = dir.join(HISTOGRAMS_DIR);
        fs::create_dir_all(&per_metric)?;

        let mut combined = Map::new();
        for (i, config) in self.configs.iter().enumerate() {
            if let Some(hist) = self.combined(config.name())? {
                combined.insert(config.name().to_string(), serde_json::to_value(&hist)?);
            }
            let runs: Vec<Value> = self
                .recordings
                .iter()
                .map(|r| {
                    json!({
                        "started_at_ms": r
                            .started_at
                            .duration_since(SystemTime::UNIX_EPOCH)
                            .map_or(0, |d| d.as_millis() as u64),
                        "baseline": r.baselines.get(i),
                        "final": r.finals.get(i).and_then(Option::as_ref),
                        "diff": r.diffs.iter().find(|d| d.name == config.name()),
                    })
                })
                .collect();
            let file = per_metric.join(format!("{}.json", file_stem(config.name())));
            fs::write(&file, serde_json::to_string_pretty(&json!({ "name": config.name(), "runs": runs }))?)?;
        }

        let path = dir.join(HISTOGRAMS_FILE);
        fs::write(&path, serde_json::to_string_pretty(&Value::Object(combined))?)?;
        tracing::info!(path = %path.display(), "saved histograms");
        Ok(path)
    }

    /// Release every collaborator. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == RecorderState::Closed {
            return;
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.session.abort().await;
        }
        if let Some(screen) = self.screen.as_mut() {
            screen.recorder.abort().await;
        }
        self.state = RecorderState::Closed;
        tracing::info!(runs = self.recordings.len(), "recorder closed");
    }

    fn combined(&self, name: &str) -> Result<Option<Histogram>, Error> {
        let mut combined: Option<Histogram> = None;
        let diffs = self
            .recordings
            .iter()
            .flat_map(|r| &r.diffs)
            .filter(|d| d.name == name);
        for diff in diffs {
            match combined.as_mut() {
                Some(acc) => acc.combine(diff)?,
                None => combined = Some(diff.clone()),
            }
        }
        Ok(combined)
    }

    fn ensure(&self, operation: &'static str, allowed: &[RecorderState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn abort_run(&mut self, err: Error) -> Result<(), Error> {
        tracing::warn!(error = %err, "run aborted before the scenario started");
        self.state = RecorderState::Finished;
        Err(err)
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state)
            .field("metrics", &self.configs.len())
            .field("runs", &self.recordings.len())
            .field("tracing", &self.trace.is_some())
            .field("screen", &self.screen.is_some())
            .finish_non_exhaustive()
    }
}

fn histogram_samples(config: &MetricConfig, hist: &Histogram) -> Result<Vec<Sample>, Error> {
    let mut out = vec![Sample {
        metric: PerfMetric::new(config.name(), config.unit(), config.direction()),
        value: hist.mean()?,
    }];
    if let Some(t) = config.jank_thresholds() {
        out.push(Sample {
            metric: PerfMetric::new(config.jank_warn_name(), Unit::Count, Direction::SmallerIsBetter),
            value: hist.count_above(t.warn)? as f64,
        });
        out.push(Sample {
            metric: PerfMetric::new(config.jank_fail_name(), Unit::Count, Direction::SmallerIsBetter),
            value: hist.count_above(t.fail)? as f64,
        });
    }
    Ok(out)
}

fn timeline_samples(data: &TimelineData) -> impl Iterator<Item = Sample> + '_ {
    let cpu = PerfMetric::new(CPU_METRIC, Unit::Percent, Direction::SmallerIsBetter).multiple();
    let ram = PerfMetric::new(RAM_METRIC, Unit::Percent, Direction::SmallerIsBetter).multiple();
    let cpu = data.cpu.iter().map(move |&value| Sample {
        metric: cpu.clone(),
        value,
    });
    let ram = data.ram.iter().map(move |&value| Sample {
        metric: ram.clone(),
        value,
    });
    cpu.chain(ram)
}

/// Snapshot every metric in order. One unreachable source does not keep
/// the others from being read.
async fn snapshot_all(
    ctx: &RunContext,
    configs: &[MetricConfig],
    sources: &[Arc<dyn HistogramSource>],
    cap: Duration,
) -> Vec<Result<Histogram, Error>> {
    let mut snapshots = Vec::with_capacity(sources.len());
    for (config, source) in configs.iter().zip(sources) {
        let budget = stop_budget(ctx, cap);
        let snapshot = match tokio::time::timeout(budget, source.snapshot(config.name())).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("snapshot of {} after {budget:?}", config.name()))),
        };
        snapshots.push(snapshot);
    }
    snapshots
}

fn stop_budget(ctx: &RunContext, cap: Duration) -> Duration {
    ctx.remaining().map_or(cap, |left| left.min(cap))
}

/// Restore charging; returns the failure only when it must fail the run.
fn release_discharge(discharge: Option<Discharge>, fatal: bool) -> Option<Error> {
    let err = discharge?.release().err()?;
    if fatal {
        Some(err.into())
    } else {
        tracing::warn!(error = %err, "failed to restore normal charging");
        None
    }
}

fn assemble_error(outcome: Result<(), BoxError>, crash: Option<String>, cleanup: Vec<Error>) -> Option<Error> {
    match (outcome, crash) {
        (outcome, Some(reason)) => {
            let mut related = Vec::with_capacity(cleanup.len() + 1);
            if let Err(source) = outcome {
                related.push(Error::ScenarioFailed {
                    source,
                    cleanup: Vec::new(),
                });
            }
            related.extend(cleanup);
            Some(Error::PostCheckFailed { reason, related })
        }
        (Err(source), None) => Some(Error::ScenarioFailed { source, cleanup }),
        (Ok(()), None) => {
            let mut errors = cleanup.into_iter();
            let first = errors.next();
            for extra in errors {
                tracing::warn!(error = %extra, "additional teardown error");
            }
            first
        }
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serial_test::serial;

    use super::*;
    use crate::{
        battery::tests::FakeSupply,
        health::Health,
        metric::JankThresholds,
        registry,
        screen::tests::CountingFrames,
        source::InMemoryHistogramSource,
        trace::TraceBlob,
    };

    fn setup() -> (Arc<InMemoryHistogramSource>, Recorder) {
        let src = Arc::new(InMemoryHistogramSource::new());
        let rec = Recorder::new(SourceRegistry::shared(src.clone()), RecorderOptions::default());
        (src, rec)
    }

    #[derive(Default)]
    struct FakeTrace {
        log: Arc<Mutex<Vec<&'static str>>>,
        unsupported: bool,
        fail_start: bool,
        hang_on_stop: bool,
        active: bool,
    }

    #[async_trait]
    impl TraceSession for FakeTrace {
        async fn start(&mut self, _config: &Path) -> Result<(), CollaboratorError> {
            self.log.lock().unwrap().push("trace start");
            if self.unsupported {
                return Err(CollaboratorError::Unsupported);
            }
            if self.fail_start {
                return Err(CollaboratorError::AlreadyTracing);
            }
            self.active = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<TraceBlob, CollaboratorError> {
            self.log.lock().unwrap().push("trace stop");
            if self.hang_on_stop {
                std::future::pending::<()>().await;
            }
            if !std::mem::take(&mut self.active) {
                return Err(CollaboratorError::NoActiveTrace);
            }
            Ok(TraceBlob::new(b"trace".to_vec()))
        }

        async fn abort(&mut self) {
            if std::mem::take(&mut self.active) {
                self.log.lock().unwrap().push("trace abort");
            }
        }
    }

    struct Crashy;

    /// A screen recorder whose start always fails.
    struct BrokenScreen;

    #[async_trait]
    impl ScreenRecorder for BrokenScreen {
        async fn start(&mut self, _output: Option<&Path>) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::RecordingInProgress)
        }

        async fn stop(&mut self) -> Result<MediaBlob, CollaboratorError> {
            Err(CollaboratorError::NoActiveRecording)
        }

        async fn save_as(&self, _path: &Path) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::NoActiveRecording)
        }
    }

    #[async_trait]
    impl TabHealthCheck for Crashy {
        async fn check(&self) -> Result<Health, Error> {
            Ok(Health::Crashed("renderer gone".into()))
        }
    }

    #[tokio::test]
    async fn duplicate_and_late_configuration_is_rejected() {
        let (_src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        let err = rec
            .add([MetricConfig::smoothness("Ash.B"), MetricConfig::smoothness("Ash.A")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(rec.configs().len(), 1);
        assert!(rec.add([MetricConfig::smoothness("Ash.C"), MetricConfig::smoothness("Ash.C")]).is_err());

        rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap();
        assert_eq!(rec.state(), RecorderState::Finished);
        let err = rec.add([MetricConfig::smoothness("Ash.D")]).unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "add", .. }));
    }

    #[tokio::test]
    async fn record_requires_a_finished_run() {
        let (_src, rec) = setup();
        let mut pv = PerfValues::new();
        assert!(matches!(rec.record(&mut pv), Err(Error::InvalidState { .. })));
        assert!(rec.save_histograms(Path::new("/nonexistent")).is_err());
    }

    #[tokio::test]
    async fn immediate_scenario_records_nothing() {
        let (src, mut rec) = setup();
        src.add_sample("Ash.A", 10);
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap();

        let recording = &rec.recordings()[0];
        let finals: Vec<Histogram> = recording.finals.iter().flatten().cloned().collect();
        assert_eq!(recording.baselines, finals);
        assert!(recording.diffs.is_empty());
        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert!(pv.is_empty());
    }

    #[tokio::test]
    async fn diffs_ignore_samples_before_the_run() {
        let (src, mut rec) = setup();
        src.add_sample("Ash.A", 10);
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        let feeder = src.clone();
        rec.run(&RunContext::background(), move |_| async move {
            feeder.add_sample("Ash.A", 50);
            feeder.add_sample("Ash.A", 70);
            Ok(())
        })
        .await
        .unwrap();

        let samples = rec.last_samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 60.0);
        assert_eq!(samples[0].metric.unit, Unit::Percent);
    }

    #[tokio::test]
    async fn runs_combine_and_jank_counts_follow_thresholds() {
        let (src, mut rec) = setup();
        rec.add([MetricConfig::latency("Ash.Drag.PresentationTime")
            .with_jank_thresholds(JankThresholds::new(50, 80))])
            .unwrap();
        for values in [[40, 60], [90, 30]] {
            let feeder = src.clone();
            rec.run(&RunContext::background(), move |_| async move {
                for v in values {
                    feeder.add_sample("Ash.Drag.PresentationTime", v);
                }
                Ok(())
            })
            .await
            .unwrap();
        }
        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert_eq!(pv.values("Ash.Drag.PresentationTime"), Some(&[55.0][..]));
        assert_eq!(pv.values("Ash.Drag.PresentationTime.JankyAboveWarn"), Some(&[2.0][..]));
        assert_eq!(pv.values("Ash.Drag.PresentationTime.JankyAboveFail"), Some(&[1.0][..]));

        // Recording twice into the same values is harmless.
        rec.record(&mut pv).unwrap();
    }

    #[tokio::test]
    async fn scenario_errors_keep_collected_diffs() {
        let (src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        let feeder = src.clone();
        let err = rec
            .run(&RunContext::background(), move |_| async move {
                feeder.add_sample("Ash.A", 90);
                Err(BoxError::from("button not found"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScenarioFailed);
        assert!(err.to_string().contains("button not found"));
        assert_eq!(rec.last_samples().unwrap()[0].value, 90.0);
    }

    #[tokio::test]
    async fn unreachable_source_aborts_before_the_scenario() {
        let (src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        src.set_reachable(false);
        let ran = Arc::new(AtomicU64::new(0));
        let flag = ran.clone();
        let err = rec
            .run(&RunContext::background(), move |_| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(rec.state(), RecorderState::Finished);
        assert!(rec.recordings().is_empty());
    }

    #[tokio::test]
    async fn missing_process_source_is_a_configuration_error() {
        let src = Arc::new(InMemoryHistogramSource::new());
        let mut rec = Recorder::new(
            SourceRegistry::new().with(crate::metric::MetricSource::Ui, src),
            RecorderOptions::default(),
        );
        rec.add([MetricConfig::smoothness("Browser.A").with_source(crate::metric::MetricSource::Browser)])
            .unwrap();
        let err = rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn tab_crash_outranks_scenario_success() {
        let (src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        rec.install_health_check(Box::new(Crashy)).await.unwrap();
        let feeder = src.clone();
        let err = rec
            .run(&RunContext::background(), move |_| async move {
                feeder.add_sample("Ash.A", 75);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostCheckFailed);

        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert_eq!(pv.values("Ash.A"), Some(&[75.0][..]));
    }

    #[tokio::test]
    async fn unsupported_tracing_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (src, mut rec) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        rec.enable_tracing(
            Box::new(FakeTrace {
                log: log.clone(),
                unsupported: true,
                ..FakeTrace::default()
            }),
            dir.path(),
            dir.path().join("cfg"),
        )
        .unwrap();
        let feeder = src.clone();
        rec.run(&RunContext::background(), move |_| async move {
            feeder.add_sample("Ash.A", 1);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["trace start"]);
        assert!(rec.recordings()[0].trace.is_none());
        assert!(!dir.path().join(crate::trace::TRACE_FILE).exists());
    }

    #[tokio::test]
    async fn trace_wraps_the_scenario_and_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (_src, mut rec) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        rec.enable_tracing(
            Box::new(FakeTrace {
                log: log.clone(),
                ..FakeTrace::default()
            }),
            dir.path(),
            dir.path().join("cfg"),
        )
        .unwrap();
        let scenario_log = log.clone();
        rec.run(&RunContext::background(), move |_| async move {
            scenario_log.lock().unwrap().push("scenario");
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["trace start", "scenario", "trace stop"]);
        assert_eq!(
            rec.recordings()[0].trace.as_deref(),
            Some(dir.path().join(crate::trace::TRACE_FILE).as_path())
        );

        rec.close().await;
        rec.close().await;
        assert_eq!(rec.state(), RecorderState::Closed);
        assert!(rec.run(&RunContext::background(), |_| async { Ok(()) }).await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn screen_recording_and_battery_are_released_after_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let supply = FakeSupply::new(Some(90.0));
        let (_src, mut rec) = setup();
        rec.apply_config(
            ScenarioConfig::from_params([("record", "true"), ("batteryMode", "ForceDischarge")]).unwrap(),
            dir.path(),
            Collaborators::builder()
                .frame_source(Arc::new(CountingFrames::default()) as Arc<dyn FrameSource>)
                .power_supply(supply.clone() as Arc<dyn PowerSupply>)
                .build(),
        )
        .unwrap();

        rec.run(&RunContext::background(), |ctx| async move {
            assert!(registry::is_screen_recording());
            assert!(registry::is_discharging());
            assert!(ctx.config().record);
            assert!(ctx.temp_dir().is_some_and(Path::exists));
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        })
        .await
        .unwrap();

        assert!(!registry::is_screen_recording());
        assert!(!registry::is_discharging());
        assert_eq!(supply.calls(), vec![true, false]);
        let media = rec.recordings()[0].screen_recording.clone().unwrap();
        assert_eq!(media.path, dir.path().join(DEFAULT_RECORDING_NAME));
        assert!(media.size > 0);
        assert!(rec.recordings()[0].discharged);
    }

    #[tokio::test]
    async fn scalars_flow_from_the_context() {
        let (_src, mut rec) = setup();
        let metric = PerfMetric::new("Browser.StartTime", Unit::Milliseconds, Direction::SmallerIsBetter);
        let m = metric.clone();
        rec.run(&RunContext::background(), move |ctx| async move {
            ctx.record_scalar(m, 420.0)?;
            Ok(())
        })
        .await
        .unwrap();
        rec.add_scalar(metric.clone().with_variant("total"), 1.5).unwrap();

        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert_eq!(pv.values("Browser.StartTime"), Some(&[420.0][..]));
        assert_eq!(pv.get("Browser.StartTime", "total").map(|(_, v)| v), Some(&[1.5][..]));
    }

    #[tokio::test]
    async fn run_for_repeats_inside_one_recording() {
        let (src, mut rec) = setup();
        let rec_opts = RecorderOptions::builder().report_run_metrics(true).build();
        rec.options = rec_opts;
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        let feeder = src.clone();
        rec.run_for(
            &RunContext::background(),
            move |_| {
                let feeder = feeder.clone();
                async move {
                    feeder.add_sample("Ash.A", 40);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                }
            },
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(rec.recordings().len(), 1);
        let samples = rec.samples().unwrap();
        let cycles = samples
            .iter()
            .find(|s| s.metric.name == "TestMetrics.TestCyclesCount")
            .unwrap();
        assert!(cycles.value >= 4.0, "{}", cycles.value);
    }

    #[tokio::test]
    async fn save_histograms_dumps_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let (src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A"), MetricConfig::smoothness("Ash.Idle")])
            .unwrap();
        let feeder = src.clone();
        rec.run(&RunContext::background(), move |_| async move {
            feeder.add_sample("Ash.A", 5);
            Ok(())
        })
        .await
        .unwrap();
        let path = rec.save_histograms(dir.path()).unwrap();

        let combined: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(combined.get("Ash.A").is_some());
        assert!(combined.get("Ash.Idle").is_none());

        let idle: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("histograms/Ash.Idle.json")).unwrap()).unwrap();
        assert_eq!(idle["runs"][0]["diff"], Value::Null);
        assert_eq!(idle["runs"][0]["baseline"]["name"], "Ash.Idle");
        assert_eq!(idle["runs"][0]["final"]["name"], "Ash.Idle");
    }

    #[tokio::test]
    async fn failing_source_keeps_the_other_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let ui = Arc::new(InMemoryHistogramSource::new());
        let browser = Arc::new(InMemoryHistogramSource::new());
        let mut rec = Recorder::new(
            SourceRegistry::new()
                .with(crate::metric::MetricSource::Ui, ui.clone())
                .with(crate::metric::MetricSource::Browser, browser.clone()),
            RecorderOptions::default(),
        );
        rec.add([
            MetricConfig::smoothness("Ash.A"),
            MetricConfig::smoothness("Browser.B").with_source(crate::metric::MetricSource::Browser),
        ])
        .unwrap();

        let (feeder, gone) = (ui.clone(), browser.clone());
        let err = rec
            .run(&RunContext::background(), move |_| async move {
                feeder.add_sample("Ash.A", 60);
                gone.add_sample("Browser.B", 30);
                gone.set_reachable(false);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);

        let recording = &rec.recordings()[0];
        assert!(recording.finals[0].is_some());
        assert!(recording.finals[1].is_none());
        assert_eq!(recording.diffs.len(), 1);

        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert_eq!(pv.values("Ash.A"), Some(&[60.0][..]));
        assert_eq!(pv.values("Browser.B"), None);

        rec.save_histograms(dir.path()).unwrap();
        let read = |name: &str| -> Value {
            let path = dir.path().join(HISTOGRAMS_DIR).join(format!("{name}.json"));
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
        };
        assert_eq!(read("Ash.A")["runs"][0]["final"]["name"], "Ash.A");
        assert_eq!(read("Browser.B")["runs"][0]["baseline"]["name"], "Browser.B");
        assert_eq!(read("Browser.B")["runs"][0]["final"], Value::Null);
    }

    #[tokio::test]
    async fn hanging_trace_stop_is_aborted_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (_src, mut rec) = setup();
        rec.options = RecorderOptions::builder()
            .stop_timeout(Duration::from_millis(50))
            .build();
        let log = Arc::new(Mutex::new(Vec::new()));
        rec.enable_tracing(
            Box::new(FakeTrace {
                log: log.clone(),
                hang_on_stop: true,
                ..FakeTrace::default()
            }),
            dir.path(),
            dir.path().join("cfg"),
        )
        .unwrap();

        let err = rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorFailed);
        assert!(err.to_string().contains("trace session stop"), "{err}");
        assert_eq!(*log.lock().unwrap(), vec!["trace start", "trace stop", "trace abort"]);
        assert_eq!(rec.recordings()[0].collaborator_errors.len(), 1);
        assert!(rec.recordings()[0].trace.is_none());

        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        assert_eq!(pv.values(COLLABORATOR_FAILED_METRIC), Some(&[1.0][..]));
    }

    #[tokio::test]
    #[serial]
    async fn screen_start_failure_aborts_the_trace_and_releases_the_battery() {
        let dir = tempfile::tempdir().unwrap();
        let supply = FakeSupply::new(Some(90.0));
        let (_src, mut rec) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        rec.enable_tracing(
            Box::new(FakeTrace {
                log: log.clone(),
                ..FakeTrace::default()
            }),
            dir.path(),
            dir.path().join("cfg"),
        )
        .unwrap();
        rec.attach_screen_recorder(Box::new(BrokenScreen), dir.path(), "")
            .unwrap();
        rec.attach_battery_guard(BatteryGuard::new(supply.clone(), DEFAULT_DISCHARGE_THRESHOLD))
            .unwrap();

        let ran = Arc::new(AtomicU64::new(0));
        let flag = ran.clone();
        let err = rec
            .run(&RunContext::background(), move |_| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorFailed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec!["trace start", "trace abort"]);
        assert_eq!(supply.calls(), vec![true, false]);
        assert!(!registry::is_discharging());
        assert_eq!(rec.state(), RecorderState::Finished);
    }

    #[tokio::test]
    #[serial]
    async fn battery_is_released_when_the_run_aborts_early() {
        let dir = tempfile::tempdir().unwrap();

        // Baseline snapshot fails.
        let supply = FakeSupply::new(Some(90.0));
        let (src, mut rec) = setup();
        rec.add([MetricConfig::smoothness("Ash.A")]).unwrap();
        rec.attach_battery_guard(BatteryGuard::new(supply.clone(), DEFAULT_DISCHARGE_THRESHOLD))
            .unwrap();
        src.set_reachable(false);
        let err = rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(supply.calls(), vec![true, false]);
        assert!(!registry::is_discharging());

        // Trace start fails.
        let supply = FakeSupply::new(Some(90.0));
        let (_src, mut rec) = setup();
        rec.enable_tracing(
            Box::new(FakeTrace {
                fail_start: true,
                ..FakeTrace::default()
            }),
            dir.path(),
            dir.path().join("cfg"),
        )
        .unwrap();
        rec.attach_battery_guard(BatteryGuard::new(supply.clone(), DEFAULT_DISCHARGE_THRESHOLD))
            .unwrap();
        let err = rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorFailed);
        assert_eq!(supply.calls(), vec![true, false]);
        assert!(!registry::is_discharging());

        // Timeline start fails.
        let supply = FakeSupply::new(Some(90.0));
        let (_src, mut rec) = setup();
        rec.enable_timeline(PlatformSampler::default().with_stat_path(dir.path().join("missing")))
            .unwrap();
        rec.attach_battery_guard(BatteryGuard::new(supply.clone(), DEFAULT_DISCHARGE_THRESHOLD))
            .unwrap();
        let err = rec.run(&RunContext::background(), |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorFailed);
        assert_eq!(supply.calls(), vec![true, false]);
        assert!(!registry::is_discharging());
    }

    #[tokio::test]
    async fn timeline_samples_are_reported_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let stat = dir.path().join("stat");
        let meminfo = dir.path().join("meminfo");
        fs::write(&stat, "cpu  100 0 0 900 0 0 0\n").unwrap();
        fs::write(&meminfo, "MemTotal: 2000 kB\nMemAvailable: 1500 kB\n").unwrap();

        let (_src, mut rec) = setup();
        rec.enable_timeline(
            PlatformSampler::default()
                .with_stat_path(&stat)
                .with_meminfo_path(&meminfo)
                .with_interval(Duration::from_millis(10)),
        )
        .unwrap();
        rec.run(&RunContext::background(), |_| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(())
        })
        .await
        .unwrap();

        let timeline = &rec.recordings()[0].timeline;
        assert!(!timeline.cpu.is_empty());
        let mut pv = PerfValues::new();
        rec.record(&mut pv).unwrap();
        let ram = pv.values(RAM_METRIC).unwrap();
        assert_eq!(ram.len(), timeline.ram.len());
        assert!(ram.iter().all(|&v| v == 25.0), "{ram:?}");
        let (cpu, values) = pv.get(CPU_METRIC, "summary").unwrap();
        assert!(cpu.multiple);
        assert_eq!(cpu.unit, Unit::Percent);
        assert!(values.iter().all(|&v| v == 0.0), "{values:?}");
    }
}
