//! cuj-recorder: measure critical user journeys through histogram diffs.
//!
//! A critical user journey (CUJ) is a scripted interaction with the system
//! under test: open the overview, drag a window, switch tabs. The observed
//! processes keep cumulative histograms of what happened (frame times,
//! latencies, dropped frames). This crate snapshots those histograms around a
//! scenario, diffs the snapshots and turns the activity in between into
//! performance values.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`HistogramSource`]: the only view of an observed process. Hands out
//!   cumulative [`Histogram`] snapshots by name.
//! - [`MetricConfig`]: declares one histogram to collect, its unit, direction
//!   and optional jank thresholds.
//! - [`Recorder`]: wraps one scenario invocation. Takes baselines, starts the
//!   optional collaborators (trace session, screen recorder, screenshots,
//!   battery guard, platform timeline), runs the scenario, stops everything
//!   again and diffs.
//! - [`RunContext`]: what a scenario body receives. Carries deadline,
//!   cancellation, tracing span, scratch directory and harness configuration.
//! - [`Runner`]: runs a scenario several times through a recorder and
//!   aggregates the iterations with a [`StoreStrategy`].
//! - [`PerfValues`]: the append-only result, saved as `results-chart.json`.
//!
//! Collaborators are capabilities behind traits ([`TraceSession`],
//! [`ScreenRecorder`], [`FrameSource`], [`PowerSupply`],
//! [`TabHealthCheck`]), each with a process-backed implementation. Screen
//! recording, tracing and forced battery discharge are process-wide
//! singletons; a second concurrent user gets a typed error.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cuj_recorder::{
//!     InMemoryHistogramSource, MetricConfig, PerfValues, Recorder, RecorderOptions, RunContext,
//!     SourceRegistry,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), cuj_recorder::Error> {
//! let ui = Arc::new(InMemoryHistogramSource::new());
//! let mut recorder = Recorder::new(SourceRegistry::shared(ui.clone()), RecorderOptions::default());
//! recorder.add([MetricConfig::smoothness("Ash.Overview.AnimationSmoothness.Enter")])?;
//!
//! let app = ui.clone();
//! recorder
//!     .run(&RunContext::background(), move |_ctx| async move {
//!         // Drive the UI; the observed process records what it saw.
//!         app.add_sample("Ash.Overview.AnimationSmoothness.Enter", 92);
//!         Ok(())
//!     })
//!     .await?;
//!
//! let mut values = PerfValues::new();
//! recorder.record(&mut values)?;
//! assert_eq!(values.values("Ash.Overview.AnimationSmoothness.Enter"), Some(&[92.0][..]));
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! Everything is reported through [`tracing`]. The crate never installs a
//! subscriber; each recorder run opens a `cuj_run` span and each runner
//! iteration an `iteration` span.

/// Multi-iteration aggregation strategies
pub mod aggregate;
/// Forced battery discharge
pub mod battery;
/// Stock metric lists
pub mod common_metrics;
/// Harness parameters
pub mod config;
/// The handle passed to scenario bodies
pub mod context;
pub mod error;
/// Post-scenario crash detection
pub mod health;
/// Cumulative histograms and their diffs
pub mod histogram;
/// Metric declarations
pub mod metric;
/// The recorder itself
pub mod recorder;
/// Process-wide collaborator reservations
pub mod registry;
/// Repeated runs
pub mod runner;
/// Screen recording and screenshots
pub mod screen;
/// Where histograms come from
pub mod source;
/// Background CPU and memory sampling
pub mod timeline;
/// System tracing
pub mod trace;
/// Perf values and `results-chart.json`
pub mod values;

pub use aggregate::{Aggregation, StoreStrategy};
pub use battery::{BatteryGuard, BatteryMode, Discharge, PowerSupply, SysfsPowerSupply};
pub use config::{CujMode, ScenarioConfig};
pub use context::{CancelHandle, RunContext};
pub use error::{BoxError, CollaboratorError, Error, ErrorKind};
pub use health::{CrashDumpHealthCheck, Health, TabHealthCheck};
pub use histogram::{Histogram, HistogramBucket};
pub use metric::{Direction, JankThresholds, MetricConfig, MetricSource, Unit};
pub use recorder::{Collaborators, Recorder, RecorderOptions, RecorderState, Recording, Sample};
pub use runner::{BatteryPolicy, CpuIdleWaiter, ProcStatIdleWaiter, Runner, RunnerError, run_and_wait_all};
pub use screen::{CaptureScreenRecorder, FrameSource, MediaBlob, ScreenRecorder};
pub use source::{BucketLayout, HistogramSource, InMemoryHistogramSource, SourceRegistry};
pub use timeline::{PlatformSampler, TimelineData};
pub use trace::{CommandTraceSession, TraceBlob, TraceSession};
pub use values::{PerfMetric, PerfValues};
