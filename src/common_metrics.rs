//! Stock metric lists every journey collects on top of its own.
//!
//! Histograms are grouped by the process that records them. Register the
//! list matching where the browser runs:
//!
//! ```rust
//! use cuj_recorder::common_metrics;
//!
//! let mut configs = common_metrics::ui_configs();
//! configs.extend(common_metrics::browser_configs());
//! configs.extend(common_metrics::any_process_configs());
//! assert!(configs.iter().all(|c| c.validate().is_ok()));
//! ```

use crate::metric::{Direction, MetricConfig, MetricSource, Unit};

const UI_PRESENTATION_TIMES: &[&str] = &[
    "Ash.SplitViewResize.PresentationTime.ClamshellMode.SingleWindow",
    "Ash.SplitViewResize.PresentationTime.ClamshellMode.WithOverview",
    "Ash.TabDrag.PresentationTime.ClamshellMode",
    "Ash.TabDrag.PresentationTime.MaxLatency.ClamshellMode",
    "Apps.PaginationTransition.DragScroll.PresentationTime.TabletMode",
    "Apps.StateTransition.Drag.PresentationTime.TabletMode",
];

const UI_SMOOTHNESS: &[&str] = &[
    "Apps.HomeLauncherTransition.AnimationSmoothness.EnterFullscreenAllApps",
    "Apps.HomeLauncherTransition.AnimationSmoothness.FadeInOverview",
    "Apps.PaginationTransition.AnimationSmoothness.ClamshellMode",
    "Apps.StateTransition.AnimationSmoothness",
    "Ash.Homescreen.AnimationSmoothness",
    "Ash.HotseatTransition.AnimationSmoothness.TransitionToShownHotseat",
    "Ash.Overview.AnimationSmoothness.Enter.ClamshellMode",
    "Ash.Overview.AnimationSmoothness.Exit.ClamshellMode",
    "Ash.Overview.AnimationSmoothness.Enter.TabletMode",
    "Ash.Overview.AnimationSmoothness.Exit.TabletMode",
    "Ash.Rotation.AnimationSmoothness",
    "Ash.WindowCycleView.AnimationSmoothness.Show",
    "Ash.Window.AnimationSmoothness.CrossFade",
    "Ash.Window.AnimationSmoothness.Snap",
];

const UI_DROPPED_FRAMES: &[&str] = &[
    "Ash.Smoothness.PercentDroppedFrames_1sWindow",
    "Graphics.Smoothness.MaxPercentDroppedFrames_1sWindow",
];

const UI_DRAG_LATENCIES: &[&str] = &[
    "Ash.DragWindowFromShelf.PresentationTime",
    "Ash.HotseatTransition.Drag.PresentationTime",
];

const BOOT_TIMES: &[&str] = &[
    "BootTime.Authenticate",
    "BootTime.Chrome",
    "BootTime.Kernel",
    "BootTime.Total2",
    "ShutdownTime.Logout",
    "ShutdownTime.Restart",
];

const BROWSER_EVENT_LATENCIES_US: &[&str] = &[
    "EventLatency.GestureScrollUpdate.Touchscreen.TotalLatency",
    "EventLatency.GestureScrollUpdate.Wheel.TotalLatency",
    "EventLatency.KeyPressed.TotalLatency",
    "EventLatency.MousePressed.TotalLatency",
    "EventLatency.MouseWheel.TotalLatency",
];

const BROWSER_TIMINGS_MS: &[&str] = &[
    "Browser.Tabs.TotalSwitchDuration.WithSavedFrames",
    "PageLoad.InteractiveTiming.InputDelay3",
    "PageLoad.PaintTiming.NavigationToFirstContentfulPaint",
    "PageLoad.PaintTiming.NavigationToLargestContentfulPaint2",
    "Startup.FirstWebContents.NonEmptyPaint3",
    "MPArch.RWH_TabSwitchPaintDuration",
    "Media.Video.Roughness.60fps",
];

const BROWSER_DROPPED_FRAMES: &[&str] = &[
    "Graphics.Smoothness.PercentDroppedFrames.AllInteractions",
    "Graphics.Smoothness.PercentDroppedFrames.AllSequences",
    "WebRTC.Video.DroppedFrames.Capturer",
    "WebRTC.Video.DroppedFrames.Encoder",
];

fn lower_is_better(names: &'static [&'static str], unit: Unit) -> impl Iterator<Item = MetricConfig> {
    names
        .iter()
        .map(move |name| MetricConfig::custom(*name, unit, Direction::SmallerIsBetter))
}

/// Histograms recorded by the shell UI process.
pub fn ui_configs() -> Vec<MetricConfig> {
    let mut configs: Vec<MetricConfig> = lower_is_better(UI_PRESENTATION_TIMES, Unit::Milliseconds)
        .chain(lower_is_better(UI_DROPPED_FRAMES, Unit::Percent))
        .chain(UI_SMOOTHNESS.iter().map(|n| MetricConfig::smoothness(*n)))
        .chain(UI_DRAG_LATENCIES.iter().map(|n| MetricConfig::latency(*n)))
        .chain(lower_is_better(BOOT_TIMES, Unit::Milliseconds))
        .collect();
    configs.extend([
        MetricConfig::custom("Cras.FetchDelayMilliSeconds", Unit::Milliseconds, Direction::SmallerIsBetter),
        MetricConfig::custom("Cras.UnderrunsPerDevice", Unit::Count, Direction::SmallerIsBetter),
        MetricConfig::custom("Arc.App.LowMemoryKills.LinuxOOMCount10Minutes", Unit::Apps, Direction::SmallerIsBetter),
        MetricConfig::custom("Discarding.DailyDiscards.Urgent", Unit::Tabs, Direction::SmallerIsBetter),
        MetricConfig::custom("Power.BatteryDischargeRate", Unit::Milliwatts, Direction::SmallerIsBetter),
    ]);
    configs.into_iter().map(MetricConfig::optional).collect()
}

/// Histograms recorded by the browser process, wherever it runs.
pub fn browser_configs() -> Vec<MetricConfig> {
    let mut configs: Vec<MetricConfig> = lower_is_better(BROWSER_EVENT_LATENCIES_US, Unit::Microseconds)
        .chain(lower_is_better(BROWSER_TIMINGS_MS, Unit::Milliseconds))
        .chain(lower_is_better(BROWSER_DROPPED_FRAMES, Unit::Percent))
        .collect();
    configs.extend([
        MetricConfig::smoothness("Chrome.Tabs.AnimationSmoothness.TabLoading"),
        MetricConfig::custom(
            "Browser.Responsiveness.JankyIntervalsPerThirtySeconds3",
            Unit::Janks,
            Direction::SmallerIsBetter,
        ),
        MetricConfig::custom("Media.DroppedFrameCount", Unit::Count, Direction::SmallerIsBetter),
    ]);
    configs
        .into_iter()
        .map(|c| c.with_source(MetricSource::Browser).optional())
        .collect()
}

/// Histograms any process may record.
pub fn any_process_configs() -> Vec<MetricConfig> {
    vec![MetricConfig::smoothness("Ash.Window.AnimationSmoothness.Hide").optional()]
}
