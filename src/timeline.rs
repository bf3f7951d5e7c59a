//! Platform load sampled in the background while a scenario runs.
//!
//! A [`PlatformSampler`] reads the aggregate `cpu` line of `/proc/stat` and
//! `/proc/meminfo` once per interval. Each interval contributes one CPU busy
//! percentage and one RAM usage percentage; the recorder reports them as the
//! multi-value metrics [`CPU_METRIC`] and [`RAM_METRIC`].

use std::{io, path::PathBuf, time::Duration};

use tokio::{
    sync::watch::{self, Sender},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{error::CollaboratorError, runner::CpuTimes};

pub const CPU_METRIC: &str = "TPS.CPU";
pub const RAM_METRIC: &str = "TPS.RAM";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PlatformSampler {
    stat_path: PathBuf,
    meminfo_path: PathBuf,
    interval: Duration,
}

impl Default for PlatformSampler {
    fn default() -> Self {
        Self {
            stat_path: PathBuf::from("/proc/stat"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl PlatformSampler {
    pub fn with_stat_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stat_path = path.into();
        self
    }

    pub fn with_meminfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meminfo_path = path.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn cpu_times(&self) -> io::Result<CpuTimes> {
        let text = tokio::fs::read_to_string(&self.stat_path).await?;
        text.lines().find_map(CpuTimes::parse).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no cpu line in {}", self.stat_path.display()),
            )
        })
    }

    async fn ram_percent(&self) -> io::Result<f64> {
        let text = tokio::fs::read_to_string(&self.meminfo_path).await?;
        parse_meminfo(&text).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no MemTotal/MemAvailable in {}", self.meminfo_path.display()),
            )
        })
    }
}

/// Used share of physical memory, in percent.
fn parse_meminfo(text: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let slot = match fields.next() {
            Some("MemTotal:") => &mut total,
            Some("MemAvailable:") => &mut available,
            _ => continue,
        };
        *slot = fields.next().and_then(|kb| kb.parse::<u64>().ok());
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

/// One value per sampling interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineData {
    pub cpu: Vec<f64>,
    pub ram: Vec<f64>,
}

impl TimelineData {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.ram.is_empty()
    }
}

/// The running sampler task.
pub(crate) struct Timeline {
    shutdown: Sender<bool>,
    task: JoinHandle<TimelineData>,
}

impl Timeline {
    /// Take the first CPU reading and start sampling. Fails when the
    /// platform files cannot be read at all.
    pub(crate) async fn start(sampler: PlatformSampler) -> Result<Self, CollaboratorError> {
        if sampler.interval.is_zero() {
            return Err(CollaboratorError::Failed {
                what: "timeline start",
                reason: "sampling interval must be positive".into(),
            });
        }
        let mut previous = sampler.cpu_times().await?;
        sampler.ram_percent().await?;

        let interval = sampler.interval;
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut data = TimelineData::default();
            let mut ticker = tokio::time::interval(sampler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = rx.changed() => break,
                    _ = ticker.tick() => {
                        match sampler.cpu_times().await {
                            Ok(current) => {
                                data.cpu.push(current.busy_since(&previous));
                                previous = current;
                            }
                            Err(e) => tracing::warn!(error = %e, "cpu sample failed"),
                        }
                        match sampler.ram_percent().await {
                            Ok(ram) => data.ram.push(ram),
                            Err(e) => tracing::warn!(error = %e, "memory sample failed"),
                        }
                    }
                }
            }
            data
        });
        tracing::debug!(?interval, "timeline started");
        Ok(Self { shutdown, task })
    }

    /// Stop sampling and return what was collected.
    pub(crate) async fn stop(self) -> TimelineData {
        self.shutdown.send_replace(true);
        match self.task.await {
            Ok(data) => {
                tracing::debug!(samples = data.cpu.len(), "timeline stopped");
                data
            }
            Err(e) => {
                tracing::warn!(error = %e, "timeline task failed");
                TimelineData::default()
            }
        }
    }
}
