//! System-wide tracing around a scenario.
//!
//! A [`TraceSession`] is started with a trace config before the scenario and
//! stopped right after it, yielding a [`TraceBlob`]. The recorder stores the
//! blob gzipped as `trace.data.gz` next to the other artifacts.
//!
//! [`CommandTraceSession`] drives an external `perfetto`-style tracer: the
//! child process is spawned on start, its stderr is pumped into `tracing`
//! by a background task, and stop asks it to flush with `SIGTERM`.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use tempfile::TempPath;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    error::CollaboratorError,
    registry::{self, Reservation},
};

pub const TRACE_FILE: &str = "trace.data.gz";

/// Raw trace data collected by one session.
#[derive(Clone, PartialEq, Eq)]
pub struct TraceBlob {
    pub data: Vec<u8>,
}

impl TraceBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write the blob gzipped to `dir/trace.data.gz`.
    pub fn save(&self, dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(TRACE_FILE);
        let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
        encoder.write_all(&self.data)?;
        encoder.finish()?.sync_all()?;
        Ok(path)
    }
}

impl fmt::Debug for TraceBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceBlob({} bytes)", self.data.len())
    }
}

/// Capability to record a system-wide trace.
///
/// At most one session is active per process. [`stop`](Self::stop) may be
/// called once per successful [`start`](Self::start); a second call fails
/// with [`CollaboratorError::NoActiveTrace`]. Platforms without tracing
/// support fail `start` with [`CollaboratorError::Unsupported`].
///
/// [`abort`](Self::abort) tears an active session down without collecting
/// anything; it is issued after a timed-out stop and on recorder close, and
/// must be a no-op when nothing is running.
#[async_trait]
pub trait TraceSession: Send {
    async fn start(&mut self, config: &Path) -> Result<(), CollaboratorError>;

    async fn stop(&mut self) -> Result<TraceBlob, CollaboratorError>;

    async fn abort(&mut self) {}
}

/// Trace session backed by an external tracer binary.
///
/// The tracer is invoked as
/// `<program> <args..> --txt -c <config> -o <output>`.
pub struct CommandTraceSession {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
    active: Option<ActiveTrace>,
}

struct ActiveTrace {
    child: Child,
    output: TempPath,
    pump: Option<JoinHandle<()>>,
    _slot: Reservation,
}

impl Default for CommandTraceSession {
    fn default() -> Self {
        Self::new("perfetto")
    }
}

impl CommandTraceSession {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stop_grace: Duration::from_secs(10),
            active: None,
        }
    }

    /// Arguments placed before the tracer flags.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How long the tracer may take to flush after `SIGTERM`.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

#[async_trait]
impl TraceSession for CommandTraceSession {
    async fn start(&mut self, config: &Path) -> Result<(), CollaboratorError> {
        if self.active.is_some() {
            return Err(CollaboratorError::AlreadyTracing);
        }
        if !config.exists() {
            return Err(CollaboratorError::failed(
                "trace config",
                format!("{} does not exist", config.display()),
            ));
        }
        let slot = registry::reserve_trace_session()?;
        let output = tempfile::Builder::new()
            .prefix("trace")
            .suffix(".pb")
            .tempfile()?
            .into_temp_path();

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .arg("--txt")
            .arg("-c")
            .arg(config)
            .arg("-o")
            .arg(&*output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CollaboratorError::Unsupported);
            }
            Err(e) => return Err(e.into()),
        };

        let pump = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "cuj_recorder::tracer", "{line}");
                }
            })
        });
        tracing::info!(config = %config.display(), "trace session started");
        self.active = Some(ActiveTrace {
            child,
            output,
            pump,
            _slot: slot,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<TraceBlob, CollaboratorError> {
        let mut active = self.active.take().ok_or(CollaboratorError::NoActiveTrace)?;
        terminate(&mut active.child)?;

        match tokio::time::timeout(self.stop_grace, active.child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    tracing::warn!(%status, "tracer exited abnormally");
                }
            }
            Err(_) => {
                let _ = active.child.kill().await;
                return Err(CollaboratorError::Timeout {
                    what: "trace flush",
                    after: self.stop_grace,
                });
            }
        }
        if let Some(pump) = active.pump.take() {
            let _ = pump.await;
        }
        let data = tokio::fs::read(&*active.output).await?;
        tracing::info!(bytes = data.len(), "trace session stopped");
        Ok(TraceBlob::new(data))
    }

    async fn abort(&mut self) {
        if let Some(mut active) = self.active.take() {
            let _ = active.child.kill().await;
            if let Some(pump) = active.pump.take() {
                pump.abort();
            }
            tracing::warn!("trace session aborted");
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<(), CollaboratorError> {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Some(id) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    let pid = i32::try_from(id).map_err(|e| CollaboratorError::failed("tracer pid", e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| CollaboratorError::failed("signal tracer", e))
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<(), CollaboratorError> {
    child.start_kill().map_err(Into::into)
}

impl fmt::Debug for CommandTraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTraceSession")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("active", &self.is_active())
            .finish()
    }
}
