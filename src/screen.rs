//! Screen capture while a scenario runs.
//!
//! [`CaptureScreenRecorder`] pulls frames from a [`FrameSource`] on a fixed
//! period in a background task and streams them into a temporary file next to
//! the destination. `stop` shuts the task down, waits for the writer to
//! drain, and renames the file into place, so a partially written recording
//! never appears at the declared path.
//!
//! # Container
//!
//! ```text
//! magic   b"CUJREC01"
//! frame*  u32 LE payload length | u64 LE milliseconds since start | payload
//! ```
//!
//! A plain-text transcript (`screen_record.txt` for `screen_record.webm`) is
//! written beside the recording with one line per captured or failed frame.
//!
//! The module also hosts the screenshot schedule used by
//! [`Recorder::attach_screenshot_recorder`](crate::Recorder::attach_screenshot_recorder).

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::watch::{self, Receiver, Sender},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    error::CollaboratorError,
    registry::{self, Reservation},
};

pub const MAGIC: &[u8; 8] = b"CUJREC01";
pub const DEFAULT_RECORDING_NAME: &str = "screen_record.webm";

/// Something that can grab the current screen contents.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, CollaboratorError>;
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub path: PathBuf,
    pub transcript: PathBuf,
    pub size: u64,
    pub frames: u64,
    pub duration: Duration,
}

/// Capability to record the screen.
///
/// Only one recording may be active per process: starting while any
/// recorder is active fails with [`CollaboratorError::RecordingInProgress`]
/// and leaves the running recording untouched. The first `stop` after a
/// `start` returns the [`MediaBlob`]; further calls fail with
/// [`CollaboratorError::NoActiveRecording`].
///
/// When `start` is given no output path the recording lands in a temporary
/// location, reported by the returned blob.
#[async_trait]
pub trait ScreenRecorder: Send {
    async fn start(&mut self, output: Option<&Path>) -> Result<(), CollaboratorError>;

    async fn stop(&mut self) -> Result<MediaBlob, CollaboratorError>;

    /// Copy the last finished recording to `path`.
    async fn save_as(&self, path: &Path) -> Result<(), CollaboratorError>;

    /// Drop an active recording without keeping anything.
    async fn abort(&mut self) {}
}

#[derive(Default)]
struct CaptureStats {
    frames: u64,
    transcript: Vec<String>,
    duration: Duration,
}

struct ActiveRecording {
    shutdown: Sender<bool>,
    task: JoinHandle<std::io::Result<CaptureStats>>,
    temp: TempPath,
    destination: Option<PathBuf>,
    _slot: Reservation,
}

pub struct CaptureScreenRecorder {
    source: Arc<dyn FrameSource>,
    period: Duration,
    active: Option<ActiveRecording>,
    last: Option<MediaBlob>,
}

impl CaptureScreenRecorder {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            period: Duration::from_millis(100),
            active: None,
            last: None,
        }
    }

    /// Time between two captured frames.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn last_recording(&self) -> Option<&MediaBlob> {
        self.last.as_ref()
    }
}

#[async_trait]
impl ScreenRecorder for CaptureScreenRecorder {
    async fn start(&mut self, output: Option<&Path>) -> Result<(), CollaboratorError> {
        if self.active.is_some() {
            return Err(CollaboratorError::RecordingInProgress);
        }
        let slot = registry::reserve_screen_recorder()?;
        let mut builder = tempfile::Builder::new();
        builder.prefix(".screen_record").suffix(".part");
        let temp = match output.and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => builder.tempfile_in(dir)?,
            _ => builder.tempfile()?,
        };
        let (file, temp) = temp.into_parts();

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(capture_loop(
            Arc::clone(&self.source),
            tokio::fs::File::from_std(file),
            self.period,
            rx,
        ));
        tracing::info!(output = ?output, "screen recording started");
        self.active = Some(ActiveRecording {
            shutdown,
            task,
            temp,
            destination: output.map(Path::to_path_buf),
            _slot: slot,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<MediaBlob, CollaboratorError> {
        let active = self.active.take().ok_or(CollaboratorError::NoActiveRecording)?;
        active.shutdown.send_replace(true);
        let stats = active
            .task
            .await
            .map_err(|e| CollaboratorError::failed("screen capture task", e))??;

        let path = match active.destination {
            Some(dest) => {
                active
                    .temp
                    .persist(&dest)
                    .map_err(|e| CollaboratorError::Io(e.error))?;
                dest
            }
            None => {
                let kept = active.temp.keep().map_err(|e| CollaboratorError::Io(e.error))?;
                let path = kept.with_extension("webm");
                tokio::fs::rename(&kept, &path).await?;
                path
            }
        };
        let transcript = path.with_extension("txt");
        let mut text = stats.transcript.join("\n");
        text.push('\n');
        tokio::fs::write(&transcript, text).await?;
        let size = tokio::fs::metadata(&path).await?.len();

        let blob = MediaBlob {
            path,
            transcript,
            size,
            frames: stats.frames,
            duration: stats.duration,
        };
        tracing::info!(path = %blob.path.display(), frames = blob.frames, size = blob.size, "screen recording stopped");
        self.last = Some(blob.clone());
        Ok(blob)
    }

    async fn save_as(&self, path: &Path) -> Result<(), CollaboratorError> {
        let last = self.last.as_ref().ok_or(CollaboratorError::NoActiveRecording)?;
        tokio::fs::copy(&last.path, path).await?;
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown.send_replace(true);
            active.task.abort();
            tracing::warn!("screen recording aborted");
        }
    }
}

async fn capture_loop(
    source: Arc<dyn FrameSource>,
    file: tokio::fs::File,
    period: Duration,
    mut shutdown: Receiver<bool>,
) -> std::io::Result<CaptureStats> {
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC).await?;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let start = Instant::now();
    let mut stats = CaptureStats::default();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let at = start.elapsed().as_millis() as u64;
                match source.capture().await {
                    Ok(frame) => {
                        let len = u32::try_from(frame.len()).map_err(|_| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large")
                        })?;
                        writer.write_u32_le(len).await?;
                        writer.write_u64_le(at).await?;
                        writer.write_all(&frame).await?;
                        stats.frames += 1;
                        stats.transcript.push(format!("{at} ms: frame {} ({len} bytes)", stats.frames));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "frame capture failed");
                        stats.transcript.push(format!("{at} ms: capture failed: {e}"));
                    }
                }
            }
        }
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    stats.duration = start.elapsed();
    Ok(stats)
}

impl fmt::Debug for CaptureScreenRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureScreenRecorder")
            .field("period", &self.period)
            .field("recording", &self.is_recording())
            .field("last", &self.last)
            .finish()
    }
}

/// Time from the start of the schedule to screenshot `n`.
fn shot_delay(offset: Duration, n: usize) -> Option<Duration> {
    offset.checked_mul(u32::try_from(n).ok()?)
}

/// Background task taking `count` screenshots at `offset`, `2·offset`, ...
pub(crate) struct Screenshots {
    shutdown: Sender<bool>,
    task: JoinHandle<usize>,
}

impl Screenshots {
    pub(crate) fn spawn(source: Arc<dyn FrameSource>, dir: PathBuf, offset: Duration, count: usize) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = Instant::now();
            let mut taken = 0;
            for n in 1..=count {
                let Some(due) = shot_delay(offset, n).and_then(|delay| start.checked_add(delay)) else {
                    tracing::warn!(shot = n, ?offset, "screenshot schedule out of range, stopping");
                    break;
                };
                tokio::select! {
                    biased;
                    _ = rx.changed() => {
                        tracing::info!(skipped = count - n + 1, "scenario ended before all screenshots were due");
                        break;
                    }
                    _ = tokio::time::sleep_until(due) => {}
                }
                let path = dir.join(format!("screenshot-{n:02}.png"));
                match source.capture().await {
                    Ok(frame) => match tokio::fs::write(&path, frame).await {
                        Ok(()) => taken += 1,
                        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save screenshot"),
                    },
                    Err(e) => tracing::warn!(error = %e, "screenshot failed"),
                }
            }
            taken
        });
        Self { shutdown, task }
    }

    /// Stop the schedule and return the number of screenshots saved.
    pub(crate) async fn stop(self) -> usize {
        self.shutdown.send_replace(true);
        self.task.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "screenshot task failed");
            0
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serial_test::serial;

    use super::*;

    /// Produces small numbered frames.
    #[derive(Default)]
    pub(crate) struct CountingFrames(pub AtomicU64);

    #[async_trait]
    impl FrameSource for CountingFrames {
        async fn capture(&self) -> Result<Vec<u8>, CollaboratorError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(n.to_le_bytes().to_vec())
        }
    }

    fn frames() -> Arc<dyn FrameSource> {
        Arc::new(CountingFrames::default())
    }

    #[tokio::test]
    #[serial]
    async fn recording_lands_at_declared_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join(DEFAULT_RECORDING_NAME);
        let mut rec = CaptureScreenRecorder::new(frames()).with_period(Duration::from_millis(10));

        rec.start(Some(&out)).await.unwrap();
        assert!(!out.exists(), "partial recording must not be visible");
        tokio::time::sleep(Duration::from_millis(60)).await;
        let blob = rec.stop().await.unwrap();

        assert_eq!(blob.path, out);
        assert!(blob.frames >= 1);
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(bytes.len() as u64, blob.size);
        assert_eq!(bytes.len() as u64, 8 + blob.frames * (4 + 8 + 8));
        assert!(dir.path().join("screen_record.txt").exists());
        assert!(!registry::is_screen_recording());

        assert!(matches!(rec.stop().await, Err(CollaboratorError::NoActiveRecording)));

        let copy = dir.path().join("copy.webm");
        rec.save_as(&copy).await.unwrap();
        assert_eq!(std::fs::read(copy).unwrap(), bytes);
    }

    #[tokio::test]
    #[serial]
    async fn recording_without_path_goes_to_a_temp_file() {
        let mut rec = CaptureScreenRecorder::new(frames()).with_period(Duration::from_millis(5));
        rec.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let blob = rec.stop().await.unwrap();
        assert!(blob.path.exists());
        assert!(blob.size > 0);
        std::fs::remove_file(&blob.path).unwrap();
        std::fs::remove_file(&blob.transcript).unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn abort_releases_the_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("aborted.webm");
        let mut rec = CaptureScreenRecorder::new(frames());
        rec.start(Some(&out)).await.unwrap();
        rec.abort().await;
        assert!(!registry::is_screen_recording());
        assert!(!out.exists());
        assert!(matches!(rec.stop().await, Err(CollaboratorError::NoActiveRecording)));
    }

    #[tokio::test]
    async fn screenshots_follow_the_offset() {
        let dir = tempfile::tempdir().unwrap();
        let shots = Screenshots::spawn(frames(), dir.path().to_path_buf(), Duration::from_millis(200), 3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(shots.stop().await, 2);
        assert!(dir.path().join("screenshot-01.png").exists());
        assert!(dir.path().join("screenshot-02.png").exists());
        assert!(!dir.path().join("screenshot-03.png").exists());
    }

    #[test]
    fn shot_delays_are_checked() {
        assert_eq!(shot_delay(Duration::from_millis(10), 3), Some(Duration::from_millis(30)));
        assert_eq!(shot_delay(Duration::MAX, 2), None);
        assert_eq!(shot_delay(Duration::from_secs(1), usize::MAX), None);
    }

    #[tokio::test]
    async fn out_of_range_schedule_ends_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let shots = Screenshots::spawn(frames(), dir.path().to_path_buf(), Duration::MAX, 2);
        shots.shutdown.send_replace(true);
        assert_eq!(shots.task.await.unwrap(), 0);
        assert!(!dir.path().join("screenshot-01.png").exists());
    }
}
