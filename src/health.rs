use std::{collections::BTreeSet, ffi::OsString, io, path::PathBuf};

use async_trait::async_trait;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// A renderer or tab died; the payload says which.
    Crashed(String),
}

/// Post-scenario crash detection.
///
/// Installed once before the first run and queried once after every run. A
/// crash reported by [`check`](Self::check) fails the run with
/// [`Error::PostCheckFailed`] even when the scenario itself succeeded.
#[async_trait]
pub trait TabHealthCheck: Send + Sync {
    async fn install(&mut self) -> Result<(), Error> {
        Ok(())
    }

    async fn check(&self) -> Result<Health, Error>;
}

/// Watches a crash-dump directory; any dump written after
/// [`install`](TabHealthCheck::install) counts as a crash.
#[derive(Debug, Clone)]
pub struct CrashDumpHealthCheck {
    dir: PathBuf,
    known: BTreeSet<OsString>,
}

impl CrashDumpHealthCheck {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known: BTreeSet::new(),
        }
    }

    async fn dumps(&self) -> Result<BTreeSet<OsString>, Error> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.insert(entry.file_name());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl TabHealthCheck for CrashDumpHealthCheck {
    async fn install(&mut self) -> Result<(), Error> {
        self.known = self.dumps().await?;
        tracing::debug!(dir = %self.dir.display(), existing = self.known.len(), "crash dump watch installed");
        Ok(())
    }

    async fn check(&self) -> Result<Health, Error> {
        let new: Vec<String> = self
            .dumps()
            .await?
            .difference(&self.known)
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        if new.is_empty() {
            Ok(Health::Healthy)
        } else {
            Ok(Health::Crashed(format!("new crash dumps: {}", new.join(", "))))
        }
    }
}
