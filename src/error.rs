use std::time::Duration;

use thiserror::Error;

use crate::{histogram::HistogramError, recorder::RecorderState, values::ValuesError};

/// Error type returned by scenario bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of every [`Error`].
///
/// Callers that only care about *what kind* of thing went wrong (the harness,
/// retry policies, dashboards) should match on this instead of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Duplicate metric, malformed config, call in the wrong state.
    Configuration,
    /// A histogram source could not be queried.
    SourceUnavailable,
    /// Trace session, screen recorder or battery guard lifecycle error.
    CollaboratorFailed,
    /// The scenario body returned an error.
    ScenarioFailed,
    /// Tab crash or invariant violation observed after the scenario.
    PostCheckFailed,
    /// Deadline exceeded or context cancelled.
    Timeout,
    /// Bug or corrupted data, e.g. histogram overflow.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{operation} is not permitted while the recorder is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RecorderState,
    },

    #[error("histogram source unavailable for {name}: {reason}")]
    SourceUnavailable { name: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("scenario failed: {source}{}", cleanup_suffix(.cleanup))]
    ScenarioFailed { source: BoxError, cleanup: Vec<Error> },

    #[error("post-scenario check failed: {reason}{}", cleanup_suffix(.related))]
    PostCheckFailed { reason: String, related: Vec<Error> },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Histogram(#[from] HistogramError),

    #[error(transparent)]
    Values(#[from] ValuesError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::InvalidState { .. } => ErrorKind::Configuration,
            Error::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Collaborator(_) => ErrorKind::CollaboratorFailed,
            Error::ScenarioFailed { .. } => ErrorKind::ScenarioFailed,
            Error::PostCheckFailed { .. } => ErrorKind::PostCheckFailed,
            Error::Values(e) if e.is_conflict() => ErrorKind::Configuration,
            Error::Internal(_)
            | Error::Histogram(_)
            | Error::Values(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// The crate error a failed scenario was interrupted with, if any.
    ///
    /// A scenario cut short by its deadline surfaces as `ScenarioFailed`
    /// wrapping an [`Error::Timeout`]; this digs it back out.
    pub fn scenario_cause(&self) -> Option<&Error> {
        match self {
            Error::ScenarioFailed { source, .. } => source.downcast_ref::<Error>(),
            _ => None,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

fn cleanup_suffix(errors: &[Error]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!(" (also: {})", joined.join("; "))
}

/// Failures of the optional collaborators wrapped around a scenario.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("tracing is not supported on this platform")]
    Unsupported,

    #[error("a trace session is already active")]
    AlreadyTracing,

    #[error("no active trace session")]
    NoActiveTrace,

    #[error("a screen recording is already in progress")]
    RecordingInProgress,

    #[error("no active screen recording")]
    NoActiveRecording,

    #[error("battery is already in forced discharge")]
    AlreadyDischarging,

    #[error("battery level {level:.1}% is below the discharge threshold {threshold:.1}%")]
    BatteryTooLow { level: f64, threshold: f64 },

    #[error("{what} did not finish within {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("{what}: {reason}")]
    Failed { what: &'static str, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollaboratorError {
    pub(crate) fn failed(what: &'static str, reason: impl ToString) -> Self {
        CollaboratorError::Failed {
            what,
            reason: reason.to_string(),
        }
    }
}
