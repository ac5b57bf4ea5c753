//! Error types for a devicelab run.
//!
//! Every [`LabError`] is fatal: it aborts the run and no partial aggregate is
//! returned. Test-level failures (failing or inconclusive steps and test
//! cases) are never errors; they are folded into the
//! [`AggregateOutcome`](crate::model::AggregateOutcome) verdict instead.
//!
//! | Kind | Variant | Raised when |
//! |------|---------|-------------|
//! | Configuration | [`LabError::Config`] | Before submission, on invalid input |
//! | Transport | [`LabError::Transport`] | A remote call cannot complete |
//! | Protocol | [`LabError::Protocol`] | The service answers with something unusable |
//! | Job | [`LabError::Job`] | The matrix reaches a known error state |
//! | Unknown state | [`LabError::UnknownState`] | The matrix reports a state we don't know |

use crate::model::MatrixState;

/// Result type for devicelab operations.
pub type LabResult<T> = Result<T, LabError>;

/// Coarse category of a [`LabError`], used for logging and exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Protocol,
    Job,
    UnknownState,
    Cancelled,
    Storage,
    Auth,
    Io,
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    /// The job request is malformed. Never retried.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A remote call failed to connect or timed out.
    #[error("Transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The service responded, but not with what the protocol requires.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The matrix reached a known error state.
    #[error("{message}")]
    Job { state: MatrixState, message: String },

    /// The matrix reported a state outside the known set.
    #[error(
        "Test matrix reached unknown state '{0}'. Please report this issue so devicelab can handle it"
    )]
    UnknownState(String),

    /// Polling was cancelled or ran past its deadline.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// The blob store failed to upload, list or download.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No access token could be obtained.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Config(_) => ErrorKind::Config,
            LabError::Transport { .. } => ErrorKind::Transport,
            LabError::Protocol(_) => ErrorKind::Protocol,
            LabError::Job { .. } => ErrorKind::Job,
            LabError::UnknownState(_) => ErrorKind::UnknownState,
            LabError::Cancelled(_) => ErrorKind::Cancelled,
            LabError::Storage(_) => ErrorKind::Storage,
            LabError::Auth(_) => ErrorKind::Auth,
            LabError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LabError::Config(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        LabError::Protocol(msg.into())
    }
}
