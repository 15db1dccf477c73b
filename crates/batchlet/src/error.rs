//! Server error kinds.

/// Errors surfaced by the serving core.
///
/// `SetupFailed` and `SubprocessTerminated` are fatal: the runner's in-process
/// state is unknown, so the server shuts down rather than silently degrading.
/// Timeout and cancellation are recovered by failing the affected units.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("runner setup failed: {0}")]
    SetupFailed(String),

    #[error("prediction timed out")]
    PredictionTimeout,

    #[error("prediction was canceled")]
    PredictionCanceled,

    #[error("runner subprocess terminated unexpectedly:\n{log_tail}")]
    SubprocessTerminated { log_tail: String },

    #[error("prediction not found: {0}")]
    PredictionIdNotFound(String),

    #[error("input not found: {0}")]
    InputIdNotFound(String),

    #[error("prediction id already exists: {0}")]
    PredictionIdAlreadyExists(String),

    #[error("input id already exists: {0}")]
    InputIdAlreadyExists(String),

    #[error("timed out waiting for queued inputs")]
    QueueTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("file upload failed: {0}")]
    Upload(String),
}

impl ServerError {
    /// Fatal errors take the whole server down; everything else is converted
    /// into per-prediction failures.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SetupFailed(_) | Self::SubprocessTerminated { .. }
        )
    }
}
