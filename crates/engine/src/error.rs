use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the job execution core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cooperative cancellation (user pause/stop or job removal). Not a
    /// failure: a running job interrupted this way goes back to `Pending`.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O failure while backing up or probing destination names. Raised
    /// before the external operation starts, so no partial write exists.
    #[error("conflict resolution failed for {path}: {source}")]
    ConflictResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// External backend/engine failure: spawn error, nonzero exit,
    /// or malformed result. Carries engine diagnostics where available.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Required job fields missing or inconsistent with the job kind.
    #[error("invalid job configuration: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
