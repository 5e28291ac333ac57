//! chronod error taxonomy.

use thiserror::Error;

/// Errors surfaced anywhere in the daemon.
#[derive(Debug, Error)]
pub enum ChronodError {
    /// Malformed schedule, exception, or field expression. Rejected before
    /// any state mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A process could not be spawned.
    #[error("start error: {0}")]
    Start(String),

    /// A process ran but failed: non-zero exit, promoted stderr, or a
    /// self-reported failure.
    #[error("execution error: {0}")]
    Execution(String),

    /// A job exceeded a wall-clock or output limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed client request. Revokes that connection's access.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// State flush or load failure. Logged and retried, never fatal.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration file problems.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ChronodError>;
