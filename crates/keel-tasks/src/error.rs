//! Error types for keel-tasks.

use thiserror::Error;

/// Task execution errors, as reported by handlers.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient failure; the runtime retries within the task's budget.
    #[error("Retryable: {0}")]
    Retryable(String),

    /// Permanent failure; retrying cannot help.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl TaskError {
    #[must_use]
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Result type alias for task handlers.
pub type TaskResult = std::result::Result<(), TaskError>;
