//! Error types for task execution.

use thiserror::Error;

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Task execution errors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A periodic job with the same name is already registered
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    /// Task submitted after shutdown started
    #[error("Scheduler is shut down, discarding task: {0}")]
    Rejected(String),

    /// Job execution failed
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Generic error
    #[error("Task error: {0}")]
    Other(String),
}
