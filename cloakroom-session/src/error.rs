//! Error types for session operations.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session-specific errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Error from the Redis connection facade
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] cloakroom_redis::RedisError),

    /// Task scheduling error
    #[error("Task error: {0}")]
    Task(#[from] cloakroom_tasks::TaskError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Operation on an invalidated session
    #[error("Session is invalid: {0}")]
    Invalid(String),

    /// Commit failed
    #[error("Commit failed for session {id}: {reason}")]
    Commit { id: String, reason: String },

    /// Operation not supported by this repository
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("Session error: {0}")]
    Other(String),
}
