//! Error taxonomy for the skill core.
//!
//! Execution-side failures (timeouts, resource ceilings, faults raised by the
//! executed code) are never errors here: they travel inside
//! [`crate::sandbox::ExecutionResult`].

use thiserror::Error;

/// Errors surfaced by the store, materializer, checkpoints and configuration
#[derive(Debug, Error)]
pub enum SkillError {
    /// Bad identity characters or unparsable source. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transaction or database failure. Callers may retry the whole operation.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SkillError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures the caller may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

impl From<rusqlite::Error> for SkillError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SkillError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt JSON column: {}", e))
    }
}

impl From<tempfile::PersistError> for SkillError {
    fn from(e: tempfile::PersistError) -> Self {
        Self::Io(e.error)
    }
}

pub type Result<T> = std::result::Result<T, SkillError>;
