//! Error taxonomy shared by every ScriptGuard crate.

use thiserror::Error;

/// Result alias used across ScriptGuard.
pub type Result<T> = std::result::Result<T, ScriptGuardError>;

#[derive(Debug, Error)]
pub enum ScriptGuardError {
    /// Bad task, schedule, or setting input. Surfaced to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The environment exists in the registry but its interpreter is gone.
    /// Callers may retry after rescanning environments.
    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ScriptGuard is shutting down")]
    ShuttingDown,
}

impl ScriptGuardError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Only a missing interpreter is worth retrying (after a rescan).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EnvironmentUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
