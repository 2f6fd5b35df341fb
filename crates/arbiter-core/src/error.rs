//! Error types for Arbiter

use thiserror::Error;

use crate::dispatch::ExecutionError;

/// Result type alias using Arbiter's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Arbiter error types
///
/// Every error raised while handling a request names the task type and the
/// backend id(s) involved so callers can log it without extra context.
#[derive(Error, Debug)]
pub enum Error {
    // Selection errors (E100-E199)
    #[error("No eligible backend for task type '{task_type}': {reason}")]
    NoEligibleBackend { task_type: String, reason: String },

    #[error("Backend '{0}' is not registered")]
    BackendNotFound(String),

    // Execution errors (E200-E299)
    #[error("Backend '{backend_id}' failed on task type '{task_type}': {source}")]
    BackendExecution {
        backend_id: String,
        task_type: String,
        #[source]
        source: ExecutionError,
    },

    #[error("All backends failed for task type '{task_type}' (tried: {}): {source}", .backend_ids.join(", "))]
    AllBackendsFailed {
        task_type: String,
        backend_ids: Vec<String>,
        #[source]
        source: ExecutionError,
    },

    // Assessment errors (E300-E399)
    #[error("Self-assessment by '{backend_id}' failed for task type '{task_type}': {message}")]
    Assessment {
        backend_id: String,
        task_type: String,
        message: String,
    },

    // Memory errors (E400-E499)
    #[error("Context entry '{0}' not found")]
    ContextNotFound(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoEligibleBackend { .. } => "E100",
            Self::BackendNotFound(_) => "E101",
            Self::BackendExecution { .. } => "E200",
            Self::AllBackendsFailed { .. } => "E201",
            Self::Assessment { .. } => "E300",
            Self::ContextNotFound(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E801",
            Self::Io(_) => "E9999",
        }
    }

    /// Whether submitting the same request again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendExecution { .. } | Self::AllBackendsFailed { .. } | Self::Io(_)
        )
    }

    /// Backend ids involved in this error, if any
    pub fn backend_ids(&self) -> Vec<&str> {
        match self {
            Self::BackendExecution { backend_id, .. } | Self::Assessment { backend_id, .. } => {
                vec![backend_id.as_str()]
            }
            Self::AllBackendsFailed { backend_ids, .. } => {
                backend_ids.iter().map(String::as_str).collect()
            }
            Self::BackendNotFound(id) => vec![id.as_str()],
            _ => Vec::new(),
        }
    }

    pub(crate) fn invalid<T: Into<String>>(msg: T) -> Self {
        Error::InvalidInput(msg.into())
    }
}
