//! Error types for convocart-memory

use thiserror::Error;

use crate::cache::Namespace;

/// Result type alias for convocart-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in convocart-memory
///
/// A cache miss is not an error: lookups return `Option::None` instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Value of {size} bytes exceeds the {quota} byte quota of namespace '{namespace}'")]
    Oversize {
        namespace: Namespace,
        size: u64,
        quota: u64,
    },

    #[error("Computation for {namespace}/{key} failed: {message}")]
    ComputeFailure {
        namespace: Namespace,
        key: String,
        message: String,
    },

    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn compute_failure(
        namespace: Namespace,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ComputeFailure {
            namespace,
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether a caller may retry the operation (with backoff and a cap)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the failure came from the durable layer
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Sqlite(_))
    }

    pub fn is_oversize(&self) -> bool {
        matches!(self, Self::Oversize { .. })
    }

    /// Copy of this error for handing to another waiter of a shared result.
    /// Wrapped foreign errors keep their message only.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::Storage(msg) => Self::Storage(msg.clone()),
            Self::Sqlite(e) => Self::Storage(e.to_string()),
            Self::Json(e) => Self::Storage(format!("JSON serialization error: {}", e)),
            Self::Io(e) => Self::Storage(format!("IO error: {}", e)),
            Self::Config(msg) => Self::Config(msg.clone()),
            Self::NotFound(msg) => Self::NotFound(msg.clone()),
            Self::InvalidInput(msg) => Self::InvalidInput(msg.clone()),
            Self::Oversize {
                namespace,
                size,
                quota,
            } => Self::Oversize {
                namespace: *namespace,
                size: *size,
                quota: *quota,
            },
            Self::ComputeFailure {
                namespace,
                key,
                message,
            } => Self::ComputeFailure {
                namespace: *namespace,
                key: key.clone(),
                message: message.clone(),
            },
            Self::Timeout {
                operation,
                duration_ms,
            } => Self::Timeout {
                operation: operation.clone(),
                duration_ms: *duration_ms,
            },
            Self::Internal(msg) => Self::Internal(msg.clone()),
        }
    }
}
