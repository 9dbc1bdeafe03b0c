//! Error types for collection and storage operations.
//!
//! Lost optimistic races and missing keys are not errors: `try_add`,
//! `try_update` and friends report them as `Ok(false)` / `Ok(None)`.

use thiserror::Error;

/// Errors that can occur while talking to a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Empty key, malformed collection name or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A live column conflicts with the declared column type.
    #[error("schema incompatible: {table}.{column} declared {declared}, found {found}")]
    SchemaIncompatible {
        table: String,
        column: String,
        declared: String,
        found: String,
    },

    /// Transaction could not be started or completed.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The store did not answer within its command timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Operation is not meaningful for this store or collection kind.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Identifier holds a value of a different kind.
    #[error("wrong type for {key}: holds {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Cannot connect to or communicate with storage backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TransactionFailed(_) | StoreError::Connection(_) | StoreError::Timeout(_)
        )
    }

    /// Shorthand for [`StoreError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidArgument("key cannot be empty".to_string());
        assert!(err.to_string().contains("invalid argument"));
        assert!(err.to_string().contains("key cannot be empty"));
    }

    #[test]
    fn test_schema_incompatible_display() {
        let err = StoreError::SchemaIncompatible {
            table: "users".to_string(),
            column: "age".to_string(),
            declared: "INTEGER".to_string(),
            found: "TEXT".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("users.age"));
        assert!(msg.contains("declared INTEGER"));
        assert!(msg.contains("found TEXT"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StoreError::TransactionFailed("test".to_string()).is_retryable());
        assert!(StoreError::Connection("test".to_string()).is_retryable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StoreError::Cancelled.is_retryable());
        assert!(!StoreError::Unsupported("len".to_string()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: StoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
