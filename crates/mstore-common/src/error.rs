//! Error types for mstore
//!
//! This module defines the common error types used throughout the system.
//! Backend adapters report [`BackendError`]; the storage layer reports
//! [`Error`].

use crate::value::Value;
use thiserror::Error;

/// Common result type for mstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for backend adapter calls
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Error reported by a storage backend adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend storage error: {0}")]
    Storage(String),

    #[error("not found in backend: {0}")]
    NotFound(String),

    #[error("backend serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Transient errors are retried on the next sync cycle
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Common error type for mstore
#[derive(Debug, Error)]
pub enum Error {
    #[error("backend '{backend}' failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("no primary backend configured")]
    NoPrimaryBackend,

    #[error("condition failed for field '{field}': expected {expected}, found {actual}")]
    ConditionFailed {
        field: String,
        expected: Value,
        actual: Value,
    },

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a backend error with the name of the backend that raised it
    pub fn backend(name: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            backend: name.into(),
            source,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a precondition failure
    #[must_use]
    pub const fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::backend("redis", BackendError::connection("refused")).is_retryable());
        assert!(!Error::backend("redis", BackendError::storage("bad hash")).is_retryable());
        assert!(!Error::NoPrimaryBackend.is_retryable());
    }

    #[test]
    fn test_condition_failed_message() {
        let err = Error::ConditionFailed {
            field: "status".into(),
            expected: Value::from("busy"),
            actual: Value::from("ready"),
        };
        assert!(err.is_condition_failed());
        assert_eq!(
            err.to_string(),
            r#"condition failed for field 'status': expected "busy", found "ready""#
        );
    }

    #[test]
    fn test_backend_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = BackendError::from(json_err);
        assert!(matches!(err, BackendError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
