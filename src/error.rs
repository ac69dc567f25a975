//! Error types for the distributed cache
//!
//! Provides unified error handling using thiserror. Database failures are
//! classified once, at the data source boundary, so the resilience pipeline
//! can decide what to retry without inspecting driver-specific errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// == Data Source Error Kind ==
/// Classification of a failure reported by a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    /// The connection could not be established or was lost
    Connection,
    /// A retryable server-side condition (serialization failure, deadlock, lock not available)
    Transient,
    /// The database role lacks a privilege (e.g. EXECUTE on the advisory lock functions)
    PermissionDenied,
    /// A DDL statement raced another creator of the same object
    AlreadyExists,
    /// Anything else; never retried
    Other,
}

impl fmt::Display for DataSourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connection => "connection",
            Self::Transient => "transient",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyExists => "already exists",
            Self::Other => "database",
        };
        f.write_str(label)
    }
}

// == Data Source Error ==
/// A classified failure raised by a [`crate::datasource::CacheConnection`] or
/// [`crate::datasource::DataSource`].
#[derive(Error, Debug)]
#[error("{kind} failure: {message}")]
pub struct DataSourceError {
    pub kind: DataSourceErrorKind,
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DataSourceError {
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(kind: DataSourceErrorKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DataSourceErrorKind::Connection, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(DataSourceErrorKind::PermissionDenied, message)
    }
}

// == Timeout Kind ==
/// Which of the independently configured timeouts fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The whole operation, retries included
    Operation,
    /// Acquiring a pooled connection
    Connection,
    /// A single round trip to the database
    Command,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Operation => "operation",
            Self::Connection => "connection",
            Self::Command => "command",
        };
        f.write_str(label)
    }
}

// == Cache Error Enum ==
/// Unified error type for the distributed cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid or missing configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid caller input (bad key, zero sliding interval)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Classified failure from the data source
    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    /// Retries exhausted on a retryable failure
    #[error("Operation '{operation}' failed after {attempts} attempt(s): {last_error}")]
    OperationFailed {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<CacheError>,
    },

    /// A timeout fired before the work completed
    #[error("Operation '{operation}' timed out ({kind} timeout of {after:?})")]
    Timeout {
        operation: String,
        kind: TimeoutKind,
        after: Duration,
    },

    /// The circuit breaker is open; no call was attempted
    #[error("Circuit open for '{operation}', retry after {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    /// The operation was cancelled by its caller
    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    /// A value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored value could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl CacheError {
    /// Returns true when retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DataSource(err) => matches!(
                err.kind,
                DataSourceErrorKind::Connection | DataSourceErrorKind::Transient
            ),
            Self::Timeout { kind, .. } => *kind != TimeoutKind::Operation,
            _ => false,
        }
    }

    /// Returns true when the failure means the database could not be reached.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::DataSource(err) => err.kind == DataSourceErrorKind::Connection,
            Self::Timeout { kind, .. } => *kind == TimeoutKind::Connection,
            Self::OperationFailed { last_error, .. } => last_error.is_connection_failure(),
            _ => false,
        }
    }

    /// Returns true when the database refused a privileged function call.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::DataSource(DataSourceError {
                kind: DataSourceErrorKind::PermissionDenied,
                ..
            })
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the distributed cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failures_are_transient() {
        let err = CacheError::from(DataSourceError::connection("refused"));
        assert!(err.is_transient());
        assert!(err.is_connection_failure());
    }

    #[test]
    fn test_other_failures_are_not_retried() {
        let err = CacheError::from(DataSourceError::new(DataSourceErrorKind::Other, "syntax"));
        assert!(!err.is_transient());
        assert!(!err.is_connection_failure());

        let err = CacheError::Deserialization("bad bytes".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_operation_timeout_is_final() {
        let err = CacheError::Timeout {
            operation: "get".to_string(),
            kind: TimeoutKind::Operation,
            after: Duration::from_secs(1),
        };
        assert!(!err.is_transient());

        let err = CacheError::Timeout {
            operation: "get".to_string(),
            kind: TimeoutKind::Command,
            after: Duration::from_secs(1),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_exhausted_retries_keep_connection_classification() {
        let err = CacheError::OperationFailed {
            operation: "set".to_string(),
            attempts: 3,
            last_error: Box::new(DataSourceError::connection("reset").into()),
        };
        assert!(err.is_connection_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permission_denied_detection() {
        let err = CacheError::from(DataSourceError::permission_denied("pg_try_advisory_lock"));
        assert!(err.is_permission_denied());
        assert!(!err.is_transient());
    }
}
