//! Error types for the pool manager and query executor.
//!
//! Every public operation completes with either a value or exactly one `DbError`.
//! Connection-lost signals never appear here: they are pool health events handled
//! inside [`PoolManager`](crate::db::PoolManager).

use crate::db::driver::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        code: Option<String>,
        suggestion: String,
    },

    #[error("Connection unavailable: pool returned neither a connection nor an error")]
    ConnectionUnavailable,

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// Driver error code, e.g. "ER_DUP_ENTRY" or "1062"
        code: Option<String>,
        sql: String,
    },

    #[error("Failed to begin transaction: {message}")]
    TransactionBegin {
        message: String,
        code: Option<String>,
    },

    #[error("Commit failed: {message}")]
    Commit {
        message: String,
        code: Option<String>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error from a driver-reported pool failure.
    pub fn connection(err: DriverError) -> Self {
        let suggestion = if err.is_connection_lost() {
            "The server connection was lost; the pool is being rebuilt, retry the operation"
        } else {
            "Check that the database server is running and the credentials are valid"
        };
        Self::Connection {
            message: err.message,
            code: err.code,
            suggestion: suggestion.to_string(),
        }
    }

    /// Create a query error for the statement that failed.
    pub fn query(err: DriverError, sql: impl Into<String>) -> Self {
        Self::Query {
            message: err.message,
            code: err.code,
            sql: sql.into(),
        }
    }

    /// Create a transaction begin error.
    pub fn transaction_begin(err: DriverError) -> Self {
        Self::TransactionBegin {
            message: err.message,
            code: err.code,
        }
    }

    /// Create a commit error.
    pub fn commit(err: DriverError) -> Self {
        Self::Commit {
            message: err.message,
            code: err.code,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Driver error code attached to this error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. }
            | Self::Query { code, .. }
            | Self::TransactionBegin { code, .. }
            | Self::Commit { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionUnavailable
        )
    }
}

/// Result type alias for pool and executor operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::{CONNECTION_LOST_CODE, DriverErrorKind};

    #[test]
    fn test_error_display() {
        let err = DbError::configuration("pool configuration must be an object");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_query_error_keeps_code_and_sql() {
        let err = DbError::query(
            DriverError::database(Some("1062".to_string()), "Duplicate entry"),
            "INSERT INTO t VALUES (?)",
        );
        assert_eq!(err.code(), Some("1062"));
        match err {
            DbError::Query { sql, message, .. } => {
                assert_eq!(sql, "INSERT INTO t VALUES (?)");
                assert_eq!(message, "Duplicate entry");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_connection_lost_suggestion() {
        let err = DbError::connection(DriverError::connection_lost("socket closed"));
        assert_eq!(err.code(), Some(CONNECTION_LOST_CODE));
        assert!(err.suggestion().unwrap().contains("rebuilt"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::ConnectionUnavailable.is_retryable());
        assert!(
            DbError::connection(DriverError::new(DriverErrorKind::Pool, None, "closed"))
                .is_retryable()
        );
        assert!(!DbError::invalid_input("bad").is_retryable());
        assert!(
            !DbError::transaction_begin(DriverError::other("nope")).is_retryable()
        );
    }
}
