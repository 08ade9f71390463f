//! Error types for the pooling and transaction core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Connection failures are classified from the adapter's low-level failure code into a
//! small taxonomy, each variant keeping the original adapter error as its source.

use crate::db::adapter::AdapterError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection refused: {message}")]
    ConnectionRefused {
        message: String,
        #[source]
        cause: Arc<AdapterError>,
    },

    #[error("Access denied: {message}")]
    AccessDenied {
        message: String,
        #[source]
        cause: Arc<AdapterError>,
    },

    #[error("Host not found: {message}")]
    HostNotFound {
        message: String,
        #[source]
        cause: Arc<AdapterError>,
    },

    #[error("Host not reachable: {message}")]
    HostNotReachable {
        message: String,
        #[source]
        cause: Arc<AdapterError>,
    },

    #[error("Invalid connection parameters: {message}")]
    InvalidConnection {
        message: String,
        #[source]
        cause: Arc<AdapterError>,
    },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        cause: Option<Arc<AdapterError>>,
    },

    #[error("Timeout: acquiring a connection from the {pool} pool exceeded {}ms", .timeout.as_millis())]
    AcquireTimeout { pool: String, timeout: Duration },

    #[error("Resource not currently part of this pool")]
    ResourceNotInPool,

    #[error("Pool is draining and cannot accept new acquisitions")]
    PoolClosed,

    #[error("get_connection was called after the connection manager was closed")]
    ManagerClosed,

    #[error("Connection has already been closed")]
    ConnectionClosed,

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a generic connection error without an adapter cause.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            cause: None,
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an acquisition timeout error.
    pub fn acquire_timeout(pool: impl Into<String>, timeout: Duration) -> Self {
        Self::AcquireTimeout {
            pool: pool.into(),
            timeout,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a failed connection attempt by the adapter's failure code.
    ///
    /// Codes follow the driver conventions: errno-style names for socket failures,
    /// MySQL error names and PostgreSQL SQLSTATEs for server-side rejections.
    /// Anything unrecognized collapses to [`DbError::Connection`].
    pub fn from_connect_failure(err: AdapterError) -> Self {
        let message = err.message.clone();
        let code = err.code.clone().unwrap_or_default();
        let cause = Arc::new(err);

        match code.as_str() {
            "ECONNREFUSED" => Self::ConnectionRefused { message, cause },
            "ER_ACCESS_DENIED_ERROR" | "ER_DBACCESS_DENIED_ERROR" | "ELOGIN" | "28000"
            | "28P01" => Self::AccessDenied { message, cause },
            "ENOTFOUND" => Self::HostNotFound { message, cause },
            "EHOSTUNREACH" | "ENETUNREACH" => Self::HostNotReachable { message, cause },
            "EINVAL" | "ER_BAD_DB_ERROR" | "3D000" => Self::InvalidConnection { message, cause },
            _ => Self::Connection {
                message,
                cause: Some(cause),
            },
        }
    }

    /// Wrap a failed statement, keeping the adapter's code as the SQL state.
    pub fn from_statement_failure(err: AdapterError) -> Self {
        Self::Database {
            message: err.message,
            sql_state: err.code,
        }
    }

    /// Whether this error came from establishing a physical connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::AccessDenied { .. }
                | Self::HostNotFound { .. }
                | Self::HostNotReachable { .. }
                | Self::InvalidConnection { .. }
                | Self::Connection { .. }
        )
    }

    /// Release/destroy race: the resource was already released, destroyed or drained.
    pub fn is_not_in_pool(&self) -> bool {
        matches!(self, Self::ResourceNotInPool)
    }

    /// Get a suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionRefused { .. } => {
                Some("Check that the database server is running and accepting connections")
            }
            Self::AccessDenied { .. } => {
                Some("Verify the username and password in the connection settings")
            }
            Self::HostNotFound { .. } => Some("Check the host name and DNS configuration"),
            Self::HostNotReachable { .. } => {
                Some("Check network connectivity and firewall rules to the database host")
            }
            Self::InvalidConnection { .. } => {
                Some("Check the connection parameters (database name, port, options)")
            }
            Self::AcquireTimeout { .. } => {
                Some("Consider raising pool.max or pool.acquire, or release connections sooner")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::HostNotReachable { .. }
                | Self::Connection { .. }
                | Self::AcquireTimeout { .. }
        )
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
