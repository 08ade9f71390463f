//! Collaborator interfaces consumed by the pooling core.
//!
//! The core never speaks a wire protocol itself. Physical connections are opened,
//! closed, validated and driven through a [`DialectAdapter`], and every connection
//! attempt passes through [`ConnectionHooks`] so callers can instrument or mutate
//! the parameters.

use crate::config::ConnectionParams;
use crate::error::DbResult;
use crate::models::DatabaseType;
use async_trait::async_trait;

/// Low-level failure reported by a dialect adapter.
///
/// `code` carries the driver's failure code (`ECONNREFUSED`, `ER_ACCESS_DENIED_ERROR`,
/// a SQLSTATE, ...). The connection manager classifies connection failures from it.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub code: Option<String>,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Dialect-specific connection capability.
///
/// Implementations own protocol I/O; the core owns pooling, classification and
/// lifecycle. `validate` defaults to "always valid".
#[async_trait]
pub trait DialectAdapter: Send + Sync + 'static {
    /// Physical connection type produced by this adapter.
    type Connection: Send + 'static;

    /// Dialect spoken by this adapter, used to pick transaction statements.
    fn dialect(&self) -> DatabaseType;

    async fn connect(&self, params: &ConnectionParams) -> Result<Self::Connection, AdapterError>;

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), AdapterError>;

    async fn validate(&self, _connection: &mut Self::Connection) -> bool {
        true
    }

    /// Run a statement that produces no rows of interest.
    async fn execute(
        &self,
        connection: &mut Self::Connection,
        sql: &str,
    ) -> Result<(), AdapterError>;

    /// Run the dialect's version probe query.
    async fn server_version(
        &self,
        connection: &mut Self::Connection,
    ) -> Result<String, AdapterError>;
}

/// Hooks invoked around every physical connection attempt.
///
/// Failures returned from either hook propagate as connection failures.
#[async_trait]
pub trait ConnectionHooks<C: Send>: Send + Sync {
    async fn before_connect(&self, _params: &mut ConnectionParams) -> DbResult<()> {
        Ok(())
    }

    async fn after_connect(&self, _connection: &mut C, _params: &ConnectionParams) -> DbResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl<C: Send + 'static> ConnectionHooks<C> for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_adapter_error_builder() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = AdapterError::new("connect failed")
            .with_code("ECONNREFUSED")
            .with_source(io);

        assert_eq!(err.code.as_deref(), Some("ECONNREFUSED"));
        assert_eq!(err.to_string(), "connect failed");
        assert_eq!(err.source().unwrap().to_string(), "refused");
    }
}
