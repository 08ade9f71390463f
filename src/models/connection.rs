//! Connection-related data models.
//!
//! This module defines the dialect enum and the options a caller passes when
//! asking the connection manager for a connection.

use serde::{Deserialize, Serialize};

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
    MSSQL,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else if lower.starts_with("mssql://") || lower.starts_with("sqlserver://") {
            Some(Self::MSSQL)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
            Self::MSSQL => "MSSQL",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::MSSQL => Some(1433),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Kind of statement a connection is requested for. Only `Select` is routed to replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Upsert,
    Delete,
    #[default]
    Raw,
}

impl QueryType {
    pub fn is_select(&self) -> bool {
        matches!(self, Self::Select)
    }
}

/// Options for `ConnectionManager::get_connection`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Lower values are served first. `None` uses the default class (0).
    pub priority: Option<u32>,
    pub query_type: QueryType,
    /// Force the primary even for reads.
    pub use_master: bool,
}

impl AcquireOptions {
    pub fn read() -> Self {
        Self {
            query_type: QueryType::Select,
            ..Self::default()
        }
    }

    pub fn write() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn use_master(mut self) -> Self {
        self.use_master = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_from_connection_string() {
        assert_eq!(
            DatabaseType::from_connection_string("postgresql://host/db"),
            Some(DatabaseType::PostgreSQL)
        );
        assert_eq!(
            DatabaseType::from_connection_string("MariaDB://host/db"),
            Some(DatabaseType::MySQL)
        );
        assert_eq!(
            DatabaseType::from_connection_string("sqlite:data.db"),
            Some(DatabaseType::SQLite)
        );
        assert_eq!(
            DatabaseType::from_connection_string("sqlserver://host"),
            Some(DatabaseType::MSSQL)
        );
        assert_eq!(DatabaseType::from_connection_string("redis://host"), None);
    }

    #[test]
    fn test_acquire_options_builders() {
        let opts = AcquireOptions::read().with_priority(3);
        assert!(opts.query_type.is_select());
        assert_eq!(opts.priority, Some(3));
        assert!(!opts.use_master);

        let opts = AcquireOptions::read().use_master();
        assert!(opts.use_master);
        assert_eq!(AcquireOptions::write().query_type, QueryType::Raw);
    }
}
