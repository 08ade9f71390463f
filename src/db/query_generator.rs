//! Transaction-control statements per dialect.

use crate::models::{DatabaseType, Deferrable, IsolationLevel, TransactionType};

/// Renders the statements a [`Transaction`](crate::db::Transaction) issues.
///
/// `savepoint` carries the savepoint name when the statement targets a nested
/// transaction. Methods returning `None` mean "nothing to send".
pub trait QueryGenerator: Send + Sync {
    fn start_transaction(
        &self,
        transaction_type: TransactionType,
        savepoint: Option<&str>,
    ) -> String;

    fn set_isolation_level(&self, level: IsolationLevel, savepoint: bool) -> Option<String>;

    fn set_autocommit(&self, autocommit: bool, savepoint: bool) -> Option<String>;

    fn defer_constraints(&self, deferrable: &Deferrable) -> Option<String>;

    fn commit_transaction(&self, savepoint: bool) -> Option<String>;

    fn rollback_transaction(&self, savepoint: Option<&str>) -> String;

    /// Whether the isolation level may be changed after BEGIN.
    fn supports_isolation_level_during_transaction(&self) -> bool {
        true
    }

    fn generate_transaction_id(&self) -> String {
        format!("tx_{}", uuid::Uuid::new_v4().simple())
    }
}

/// Built-in statements for MySQL/MariaDB, PostgreSQL, SQLite and MSSQL.
#[derive(Debug, Clone, Copy)]
pub struct DefaultQueryGenerator {
    dialect: DatabaseType,
}

impl DefaultQueryGenerator {
    pub fn new(dialect: DatabaseType) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    fn quote(&self, identifier: &str) -> String {
        match self.dialect {
            DatabaseType::MySQL => format!("`{}`", identifier.replace('`', "``")),
            DatabaseType::MSSQL => format!("[{}]", identifier.replace(']', "]]")),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }
}

impl QueryGenerator for DefaultQueryGenerator {
    fn start_transaction(
        &self,
        transaction_type: TransactionType,
        savepoint: Option<&str>,
    ) -> String {
        if let Some(name) = savepoint {
            return match self.dialect {
                DatabaseType::MSSQL => format!("SAVE TRANSACTION {}", self.quote(name)),
                _ => format!("SAVEPOINT {}", self.quote(name)),
            };
        }

        match self.dialect {
            DatabaseType::SQLite => format!("BEGIN {} TRANSACTION", transaction_type.as_sql()),
            DatabaseType::MSSQL => "BEGIN TRANSACTION".to_string(),
            DatabaseType::MySQL | DatabaseType::PostgreSQL => "START TRANSACTION".to_string(),
        }
    }

    fn set_isolation_level(&self, level: IsolationLevel, savepoint: bool) -> Option<String> {
        if savepoint {
            return None;
        }

        Some(match self.dialect {
            DatabaseType::SQLite => {
                let read_uncommitted = level == IsolationLevel::ReadUncommitted;
                format!("PRAGMA read_uncommitted = {}", u8::from(read_uncommitted))
            }
            DatabaseType::MySQL => {
                format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql())
            }
            DatabaseType::PostgreSQL | DatabaseType::MSSQL => {
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql())
            }
        })
    }

    fn set_autocommit(&self, autocommit: bool, savepoint: bool) -> Option<String> {
        if savepoint {
            return None;
        }

        match self.dialect {
            DatabaseType::MySQL => Some(format!("SET autocommit = {}", u8::from(autocommit))),
            _ => None,
        }
    }

    fn defer_constraints(&self, deferrable: &Deferrable) -> Option<String> {
        if self.dialect != DatabaseType::PostgreSQL {
            return None;
        }

        let (names, mode) = match deferrable {
            Deferrable::SetDeferred(names) => (names, "DEFERRED"),
            Deferrable::SetImmediate(names) => (names, "IMMEDIATE"),
        };
        let target = if names.is_empty() {
            "ALL".to_string()
        } else {
            names
                .iter()
                .map(|name| self.quote(name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Some(format!("SET CONSTRAINTS {target} {mode}"))
    }

    fn commit_transaction(&self, savepoint: bool) -> Option<String> {
        if savepoint {
            return None;
        }

        Some(match self.dialect {
            DatabaseType::MSSQL => "COMMIT TRANSACTION".to_string(),
            _ => "COMMIT".to_string(),
        })
    }

    fn rollback_transaction(&self, savepoint: Option<&str>) -> String {
        match (self.dialect, savepoint) {
            (DatabaseType::MSSQL, Some(name)) => {
                format!("ROLLBACK TRANSACTION {}", self.quote(name))
            }
            (DatabaseType::MSSQL, None) => "ROLLBACK TRANSACTION".to_string(),
            (_, Some(name)) => format!("ROLLBACK TO SAVEPOINT {}", self.quote(name)),
            (_, None) => "ROLLBACK".to_string(),
        }
    }

    fn supports_isolation_level_during_transaction(&self) -> bool {
        self.dialect != DatabaseType::MySQL
    }
}
