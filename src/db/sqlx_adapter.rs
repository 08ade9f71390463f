//! Dialect adapter backed by single `sqlx` connections.
//!
//! Supports MySQL/MariaDB, PostgreSQL and SQLite. Driver errors are translated into
//! [`AdapterError`]s carrying the errno-style or SQLSTATE code the connection manager
//! classifies on.

use crate::config::ConnectionParams;
use crate::db::adapter::{AdapterError, DialectAdapter};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use async_trait::async_trait;
use sqlx::{
    ConnectOptions, Connection, Executor, MySqlConnection, PgConnection, SqliteConnection,
    mysql::{MySqlConnectOptions, MySqlDatabaseError},
    postgres::PgConnectOptions,
    sqlite::SqliteConnectOptions,
};
use std::str::FromStr;

/// Database-specific connection (avoids `AnyConnection` limitations).
#[derive(Debug)]
pub enum SqlxConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl SqlxConnection {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            SqlxConnection::MySql(_) => DatabaseType::MySQL,
            SqlxConnection::Postgres(_) => DatabaseType::PostgreSQL,
            SqlxConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// [`DialectAdapter`] over `sqlx`.
#[derive(Debug, Clone)]
pub struct SqlxAdapter {
    dialect: DatabaseType,
    /// Create SQLite database files that do not exist yet.
    create_if_missing: bool,
}

impl SqlxAdapter {
    pub fn new(dialect: DatabaseType) -> DbResult<Self> {
        if dialect == DatabaseType::MSSQL {
            return Err(DbError::invalid_input(
                "MSSQL is not supported by the sqlx adapter",
            ));
        }
        Ok(Self {
            dialect,
            create_if_missing: true,
        })
    }

    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.create_if_missing = enabled;
        self
    }
}

#[async_trait]
impl DialectAdapter for SqlxAdapter {
    type Connection = SqlxConnection;

    fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<SqlxConnection, AdapterError> {
        let url = params
            .to_url()
            .map_err(|msg| AdapterError::new(msg).with_code("EINVAL"))?;

        match self.dialect {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&url)
                    .map_err(adapter_error)?
                    .charset("utf8mb4");
                options
                    .connect()
                    .await
                    .map(SqlxConnection::MySql)
                    .map_err(adapter_error)
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(&url).map_err(adapter_error)?;
                options
                    .connect()
                    .await
                    .map(SqlxConnection::Postgres)
                    .map_err(adapter_error)
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&url)
                    .map_err(adapter_error)?
                    .create_if_missing(self.create_if_missing);
                options
                    .connect()
                    .await
                    .map(SqlxConnection::SQLite)
                    .map_err(adapter_error)
            }
            DatabaseType::MSSQL => Err(AdapterError::new(
                "MSSQL is not supported by the sqlx adapter",
            )
            .with_code("EINVAL")),
        }
    }

    async fn disconnect(&self, connection: SqlxConnection) -> Result<(), AdapterError> {
        match connection {
            SqlxConnection::MySql(conn) => conn.close().await,
            SqlxConnection::Postgres(conn) => conn.close().await,
            SqlxConnection::SQLite(conn) => conn.close().await,
        }
        .map_err(adapter_error)
    }

    async fn validate(&self, connection: &mut SqlxConnection) -> bool {
        match connection {
            SqlxConnection::MySql(conn) => conn.ping().await.is_ok(),
            SqlxConnection::Postgres(conn) => conn.ping().await.is_ok(),
            SqlxConnection::SQLite(conn) => conn.ping().await.is_ok(),
        }
    }

    async fn execute(&self, connection: &mut SqlxConnection, sql: &str) -> Result<(), AdapterError> {
        // Unprepared execution: transaction-control statements cannot always be prepared.
        match connection {
            SqlxConnection::MySql(conn) => conn.execute(sql).await.map(|_| ()),
            SqlxConnection::Postgres(conn) => conn.execute(sql).await.map(|_| ()),
            SqlxConnection::SQLite(conn) => conn.execute(sql).await.map(|_| ()),
        }
        .map_err(adapter_error)
    }

    async fn server_version(&self, connection: &mut SqlxConnection) -> Result<String, AdapterError> {
        match connection {
            SqlxConnection::MySql(conn) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(conn)
                    .await
            }
            SqlxConnection::Postgres(conn) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(conn)
                    .await
            }
            SqlxConnection::SQLite(conn) => {
                sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                    .fetch_one(conn)
                    .await
            }
        }
        .map_err(adapter_error)
    }
}

/// Translate a driver error, attaching the failure code the manager classifies on.
fn adapter_error(err: sqlx::Error) -> AdapterError {
    let code = failure_code(&err);
    let message = match &err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        other => other.to_string(),
    };

    let adapter_err = AdapterError::new(message).with_source(err);
    match code {
        Some(code) => adapter_err.with_code(code),
        None => adapter_err,
    }
}

fn failure_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Io(io_err) => io_failure_code(io_err).map(String::from),
        sqlx::Error::Configuration(_) => Some("EINVAL".to_string()),
        sqlx::Error::Database(db_err) => {
            if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
                let name = match mysql_err.number() {
                    1044 => Some("ER_DBACCESS_DENIED_ERROR"),
                    1045 => Some("ER_ACCESS_DENIED_ERROR"),
                    1049 => Some("ER_BAD_DB_ERROR"),
                    _ => None,
                };
                if let Some(name) = name {
                    return Some(name.to_string());
                }
            }
            db_err.code().map(|code| code.to_string())
        }
        _ => None,
    }
}

fn io_failure_code(err: &std::io::Error) -> Option<&'static str> {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused => return Some("ECONNREFUSED"),
        ErrorKind::HostUnreachable => return Some("EHOSTUNREACH"),
        ErrorKind::NetworkUnreachable => return Some("ENETUNREACH"),
        ErrorKind::InvalidInput => return Some("EINVAL"),
        _ => {}
    }

    // Resolver failures surface as uncategorized errors; match on the message.
    let message = err.to_string().to_lowercase();
    if message.contains("failed to lookup address")
        || message.contains("name or service not known")
        || message.contains("nodename nor servname")
    {
        Some("ENOTFOUND")
    } else if message.contains("no route to host") {
        Some("EHOSTUNREACH")
    } else {
        None
    }
}
