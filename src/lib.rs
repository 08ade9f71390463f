//! DB Pool Core Library
//!
//! Connection pooling, read/write replica routing and transaction management for
//! SQL database clients (MySQL/MariaDB, PostgreSQL, SQLite, MSSQL statements).
//!
//! The core is protocol-agnostic: physical connections come from a
//! [`db::DialectAdapter`]. A `sqlx`-backed adapter is bundled for MySQL,
//! PostgreSQL and SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, ConnectionParams, ManagerOptions, PoolOptions, ReplicationOptions};
pub use db::{ConnectionManager, ResourcePool, Transaction};
pub use error::{DbError, DbResult};
