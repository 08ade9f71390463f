//! Connection pooling and transaction layer.
//!
//! This module provides:
//! - A generic bounded resource pool with priority waiters and idle eviction
//! - Read/write routing across a primary and its replicas
//! - The connection manager that owns the pools and the dialect adapter
//! - Transactions and nested savepoints on top of managed connections
//! - Per-dialect transaction statements and a `sqlx`-backed adapter

pub mod adapter;
pub mod manager;
pub mod query_generator;
pub mod replication;
pub mod resource_pool;
pub mod sqlx_adapter;
pub mod transaction;

pub use adapter::{AdapterError, ConnectionHooks, DialectAdapter, NoopHooks};
pub use manager::{
    ConnectionFactory, ConnectionManager, DbConnection, PooledConnection, coerce_version,
};
pub use query_generator::{DefaultQueryGenerator, QueryGenerator};
pub use replication::{ReplicationRouter, RoundRobin};
pub use resource_pool::{
    DEFAULT_PRIORITY, PoolRole, PoolStats, Pooled, ResourceFactory, ResourcePool,
};
pub use sqlx_adapter::{SqlxAdapter, SqlxConnection};
pub use transaction::Transaction;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
