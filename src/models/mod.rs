//! Data models shared by the pool, manager and transaction layers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod transaction;

// Re-export commonly used types
pub use connection::{AcquireOptions, DatabaseType, QueryType};
pub use transaction::{
    Deferrable, IsolationLevel, RowLock, TransactionOptions, TransactionOutcome,
    TransactionState, TransactionType,
};
