//! Integration tests for transactions and savepoints over the scripted adapter.

mod common;

use common::{manager_options, manager_with};
use db_pool_core::config::ConnectionParams;
use db_pool_core::db::PoolRole;
use db_pool_core::models::{
    AcquireOptions, DatabaseType, Deferrable, IsolationLevel, TransactionOptions, TransactionOutcome,
    TransactionState, TransactionType,
};
use db_pool_core::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn versioned(dialect: DatabaseType) -> db_pool_core::ManagerOptions {
    manager_options(dialect).with_database_version("1.0.0")
}

#[tokio::test]
async fn test_mysql_sets_isolation_before_begin() {
    let (manager, state) = manager_with(
        versioned(DatabaseType::MySQL).with_isolation_level(IsolationLevel::ReadCommitted),
    );

    let tx = manager
        .transaction(TransactionOptions::default().with_autocommit(false))
        .await
        .unwrap();
    assert_eq!(tx.state(), TransactionState::Active);
    assert!(tx.id().starts_with("tx_"));

    tx.execute("INSERT INTO t VALUES (1)").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        state.statements(),
        vec![
            "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED",
            "START TRANSACTION",
            "SET autocommit = 0",
            "INSERT INTO t VALUES (1)",
            "COMMIT",
        ]
    );
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(tx.finished(), Some(TransactionOutcome::Commit));

    let stats = &manager.stats()[0];
    assert_eq!(stats.using, 0);
    assert_eq!(stats.available, 1);
}

#[tokio::test]
async fn test_postgres_isolation_after_begin() {
    let (manager, state) = manager_with(versioned(DatabaseType::PostgreSQL));

    let tx = manager
        .transaction(
            TransactionOptions::default()
                .with_isolation_level(IsolationLevel::Serializable)
                .with_deferrable(Deferrable::SetDeferred(Vec::new())),
        )
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(
        state.statements(),
        vec![
            "START TRANSACTION",
            "SET CONSTRAINTS ALL DEFERRED",
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            "ROLLBACK",
        ]
    );
    assert_eq!(tx.state(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_sqlite_uses_manager_transaction_type() {
    let (manager, state) = manager_with(
        versioned(DatabaseType::SQLite).with_transaction_type(TransactionType::Immediate),
    );

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    assert_eq!(tx.options().transaction_type, Some(TransactionType::Immediate));
    tx.commit().await.unwrap();

    let exclusive = manager
        .transaction(TransactionOptions::default().with_type(TransactionType::Exclusive))
        .await
        .unwrap();
    exclusive.commit().await.unwrap();

    assert_eq!(
        state.statements(),
        vec![
            "BEGIN IMMEDIATE TRANSACTION",
            "COMMIT",
            "BEGIN EXCLUSIVE TRANSACTION",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_savepoints_share_connection() {
    let (manager, state) = manager_with(versioned(DatabaseType::SQLite));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let first = tx.savepoint(TransactionOptions::default()).await.unwrap();
    let second = tx
        .savepoint(TransactionOptions::default().with_isolation_level(IsolationLevel::Serializable))
        .await
        .unwrap();

    assert!(first.is_savepoint());
    assert_eq!(first.id(), tx.id());
    assert_eq!(first.name(), format!("{}-savepoint-1", tx.id()));
    assert_eq!(second.name(), format!("{}-savepoint-2", tx.id()));
    assert_eq!(first.parent().unwrap().id(), tx.id());
    assert_eq!(tx.savepoints().len(), 2);

    let root_conn = tx.connection().unwrap();
    assert!(first.connection().unwrap().ptr_eq(&root_conn));
    assert_eq!(root_conn.transaction_id().as_deref(), Some(tx.id()));

    second.rollback().await.unwrap();
    first.commit().await.unwrap();

    // Finishing savepoints keeps the root's connection checked out.
    assert_eq!(manager.stats()[0].using, 1);
    assert!(tx.connection().is_some());

    tx.commit().await.unwrap();
    assert_eq!(manager.stats()[0].using, 0);
    assert_eq!(root_conn.transaction_id(), None);

    let id = tx.id();
    assert_eq!(
        state.statements(),
        vec![
            "BEGIN DEFERRED TRANSACTION".to_string(),
            format!("SAVEPOINT \"{id}-savepoint-1\""),
            format!("SAVEPOINT \"{id}-savepoint-2\""),
            format!("ROLLBACK TO SAVEPOINT \"{id}-savepoint-2\""),
            "COMMIT".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_savepoint_rollback_then_parent_commit() {
    let (manager, _state) = manager_with(versioned(DatabaseType::PostgreSQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let savepoint = tx.savepoint(TransactionOptions::default()).await.unwrap();
    savepoint.rollback().await.unwrap();

    assert_eq!(savepoint.finished(), Some(TransactionOutcome::Rollback));
    assert_eq!(tx.finished(), None);
    assert_eq!(tx.state(), TransactionState::Active);
    assert_eq!(manager.stats()[0].using, 1);

    tx.commit().await.unwrap();
    assert_eq!(tx.finished(), Some(TransactionOutcome::Commit));

    let stats = &manager.stats()[0];
    assert_eq!(stats.released, 1);
    assert_eq!(stats.using, 0);
}

#[tokio::test]
async fn test_nested_savepoint_names() {
    let (manager, state) = manager_with(versioned(DatabaseType::PostgreSQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let outer = tx.savepoint(TransactionOptions::default()).await.unwrap();
    let inner = outer.savepoint(TransactionOptions::default()).await.unwrap();

    let id = tx.id();
    assert_eq!(inner.id(), id);
    assert_eq!(outer.name(), format!("{id}-savepoint-1"));
    assert_eq!(inner.name(), format!("{id}-savepoint-1-savepoint-1"));
    assert_ne!(inner.name(), outer.name());
    assert_eq!(inner.parent().unwrap().name(), outer.name());
    assert_eq!(outer.savepoints().len(), 1);

    outer.rollback().await.unwrap();
    assert_eq!(
        state.statements().last().cloned(),
        Some(format!("ROLLBACK TO SAVEPOINT \"{id}-savepoint-1\""))
    );

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_savepoint_rejected_after_root_finishes() {
    let (manager, state) = manager_with(versioned(DatabaseType::PostgreSQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let savepoint = tx.savepoint(TransactionOptions::default()).await.unwrap();
    let tx_connection = tx.connection().unwrap();
    tx.commit().await.unwrap();

    // The connection now belongs to someone else.
    let other = manager.get_connection(AcquireOptions::write()).await.unwrap();
    assert!(other.ptr_eq(&tx_connection));
    let before = state.statements();

    assert!(matches!(
        savepoint.execute("DELETE FROM t").await,
        Err(DbError::Transaction { .. })
    ));
    assert!(savepoint.rollback().await.is_err());
    assert!(savepoint.commit().await.is_err());
    assert!(savepoint.savepoint(TransactionOptions::default()).await.is_err());
    assert_eq!(savepoint.finished(), None);
    assert_eq!(state.statements(), before);

    manager.release_connection(&other).await.unwrap();
}

#[tokio::test]
async fn test_savepoint_rejected_after_root_force_cleanup() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let savepoint = tx.savepoint(TransactionOptions::default()).await.unwrap();
    savepoint.force_cleanup().await.unwrap();
    assert_eq!(manager.stats()[0].using, 0);

    let before = state.statements();
    assert!(savepoint.execute("SELECT 1").await.is_err());
    assert!(tx.execute("SELECT 1").await.is_err());
    assert_eq!(state.statements(), before);
}

#[tokio::test]
async fn test_after_commit_runs_only_on_success() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = manager.transaction(TransactionOptions::default()).await.unwrap();
    let counter = Arc::clone(&calls);
    failing.after_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    state.fail_statement("COMMIT");

    let err = failing.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(failing.finished(), Some(TransactionOutcome::Commit));
    // The connection goes back to the pool even when COMMIT fails.
    assert_eq!(manager.stats()[0].using, 0);

    state.failing_statements.lock().unwrap().clear();
    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    let counter = Arc::clone(&calls);
    tx.after_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tx.commit().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_finished_transaction_rejects_further_use() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(err.to_string().contains(
        "Transaction cannot be committed because it has been finished with state: commit"
    ));

    let err = tx.rollback().await.unwrap_err();
    assert!(err.to_string().contains(
        "Transaction cannot be rolled back because it has been finished with state: commit"
    ));

    let err = tx.execute("SELECT 1").await.unwrap_err();
    match err {
        DbError::Transaction { transaction_id, .. } => assert_eq!(transaction_id, tx.id()),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(state.statements(), vec!["START TRANSACTION", "COMMIT"]);
}

#[tokio::test]
async fn test_setup_failure_rolls_back_and_releases() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));
    state.fail_statement("SET autocommit = 1");

    let err = manager
        .transaction(TransactionOptions::default().with_autocommit(true))
        .await
        .unwrap_err();
    match err {
        DbError::Database { sql_state, .. } => assert_eq!(sql_state.as_deref(), Some("40001")),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(
        state.statements(),
        vec!["START TRANSACTION", "SET autocommit = 1", "ROLLBACK"]
    );
    let stats = &manager.stats()[0];
    assert_eq!(stats.using, 0);
    assert_eq!(stats.available, 1);
}

#[tokio::test]
async fn test_transaction_without_connection_reports_acquire_error() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));
    state.fail_next_connect(
        db_pool_core::db::AdapterError::new("refused").with_code("ECONNREFUSED"),
    );

    let err = manager
        .transaction(TransactionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ConnectionRefused { .. }));
    assert!(state.statements().is_empty());
}

#[tokio::test]
async fn test_read_only_transaction_uses_replica() {
    let dialect = DatabaseType::PostgreSQL;
    let options = versioned(dialect).with_replication(
        ConnectionParams::new(dialect),
        vec![ConnectionParams::new(dialect).host("replica")],
    );
    let (manager, _state) = manager_with(options);

    let reader = manager.transaction(TransactionOptions::read_only()).await.unwrap();
    let conn = reader.connection().unwrap();
    assert_eq!(conn.role(), PoolRole::Read);
    assert_eq!(conn.target(), "replica:5432");
    reader.commit().await.unwrap();

    let writer = manager.transaction(TransactionOptions::default()).await.unwrap();
    assert_eq!(writer.connection().unwrap().role(), PoolRole::Write);
    writer.commit().await.unwrap();
}

#[tokio::test]
async fn test_run_in_transaction_commits_on_success() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));

    let value = manager
        .run_in_transaction(TransactionOptions::default(), |tx| async move {
            tx.execute("UPDATE t SET x = 1").await?;
            Ok::<_, DbError>(42)
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(
        state.statements(),
        vec!["START TRANSACTION", "UPDATE t SET x = 1", "COMMIT"]
    );
}

#[tokio::test]
async fn test_run_in_transaction_rolls_back_on_error() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));

    let result: DbResult<()> = manager
        .run_in_transaction(TransactionOptions::default(), |_tx| async move {
            Err::<(), _>(DbError::invalid_input("business rule violated"))
        })
        .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(state.statements(), vec!["START TRANSACTION", "ROLLBACK"]);
    assert_eq!(manager.stats()[0].using, 0);
}

#[tokio::test]
async fn test_run_in_transaction_respects_manual_finish() {
    let (manager, state) = manager_with(versioned(DatabaseType::MySQL));

    manager
        .run_in_transaction(TransactionOptions::default(), |tx| async move {
            tx.rollback().await
        })
        .await
        .unwrap();

    assert_eq!(state.statements(), vec!["START TRANSACTION", "ROLLBACK"]);
}

#[tokio::test]
async fn test_force_cleanup_releases_once() {
    let (manager, _state) = manager_with(versioned(DatabaseType::MySQL));

    let tx = manager.transaction(TransactionOptions::default()).await.unwrap();
    tx.force_cleanup().await.unwrap();
    tx.force_cleanup().await.unwrap();

    let stats = &manager.stats()[0];
    assert_eq!(stats.using, 0);
    assert_eq!(stats.released, 1);
}
