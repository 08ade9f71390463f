//! Transactions and nested savepoints over managed connections.
//!
//! A root transaction holds one pooled connection from [`Transaction::prepare_environment`]
//! until it commits or rolls back, at which point the connection goes back to the
//! pool. Savepoints share their root's id and connection and never release it.
//!
//! Parents keep their savepoints alive; a savepoint only holds a `Weak` link back to
//! its parent so the tree has no reference cycles.

use crate::db::adapter::DialectAdapter;
use crate::db::lock;
use crate::db::manager::{ConnectionManager, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{AcquireOptions, TransactionOptions, TransactionOutcome, TransactionState};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

type AfterCommit = Box<dyn FnOnce() + Send + 'static>;

struct Lifecycle {
    state: TransactionState,
    finished: Option<TransactionOutcome>,
}

struct TransactionInner<A: DialectAdapter> {
    id: String,
    /// Savepoint name, or the id for a root transaction.
    name: String,
    manager: ConnectionManager<A>,
    parent: Option<Weak<TransactionInner<A>>>,
    options: TransactionOptions,
    connection: Mutex<Option<PooledConnection<A>>>,
    savepoints: Mutex<Vec<Transaction<A>>>,
    lifecycle: Mutex<Lifecycle>,
    after_commit: Mutex<Vec<AfterCommit>>,
    created_at: DateTime<Utc>,
}

/// A unit of work bound to one connection.
pub struct Transaction<A: DialectAdapter> {
    inner: Arc<TransactionInner<A>>,
}

impl<A: DialectAdapter> Clone for Transaction<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: DialectAdapter> Transaction<A> {
    /// Build a transaction. With a parent this is a savepoint appended to the parent.
    ///
    /// Unset options fall back to the manager's `transaction_type` and `isolation_level`.
    pub(crate) fn new(
        manager: ConnectionManager<A>,
        mut options: TransactionOptions,
        parent: Option<&Transaction<A>>,
    ) -> Self {
        let defaults = manager.options();
        options
            .transaction_type
            .get_or_insert(defaults.transaction_type);
        if options.isolation_level.is_none() {
            options.isolation_level = defaults.isolation_level;
        }

        let Some(parent) = parent else {
            let id = manager.query_generator().generate_transaction_id();
            return Self::build(id.clone(), id, manager, None, options);
        };

        let id = parent.inner.id.clone();
        let mut savepoints = lock(&parent.inner.savepoints);
        let name = format!("{}-savepoint-{}", parent.inner.name, savepoints.len() + 1);
        let savepoint = Self::build(
            id,
            name,
            manager,
            Some(Arc::downgrade(&parent.inner)),
            options,
        );
        savepoints.push(savepoint.clone());
        savepoint
    }

    fn build(
        id: String,
        name: String,
        manager: ConnectionManager<A>,
        parent: Option<Weak<TransactionInner<A>>>,
        options: TransactionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                name,
                manager,
                parent,
                options,
                connection: Mutex::new(None),
                savepoints: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(Lifecycle {
                    state: TransactionState::Created,
                    finished: None,
                }),
                after_commit: Mutex::new(Vec::new()),
                created_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Savepoint name (`<parent name>-savepoint-<n>`), or the id for a root transaction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_savepoint(&self) -> bool {
        self.inner.parent.is_some()
    }

    pub fn parent(&self) -> Option<Transaction<A>> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Transaction { inner })
    }

    /// Savepoints created on this transaction, oldest first.
    pub fn savepoints(&self) -> Vec<Transaction<A>> {
        lock(&self.inner.savepoints).clone()
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.inner.options
    }

    pub fn connection(&self) -> Option<PooledConnection<A>> {
        lock(&self.inner.connection).clone()
    }

    pub fn finished(&self) -> Option<TransactionOutcome> {
        lock(&self.inner.lifecycle).finished
    }

    pub fn state(&self) -> TransactionState {
        lock(&self.inner.lifecycle).state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Register a callback to run once this transaction commits successfully.
    pub fn after_commit(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.inner.after_commit).push(Box::new(callback));
    }

    /// Bind a connection and issue the opening statements.
    ///
    /// On any failure the transaction is rolled back (errors ignored) and the
    /// original error is returned.
    pub async fn prepare_environment(&self) -> DbResult<()> {
        self.set_state(TransactionState::Preparing);

        if let Err(err) = self.setup().await {
            warn!(
                transaction_id = %self.inner.id,
                error = %err,
                "Transaction setup failed, rolling back"
            );
            if let Err(rollback_err) = self.rollback().await {
                debug!(
                    transaction_id = %self.inner.id,
                    error = %rollback_err,
                    "Rollback after failed setup did not succeed"
                );
            }
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.finished.get_or_insert(TransactionOutcome::Rollback);
            lifecycle.state = TransactionState::RolledBack;
            return Err(err);
        }

        self.set_state(TransactionState::Active);
        if self.is_savepoint() {
            debug!(transaction_id = %self.inner.id, savepoint = %self.inner.name, "Savepoint created");
        } else {
            info!(
                transaction_id = %self.inner.id,
                dialect = %self.inner.manager.dialect(),
                "Transaction started"
            );
        }
        Ok(())
    }

    async fn setup(&self) -> DbResult<()> {
        let connection = match &self.inner.parent {
            Some(parent) => {
                let parent = parent.upgrade().ok_or_else(|| {
                    DbError::transaction("Parent transaction no longer exists", &self.inner.id)
                })?;
                lock(&parent.connection).clone().ok_or_else(|| {
                    DbError::transaction("Parent transaction has no connection", &self.inner.id)
                })?
            }
            None => {
                let acquire = if self.inner.options.read_only {
                    AcquireOptions::read()
                } else {
                    AcquireOptions::write()
                };
                let connection = self.inner.manager.get_connection(acquire).await?;
                connection.tag(&self.inner.id);
                connection
            }
        };
        *lock(&self.inner.connection) = Some(connection);

        let isolation_first = !self
            .inner
            .manager
            .query_generator()
            .supports_isolation_level_during_transaction();

        if isolation_first {
            self.set_isolation_level().await?;
        }
        self.begin().await?;
        self.set_deferrable().await?;
        if !isolation_first {
            self.set_isolation_level().await?;
        }
        self.set_autocommit().await
    }

    async fn begin(&self) -> DbResult<()> {
        let transaction_type = self.inner.options.transaction_type.unwrap_or_default();
        let sql = self
            .inner
            .manager
            .query_generator()
            .start_transaction(transaction_type, self.savepoint_name());
        self.run(&sql).await
    }

    async fn set_deferrable(&self) -> DbResult<()> {
        let Some(deferrable) = &self.inner.options.deferrable else {
            return Ok(());
        };
        let sql = self.inner.manager.query_generator().defer_constraints(deferrable);
        self.run_optional(sql).await
    }

    async fn set_isolation_level(&self) -> DbResult<()> {
        let Some(level) = self.inner.options.isolation_level else {
            return Ok(());
        };
        let sql = self
            .inner
            .manager
            .query_generator()
            .set_isolation_level(level, self.is_savepoint());
        self.run_optional(sql).await
    }

    async fn set_autocommit(&self) -> DbResult<()> {
        let Some(autocommit) = self.inner.options.autocommit else {
            return Ok(());
        };
        let sql = self
            .inner
            .manager
            .query_generator()
            .set_autocommit(autocommit, self.is_savepoint());
        self.run_optional(sql).await
    }

    /// Start a savepoint nested in this transaction.
    pub async fn savepoint(&self, options: TransactionOptions) -> DbResult<Transaction<A>> {
        self.ensure_open()?;
        let savepoint = Transaction::new(self.inner.manager.clone(), options, Some(self));
        savepoint.prepare_environment().await?;
        Ok(savepoint)
    }

    /// Run a statement inside this transaction.
    pub async fn execute(&self, sql: &str) -> DbResult<()> {
        self.ensure_open()?;
        self.run(sql).await
    }

    /// Commit. Savepoints send nothing; a root releases its connection whatever the outcome.
    pub async fn commit(&self) -> DbResult<()> {
        self.claim(TransactionOutcome::Commit)?;

        let sql = self
            .inner
            .manager
            .query_generator()
            .commit_transaction(self.is_savepoint());
        let result = self.run_optional(sql).await;
        let cleanup = self.cleanup().await;

        if let Err(err) = result {
            warn!(transaction_id = %self.inner.id, error = %err, "Commit failed");
            return Err(err);
        }

        if !self.is_savepoint() {
            info!(transaction_id = %self.inner.id, "Transaction committed");
        }
        let callbacks = std::mem::take(&mut *lock(&self.inner.after_commit));
        for callback in callbacks {
            callback();
        }
        cleanup
    }

    /// Roll back, or roll back to the savepoint. A root releases its connection.
    pub async fn rollback(&self) -> DbResult<()> {
        self.claim(TransactionOutcome::Rollback)?;

        let sql = self
            .inner
            .manager
            .query_generator()
            .rollback_transaction(self.savepoint_name());
        let result = self.run(&sql).await;
        let cleanup = self.cleanup().await;

        match &result {
            Ok(()) if self.is_savepoint() => {
                debug!(transaction_id = %self.inner.id, savepoint = %self.inner.name, "Rolled back to savepoint")
            }
            Ok(()) => info!(transaction_id = %self.inner.id, "Transaction rolled back"),
            Err(err) => warn!(transaction_id = %self.inner.id, error = %err, "Rollback failed"),
        }
        result.and(cleanup)
    }

    /// Release the connection regardless of parentage. A no-op once released.
    pub async fn force_cleanup(&self) -> DbResult<()> {
        self.release_connection().await
    }

    async fn cleanup(&self) -> DbResult<()> {
        if self.is_savepoint() {
            return Ok(());
        }
        self.release_connection().await
    }

    async fn release_connection(&self) -> DbResult<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        // The tag guards against releasing twice.
        if !connection.untag(&self.inner.id) {
            return Ok(());
        }
        debug!(
            transaction_id = %self.inner.id,
            connection_id = connection.id(),
            "Releasing transaction connection"
        );
        self.inner.manager.release_connection(&connection).await
    }

    /// Mark the transaction finished, failing if it already is or never got a connection.
    fn claim(&self, outcome: TransactionOutcome) -> DbResult<()> {
        let verb = match outcome {
            TransactionOutcome::Commit => "committed",
            TransactionOutcome::Rollback => "rolled back",
        };

        let mut lifecycle = lock(&self.inner.lifecycle);
        if let Some(finished) = lifecycle.finished {
            return Err(DbError::transaction(
                format!("Transaction cannot be {verb} because it has been finished with state: {finished}"),
                &self.inner.id,
            ));
        }
        self.ensure_owner()?;
        if lock(&self.inner.connection).is_none() {
            return Err(DbError::transaction(
                format!("Transaction cannot be {verb} because it never started"),
                &self.inner.id,
            ));
        }

        lifecycle.finished = Some(outcome);
        lifecycle.state = match outcome {
            TransactionOutcome::Commit => TransactionState::Committed,
            TransactionOutcome::Rollback => TransactionState::RolledBack,
        };
        Ok(())
    }

    fn ensure_open(&self) -> DbResult<()> {
        if let Some(finished) = self.finished() {
            return Err(DbError::transaction(
                format!("Transaction has been finished with state: {finished}; no further queries are allowed"),
                &self.inner.id,
            ));
        }
        self.ensure_owner()
    }

    /// Fail when an enclosing transaction has finished or the connection has moved
    /// on to another owner.
    fn ensure_owner(&self) -> DbResult<()> {
        let mut next = self.inner.parent.clone();
        while let Some(weak) = next {
            let Some(ancestor) = weak.upgrade() else {
                return Err(DbError::transaction(
                    "Parent transaction no longer exists",
                    &self.inner.id,
                ));
            };
            if let Some(finished) = lock(&ancestor.lifecycle).finished {
                return Err(DbError::transaction(
                    format!("Parent transaction has been finished with state: {finished}"),
                    &self.inner.id,
                ));
            }
            next = ancestor.parent.clone();
        }

        let connection = lock(&self.inner.connection).clone();
        if let Some(connection) = connection {
            if connection.transaction_id().as_deref() != Some(self.inner.id.as_str()) {
                return Err(DbError::transaction(
                    "Transaction no longer owns its connection",
                    &self.inner.id,
                ));
            }
        }
        Ok(())
    }

    fn set_state(&self, state: TransactionState) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.finished.is_none() {
            lifecycle.state = state;
        }
    }

    fn savepoint_name(&self) -> Option<&str> {
        self.is_savepoint().then_some(self.inner.name.as_str())
    }

    async fn run(&self, sql: &str) -> DbResult<()> {
        let connection = self.connection().ok_or_else(|| {
            DbError::transaction("Transaction has no connection", &self.inner.id)
        })?;
        self.inner.manager.execute(&connection, sql).await
    }

    async fn run_optional(&self, sql: Option<String>) -> DbResult<()> {
        match sql {
            Some(sql) => self.run(&sql).await,
            None => Ok(()),
        }
    }
}

impl<A: DialectAdapter> std::fmt::Debug for Transaction<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = lock(&self.inner.lifecycle);
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("savepoint", &self.is_savepoint())
            .field("state", &lifecycle.state)
            .field("finished", &lifecycle.finished)
            .field("created_at", &self.inner.created_at)
            .finish()
    }
}
