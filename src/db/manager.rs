//! Connection manager owning the pools, the dialect adapter and version detection.
//!
//! # Design Decisions
//!
//! - **Adapter, hooks and query generator are injected**: the manager never speaks a
//!   wire protocol and can be driven entirely by a scripted adapter in tests
//! - **`Shared` version future**: concurrent callers await one detection attempt; a
//!   generation counter keeps a stale failure from clearing a newer attempt
//! - **Weak shutdown task**: the opt-in Ctrl-C drain holds a `Weak` reference and is
//!   aborted by `close()` or when the last manager handle is dropped

use crate::config::{ConnectionParams, ManagerOptions};
use crate::db::adapter::{ConnectionHooks, DialectAdapter, NoopHooks};
use crate::db::lock;
use crate::db::query_generator::{DefaultQueryGenerator, QueryGenerator};
use crate::db::replication::{ReplicationRouter, RoundRobin};
use crate::db::resource_pool::{
    DEFAULT_PRIORITY, PoolRole, PoolStats, Pooled, ResourceFactory, ResourcePool,
};
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{AcquireOptions, DatabaseType, TransactionOptions};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{MappedMutexGuard, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A physical connection as stored in the pool.
///
/// The raw connection is taken out when the resource is destroyed, after which
/// [`DbConnection::raw`] reports [`DbError::ConnectionClosed`].
pub struct DbConnection<C> {
    raw: tokio::sync::Mutex<Option<C>>,
    /// Id of the transaction currently owning this connection.
    transaction_id: Mutex<Option<String>>,
    target: String,
}

impl<C> DbConnection<C> {
    fn new(raw: C, target: String) -> Self {
        Self {
            raw: tokio::sync::Mutex::new(Some(raw)),
            transaction_id: Mutex::new(None),
            target,
        }
    }

    /// Lock the raw connection for direct use.
    pub async fn raw(&self) -> DbResult<MappedMutexGuard<'_, C>> {
        let guard = self.raw.lock().await;
        AsyncMutexGuard::try_map(guard, Option::as_mut).map_err(|_| DbError::ConnectionClosed)
    }

    async fn take(&self) -> Option<C> {
        self.raw.lock().await.take()
    }

    /// `host:port` (or SQLite path) this connection was opened against.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn transaction_id(&self) -> Option<String> {
        lock(&self.transaction_id).clone()
    }

    pub(crate) fn tag(&self, transaction_id: &str) {
        *lock(&self.transaction_id) = Some(transaction_id.to_string());
    }

    /// Clear the tag if `transaction_id` still owns the connection.
    pub(crate) fn untag(&self, transaction_id: &str) -> bool {
        let mut tag = lock(&self.transaction_id);
        if tag.as_deref() == Some(transaction_id) {
            *tag = None;
            true
        } else {
            false
        }
    }
}

impl<C> std::fmt::Debug for DbConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("target", &self.target)
            .field("transaction_id", &self.transaction_id())
            .finish()
    }
}

/// Pool handle to a managed connection.
pub type PooledConnection<A> = Pooled<DbConnection<<A as DialectAdapter>::Connection>>;

/// Adapter plus connect hooks.
struct Connector<A: DialectAdapter> {
    adapter: A,
    hooks: Arc<dyn ConnectionHooks<A::Connection>>,
}

impl<A: DialectAdapter> Connector<A> {
    async fn connect(&self, params: &ConnectionParams) -> DbResult<A::Connection> {
        let mut params = params.clone();
        self.hooks
            .before_connect(&mut params)
            .await
            .map_err(|err| hook_failure("before_connect", err))?;

        let mut connection = self.adapter.connect(&params).await.map_err(|err| {
            let err = DbError::from_connect_failure(err);
            warn!(
                db_target = %params.display_target(),
                error = %err,
                "Connection attempt failed"
            );
            err
        })?;

        if let Err(err) = self.hooks.after_connect(&mut connection, &params).await {
            if let Err(close_err) = self.adapter.disconnect(connection).await {
                warn!(error = %close_err, "Failed to close connection after hook failure");
            }
            return Err(hook_failure("after_connect", err));
        }

        debug!(db_target = %params.display_target(), "Connection established");
        Ok(connection)
    }

    async fn disconnect(&self, connection: A::Connection) -> DbResult<()> {
        self.adapter
            .disconnect(connection)
            .await
            .map_err(|err| DbError::Connection {
                message: err.message.clone(),
                cause: Some(Arc::new(err)),
            })
    }
}

fn hook_failure(hook: &str, err: DbError) -> DbError {
    if err.is_connection_error() {
        err
    } else {
        DbError::connection(format!("{hook} hook failed: {err}"))
    }
}

/// Pool factory opening connections through the adapter.
///
/// With several targets each creation picks the next one in rotation.
pub struct ConnectionFactory<A: DialectAdapter> {
    connector: Arc<Connector<A>>,
    targets: RoundRobin<ConnectionParams>,
}

impl<A: DialectAdapter> ConnectionFactory<A> {
    fn new(connector: Arc<Connector<A>>, targets: Vec<ConnectionParams>) -> Self {
        Self {
            connector,
            targets: RoundRobin::new(targets),
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[async_trait]
impl<A: DialectAdapter> ResourceFactory for ConnectionFactory<A> {
    type Resource = DbConnection<A::Connection>;

    async fn create(&self) -> DbResult<Self::Resource> {
        let params = self
            .targets
            .pick()
            .ok_or_else(|| DbError::invalid_input("No connection targets configured"))?;
        let raw = self.connector.connect(params).await?;
        Ok(DbConnection::new(raw, params.display_target()))
    }

    async fn destroy(&self, connection: &Self::Resource) {
        let Some(raw) = connection.take().await else {
            return;
        };
        if let Err(err) = self.connector.disconnect(raw).await {
            warn!(db_target = %connection.target(), error = %err, "Failed to close connection");
        }
    }

    async fn validate(&self, connection: &Self::Resource) -> bool {
        let mut raw = connection.raw.lock().await;
        match raw.as_mut() {
            Some(raw) => self.connector.adapter.validate(raw).await,
            None => false,
        }
    }
}

enum ManagerPools<A: DialectAdapter> {
    Single(ResourcePool<ConnectionFactory<A>>),
    Replicated(ReplicationRouter<ConnectionFactory<A>>),
}

type VersionFuture = Shared<BoxFuture<'static, DbResult<String>>>;

struct VersionState {
    known: Option<String>,
    generation: u64,
    in_flight: Option<VersionFuture>,
}

struct ManagerInner<A: DialectAdapter> {
    options: ManagerOptions,
    connector: Arc<Connector<A>>,
    pools: ManagerPools<A>,
    query_generator: Arc<dyn QueryGenerator>,
    version: Mutex<VersionState>,
    closed: AtomicBool,
    /// Ctrl-C drain task. Uses std::sync::Mutex so Drop can abort it.
    shutdown_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the connection pools for one database (plus its replicas).
pub struct ConnectionManager<A: DialectAdapter> {
    inner: Arc<ManagerInner<A>>,
}

impl<A: DialectAdapter> Clone for ConnectionManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: DialectAdapter> ConnectionManager<A> {
    /// Create a manager with the default statements for the adapter's dialect and no hooks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(adapter: A, options: ManagerOptions) -> DbResult<Self> {
        let hooks: Arc<dyn ConnectionHooks<A::Connection>> = Arc::new(NoopHooks);
        let query_generator = Arc::new(DefaultQueryGenerator::new(adapter.dialect()));
        Self::with_collaborators(adapter, options, hooks, query_generator)
    }

    /// Create a manager with explicit hooks and statement generator.
    pub fn with_collaborators(
        adapter: A,
        options: ManagerOptions,
        hooks: Arc<dyn ConnectionHooks<A::Connection>>,
        query_generator: Arc<dyn QueryGenerator>,
    ) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;
        if adapter.dialect() != options.dialect() {
            return Err(DbError::invalid_input(format!(
                "Adapter dialect {} does not match configured dialect {}",
                adapter.dialect(),
                options.dialect()
            )));
        }

        let connector = Arc::new(Connector { adapter, hooks });
        let pools = if options.is_replicated() {
            let write = ConnectionFactory::new(Arc::clone(&connector), vec![options.write_target()]);
            let read = ConnectionFactory::new(Arc::clone(&connector), options.read_targets());
            ManagerPools::Replicated(ReplicationRouter::new(write, read, &options.pool)?)
        } else {
            let factory =
                ConnectionFactory::new(Arc::clone(&connector), vec![options.connection.clone()]);
            ManagerPools::Single(ResourcePool::new(factory, &options.pool, PoolRole::Primary)?)
        };

        let inner = Arc::new(ManagerInner {
            version: Mutex::new(VersionState {
                known: options.database_version.clone(),
                generation: 0,
                in_flight: None,
            }),
            options,
            connector,
            pools,
            query_generator,
            closed: AtomicBool::new(false),
            shutdown_task: Mutex::new(None),
        });

        if inner.options.drain_on_shutdown {
            let handle = ManagerInner::spawn_shutdown_drain(&inner);
            *lock(&inner.shutdown_task) = Some(handle);
        }

        info!(
            dialect = %inner.options.dialect(),
            replicated = inner.options.is_replicated(),
            read_replicas = inner.options.read_targets().len(),
            max = inner.options.pool.max_or_default(),
            "Connection manager created"
        );
        Ok(Self { inner })
    }

    /// Acquire a connection, routing reads to replicas when replication is enabled.
    ///
    /// The first call detects the server version unless one was configured.
    pub async fn get_connection(&self, options: AcquireOptions) -> DbResult<PooledConnection<A>> {
        if self.is_closed() {
            return Err(DbError::ManagerClosed);
        }
        self.ensure_version().await?;

        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
        match &self.inner.pools {
            ManagerPools::Single(pool) => pool.acquire(priority).await,
            ManagerPools::Replicated(router) => {
                router
                    .acquire(priority, options.query_type, options.use_master)
                    .await
            }
        }
    }

    /// Return a connection to its pool. Releasing twice is a no-op.
    pub async fn release_connection(&self, connection: &PooledConnection<A>) -> DbResult<()> {
        let result = match &self.inner.pools {
            ManagerPools::Single(pool) => pool.release(connection).await,
            ManagerPools::Replicated(router) => router.release(connection).await,
        };
        swallow_not_in_pool(result, connection, "release")
    }

    /// Close a connection and remove it from its pool. Unknown connections are ignored.
    pub async fn destroy_connection(&self, connection: &PooledConnection<A>) -> DbResult<()> {
        let result = match &self.inner.pools {
            ManagerPools::Single(pool) => pool.destroy(connection).await,
            ManagerPools::Replicated(router) => router.destroy(connection).await,
        };
        swallow_not_in_pool(result, connection, "destroy")
    }

    /// Open a connection outside the pool, running the connect hooks.
    pub async fn connect(&self, params: &ConnectionParams) -> DbResult<A::Connection> {
        self.inner.connector.connect(params).await
    }

    /// Close a connection opened with [`ConnectionManager::connect`].
    pub async fn disconnect(&self, connection: A::Connection) -> DbResult<()> {
        self.inner.connector.disconnect(connection).await
    }

    /// Run a statement on a managed connection.
    pub async fn execute(&self, connection: &PooledConnection<A>, sql: &str) -> DbResult<()> {
        let mut raw = connection.raw().await?;
        debug!(connection_id = connection.id(), sql = %sql, "Executing statement");
        self.inner
            .connector
            .adapter
            .execute(&mut raw, sql)
            .await
            .map_err(DbError::from_statement_failure)
    }

    /// Start a root transaction on a freshly acquired connection.
    pub async fn transaction(&self, options: TransactionOptions) -> DbResult<Transaction<A>> {
        let transaction = Transaction::new(self.clone(), options, None);
        transaction.prepare_environment().await?;
        Ok(transaction)
    }

    /// Run `work` in a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// A transaction already finished by `work` is left as is.
    pub async fn run_in_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Transaction<A>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let transaction = self.transaction(options).await?;

        match work(transaction.clone()).await {
            Ok(value) => {
                if transaction.finished().is_none() {
                    transaction.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if transaction.finished().is_none() {
                    if let Err(rollback_err) = transaction.rollback().await {
                        warn!(
                            transaction_id = %transaction.id(),
                            error = %rollback_err,
                            "Rollback after failed unit of work also failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Stop handing out connections and drain every pool. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection manager already closed");
            return;
        }

        if let Some(handle) = lock(&self.inner.shutdown_task).take() {
            handle.abort();
        }

        self.inner.drain_pools().await;
        info!(dialect = %self.dialect(), "Connection manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn dialect(&self) -> DatabaseType {
        self.inner.options.dialect()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn query_generator(&self) -> &dyn QueryGenerator {
        self.inner.query_generator.as_ref()
    }

    /// Server version, once known.
    pub fn database_version(&self) -> Option<String> {
        lock(&self.inner.version).known.clone()
    }

    /// One entry per pool: the single pool, or write then read.
    pub fn stats(&self) -> Vec<PoolStats> {
        match &self.inner.pools {
            ManagerPools::Single(pool) => vec![pool.stats()],
            ManagerPools::Replicated(router) => router.stats(),
        }
    }

    /// Destroy idle connections in every pool without closing the manager.
    pub async fn clear(&self) {
        match &self.inner.pools {
            ManagerPools::Single(pool) => pool.clear().await,
            ManagerPools::Replicated(router) => router.clear().await,
        }
    }

    async fn ensure_version(&self) -> DbResult<()> {
        let (detection, generation) = {
            let mut state = lock(&self.inner.version);
            if state.known.is_some() {
                return Ok(());
            }
            if let Some(detection) = state.in_flight.clone() {
                (detection, state.generation)
            } else {
                state.generation += 1;
                // Weak so an abandoned detection cannot keep the manager alive.
                let weak_inner = Arc::downgrade(&self.inner);
                let detection = async move {
                    match weak_inner.upgrade() {
                        Some(inner) => inner.detect_version().await,
                        None => Err(DbError::ManagerClosed),
                    }
                }
                .boxed()
                .shared();
                state.in_flight = Some(detection.clone());
                (detection, state.generation)
            }
        };

        let result = detection.await;

        let mut state = lock(&self.inner.version);
        if state.generation == generation {
            state.in_flight = None;
        }
        match result {
            Ok(version) => {
                if state.known.is_none() {
                    info!(version = %version, dialect = %self.dialect(), "Database version detected");
                    state.known = Some(version);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn swallow_not_in_pool<C>(
    result: DbResult<()>,
    connection: &Pooled<DbConnection<C>>,
    operation: &str,
) -> DbResult<()> {
    match result {
        Err(err) if err.is_not_in_pool() => {
            debug!(
                connection_id = connection.id(),
                operation, "Connection no longer in pool, ignoring"
            );
            Ok(())
        }
        other => other,
    }
}

impl<A: DialectAdapter> ManagerInner<A> {
    /// Probe the server on a dedicated connection outside the pool.
    async fn detect_version(self: Arc<Self>) -> DbResult<String> {
        let params = self.options.write_target();
        let mut connection = self.connector.connect(&params).await?;
        let probe = self.connector.adapter.server_version(&mut connection).await;

        if let Err(err) = self.connector.disconnect(connection).await {
            warn!(error = %err, "Failed to close version probe connection");
        }

        let raw = probe.map_err(DbError::from_statement_failure)?;
        Ok(coerce_version(&raw).unwrap_or_else(|| {
            warn!(version = %raw, "Unrecognized server version format");
            raw.trim().to_string()
        }))
    }

    async fn drain_pools(&self) {
        match &self.pools {
            ManagerPools::Single(pool) => pool.drain().await,
            ManagerPools::Replicated(router) => router.drain().await,
        }
    }

    fn spawn_shutdown_drain(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak_inner = Arc::downgrade(inner);
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Unable to listen for shutdown signal");
                return;
            }

            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            if inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            info!("Shutdown signal received, draining connection pools");
            inner.drain_pools().await;
        })
    }
}

impl<A: DialectAdapter> Drop for ManagerInner<A> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.shutdown_task).take() {
            handle.abort();
        }
    }
}

impl<A: DialectAdapter> std::fmt::Debug for ConnectionManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("dialect", &self.dialect())
            .field("replicated", &self.inner.options.is_replicated())
            .field("database_version", &self.database_version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reduce a server version banner to `major.minor.patch`.
///
/// Missing components are filled with zeros; `None` when the text holds no number.
///
/// ```
/// use db_pool_core::db::coerce_version;
///
/// assert_eq!(coerce_version("8.0.32-0ubuntu0.22.04.2").as_deref(), Some("8.0.32"));
/// assert_eq!(coerce_version("PostgreSQL 15.4 on x86_64").as_deref(), Some("15.4.0"));
/// ```
pub fn coerce_version(raw: &str) -> Option<String> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let mut parts: Vec<u64> = Vec::with_capacity(3);

    for piece in raw[start..].split('.') {
        let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
        let Ok(number) = digits.parse() else {
            break;
        };
        parts.push(number);
        if parts.len() == 3 || digits.len() != piece.len() {
            break;
        }
    }

    if parts.is_empty() {
        return None;
    }
    parts.resize(3, 0);
    Some(format!("{}.{}.{}", parts[0], parts[1], parts[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_version_formats() {
        assert_eq!(coerce_version("3.45.1").as_deref(), Some("3.45.1"));
        assert_eq!(coerce_version("10.6.12-MariaDB-log").as_deref(), Some("10.6.12"));
        assert_eq!(coerce_version("15.4 (Debian 15.4-1)").as_deref(), Some("15.4.0"));
        assert_eq!(coerce_version("v8").as_deref(), Some("8.0.0"));
        assert_eq!(coerce_version("1.2.3.4").as_deref(), Some("1.2.3"));
        assert_eq!(coerce_version("unknown"), None);
        assert_eq!(coerce_version("99999999999999999999999.1"), None);
    }

    #[test]
    fn test_connection_tag() {
        let conn = DbConnection::new((), "localhost:5432".to_string());
        assert_eq!(conn.transaction_id(), None);

        conn.tag("tx_1");
        assert_eq!(conn.transaction_id().as_deref(), Some("tx_1"));
        assert!(!conn.untag("tx_2"));
        assert!(conn.untag("tx_1"));
        assert!(!conn.untag("tx_1"));
    }

    #[tokio::test]
    async fn test_taken_connection_reports_closed() {
        let conn = DbConnection::new(7_u8, "db.sqlite".to_string());
        assert_eq!(*conn.raw().await.unwrap(), 7);

        assert_eq!(conn.take().await, Some(7));
        assert!(matches!(conn.raw().await, Err(DbError::ConnectionClosed)));
    }
}
