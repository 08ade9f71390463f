//! Scripted dialect adapter shared by the integration tests.
//!
//! Records every connect, disconnect and statement so tests can assert on the
//! exact sequence the manager and transactions produce.

#![allow(dead_code)]

use async_trait::async_trait;
use db_pool_core::config::{ConnectionParams, ManagerOptions, PoolOptions};
use db_pool_core::db::{AdapterError, ConnectionManager, DialectAdapter};
use db_pool_core::models::DatabaseType;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct MockConnection {
    pub id: usize,
    pub host: String,
    pub valid: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct MockState {
    next_id: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub version_probes: AtomicUsize,
    /// `(connection id, sql)` in execution order.
    pub statements: Mutex<Vec<(usize, String)>>,
    /// Host of every successful connect, in order.
    pub hosts: Mutex<Vec<String>>,
    /// Failures returned by the next connect attempts.
    pub connect_failures: Mutex<VecDeque<AdapterError>>,
    /// Failures returned by the next version probes.
    pub version_failures: Mutex<VecDeque<AdapterError>>,
    /// Statements that fail with SQLSTATE 40001.
    pub failing_statements: Mutex<HashSet<String>>,
    pub version: Mutex<String>,
    pub version_delay: Mutex<Duration>,
    /// Validity flags of every connection handed out.
    pub validity: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockState {
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn statements_on(&self, connection_id: usize) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == connection_id)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn fail_next_connect(&self, err: AdapterError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_statement(&self, sql: &str) {
        self.failing_statements.lock().unwrap().insert(sql.to_string());
    }

    pub fn invalidate_all(&self) {
        for flag in self.validity.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
pub struct MockAdapter {
    pub dialect: DatabaseType,
    pub state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new(dialect: DatabaseType) -> Self {
        let state = MockState::default();
        *state.version.lock().unwrap() = "8.0.32-log".to_string();
        Self {
            dialect,
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl DialectAdapter for MockAdapter {
    type Connection = MockConnection;

    fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<MockConnection, AdapterError> {
        if let Some(err) = self.state.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let host = params.host.clone().unwrap_or_default();
        self.state.hosts.lock().unwrap().push(host.clone());

        let valid = Arc::new(AtomicBool::new(true));
        self.state.validity.lock().unwrap().push(Arc::clone(&valid));
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            host,
            valid,
        })
    }

    async fn disconnect(&self, _connection: MockConnection) -> Result<(), AdapterError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, connection: &mut MockConnection) -> bool {
        connection.valid.load(Ordering::SeqCst)
    }

    async fn execute(&self, connection: &mut MockConnection, sql: &str) -> Result<(), AdapterError> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push((connection.id, sql.to_string()));
        if self.state.failing_statements.lock().unwrap().contains(sql) {
            return Err(AdapterError::new(format!("statement failed: {sql}")).with_code("40001"));
        }
        Ok(())
    }

    async fn server_version(&self, _connection: &mut MockConnection) -> Result<String, AdapterError> {
        self.state.version_probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.version_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.version_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.state.version.lock().unwrap().clone())
    }
}

pub fn params(dialect: DatabaseType, host: &str) -> ConnectionParams {
    ConnectionParams::new(dialect)
        .host(host)
        .database("app")
        .credentials("app", "secret")
}

pub fn pool_options(max: u32) -> PoolOptions {
    PoolOptions {
        max: Some(max),
        acquire_ms: Some(200),
        evict_ms: Some(0),
        ..PoolOptions::default()
    }
}

pub fn manager_options(dialect: DatabaseType) -> ManagerOptions {
    ManagerOptions::new(params(dialect, "primary"))
        .with_pool(pool_options(4))
        .with_drain_on_shutdown(false)
}

pub fn manager(
    dialect: DatabaseType,
) -> (ConnectionManager<MockAdapter>, Arc<MockState>) {
    manager_with(manager_options(dialect))
}

pub fn manager_with(options: ManagerOptions) -> (ConnectionManager<MockAdapter>, Arc<MockState>) {
    let adapter = MockAdapter::new(options.dialect());
    let state = Arc::clone(&adapter.state);
    let manager = ConnectionManager::new(adapter, options).expect("manager should build");
    (manager, state)
}
