//! Generic bounded pool of opaque resources.
//!
//! # Design Decisions
//!
//! - **`std::sync::Mutex` for pool state**: every critical section is short and never
//!   spans an `.await`, so a synchronous lock is enough and usable from `Drop`
//! - **Waiters keyed by `(priority, sequence)`**: a `BTreeMap` gives priority classes
//!   with FIFO order inside each class; lower priority values are served first
//! - **Creations run in spawned tasks**: the created resource goes to the first live
//!   waiter, so an acquirer that times out or is cancelled never leaks a connection
//! - **Weak evictor**: the idle sweep holds a `Weak` reference and exits when the
//!   pool is dropped or drained
//!
//! # Bookkeeping
//!
//! Every live resource is in exactly one of: the idle deque, the outstanding set, or
//! (while being created) the pending-create counter. Their sum never exceeds `max`.

use crate::config::PoolOptions;
use crate::db::lock;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Priority class used when the caller does not pass one.
pub const DEFAULT_PRIORITY: u32 = 0;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Which pool a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    /// The single pool of a non-replicated manager.
    Primary,
    Write,
    Read,
}

impl std::fmt::Display for PoolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Creates, destroys and validates the resources held by a [`ResourcePool`].
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(&self) -> DbResult<Self::Resource>;

    /// Release the underlying resource. Failures are the factory's to log.
    async fn destroy(&self, resource: &Self::Resource);

    /// Borrow-time health check for reused resources.
    async fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Handle to a pooled resource.
///
/// Handles are cheap clones sharing one resource; identity is [`Pooled::id`].
pub struct Pooled<R> {
    inner: Arc<PooledInner<R>>,
}

struct PooledInner<R> {
    id: u64,
    role: PoolRole,
    created_at: Instant,
    uses: AtomicU64,
    resource: R,
}

impl<R> Pooled<R> {
    fn new(resource: R, role: PoolRole) -> Self {
        Self {
            inner: Arc::new(PooledInner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                role,
                created_at: Instant::now(),
                uses: AtomicU64::new(0),
                resource,
            }),
        }
    }

    /// Process-unique id of this resource.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Pool the resource was created by.
    pub fn role(&self) -> PoolRole {
        self.inner.role
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Number of times the resource has been handed out.
    pub fn use_count(&self) -> u64 {
        self.inner.uses.load(Ordering::Relaxed)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<R> Clone for Pooled<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner.resource
    }
}

impl<R> std::fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("uses", &self.use_count())
            .finish()
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub role: PoolRole,
    /// Idle plus outstanding resources.
    pub size: usize,
    pub available: usize,
    pub using: usize,
    pub waiting: usize,
    pub pending_creates: usize,
    pub max: u32,
    pub min: u32,
    pub draining: bool,
    pub created: u64,
    pub destroyed: u64,
    pub acquired: u64,
    pub released: u64,
    pub timed_out: u64,
}

struct Handoff<R> {
    resource: Pooled<R>,
    /// Freshly created resources skip borrow-time validation.
    fresh: bool,
}

type Waiter<R> = oneshot::Sender<DbResult<Handoff<R>>>;

struct IdleEntry<R> {
    resource: Pooled<R>,
    since: Instant,
}

struct PoolState<R> {
    /// Released resources are pushed to the back and reused from the back.
    /// The front holds the longest-idle entries.
    idle: VecDeque<IdleEntry<R>>,
    outstanding: HashSet<u64>,
    pending_creates: usize,
    waiters: BTreeMap<(u32, u64), Waiter<R>>,
    next_seq: u64,
    draining: bool,
}

impl<R> PoolState<R> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            outstanding: HashSet::new(),
            pending_creates: 0,
            waiters: BTreeMap::new(),
            next_seq: 0,
            draining: false,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.outstanding.len() + self.pending_creates
    }

    /// Give `resource` to the first live waiter. Returns it when nobody is waiting.
    fn hand_off(&mut self, resource: Pooled<R>, fresh: bool) -> Option<Pooled<R>> {
        let mut handoff = Handoff { resource, fresh };
        while let Some((_, waiter)) = self.waiters.pop_first() {
            let id = handoff.resource.id();
            self.outstanding.insert(id);
            match waiter.send(Ok(handoff)) {
                Ok(()) => return None,
                Err(returned) => {
                    self.outstanding.remove(&id);
                    match returned {
                        Ok(back) => handoff = back,
                        // Only resources are sent here.
                        Err(_) => return None,
                    }
                }
            }
        }
        Some(handoff.resource)
    }
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timed_out: AtomicU64,
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    role: PoolRole,
    options: PoolOptions,
    state: Mutex<PoolState<F::Resource>>,
    counters: PoolCounters,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

/// Queued acquisition. Dropping it unsettled (the acquirer was cancelled) returns
/// any resource already sent to it.
struct PendingHandoff<'a, F: ResourceFactory> {
    pool: &'a Arc<PoolInner<F>>,
    key: (u32, u64),
    rx: oneshot::Receiver<DbResult<Handoff<F::Resource>>>,
    settled: bool,
}

impl<F: ResourceFactory> Drop for PendingHandoff<'_, F> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.pool.lock_state().waiters.remove(&self.key);
        self.rx.close();
        if let Ok(Ok(handoff)) = self.rx.try_recv() {
            debug!(
                pool = %self.pool.role,
                resource_id = handoff.resource.id(),
                "Acquirer dropped after hand-off, returning resource"
            );
            self.pool.abandon(handoff.resource);
        }
    }
}

enum Next<R> {
    Idle(Pooled<R>),
    Wait((u32, u64), oneshot::Receiver<DbResult<Handoff<R>>>),
}

/// Bounded pool with priority waiters, borrow-time validation and idle eviction.
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create a pool. Must be called inside a Tokio runtime when eviction is enabled.
    pub fn new(factory: F, options: &PoolOptions, role: PoolRole) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;

        let inner = Arc::new(PoolInner {
            factory,
            role,
            options: options.clone(),
            state: Mutex::new(PoolState::new()),
            counters: PoolCounters::default(),
            evictor: Mutex::new(None),
        });

        if let Some(interval) = options.evict_interval_or_default() {
            let weak = Arc::downgrade(&inner);
            let handle = tokio::spawn(PoolInner::run_evictor(weak, interval));
            *lock(&inner.evictor) = Some(handle);
        }

        debug!(
            pool = %role,
            max = options.max_or_default(),
            min = options.min_or_default(),
            "Resource pool created"
        );
        Ok(Self { inner })
    }

    pub fn role(&self) -> PoolRole {
        self.inner.role
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Check out a resource, waiting up to `pool.acquire` for one to free up.
    pub async fn acquire(&self, priority: u32) -> DbResult<Pooled<F::Resource>> {
        self.inner.acquire(priority).await
    }

    /// Return a resource. Unknown or already returned resources yield
    /// [`DbError::ResourceNotInPool`].
    pub async fn release(&self, resource: &Pooled<F::Resource>) -> DbResult<()> {
        self.inner.release(resource).await
    }

    /// Permanently remove a checked-out resource.
    pub async fn destroy(&self, resource: &Pooled<F::Resource>) -> DbResult<()> {
        self.inner.destroy(resource).await
    }

    /// Stop serving acquisitions, fail every waiter and destroy idle resources.
    /// Outstanding resources are destroyed as they come back.
    pub async fn drain(&self) {
        self.inner.drain().await
    }

    /// Destroy every idle resource while keeping the pool open.
    pub async fn clear(&self) {
        self.inner.clear().await
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock_state().draining
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

impl<F: ResourceFactory> std::fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ResourcePool")
            .field("role", &stats.role)
            .field("size", &stats.size)
            .field("available", &stats.available)
            .field("waiting", &stats.waiting)
            .field("draining", &stats.draining)
            .finish()
    }
}

impl<F: ResourceFactory> PoolInner<F> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        lock(&self.state)
    }

    fn max(&self) -> usize {
        self.options.max_or_default() as usize
    }

    async fn acquire(self: &Arc<Self>, priority: u32) -> DbResult<Pooled<F::Resource>> {
        let timeout = self.options.acquire_timeout_or_default();
        let deadline = Instant::now() + timeout;

        loop {
            let next = {
                let mut state = self.lock_state();
                if state.draining {
                    return Err(DbError::PoolClosed);
                }
                if let Some(entry) = state.idle.pop_back() {
                    state.outstanding.insert(entry.resource.id());
                    Next::Idle(entry.resource)
                } else {
                    let key = (priority, state.next_seq);
                    state.next_seq += 1;
                    let (tx, rx) = oneshot::channel();
                    state.waiters.insert(key, tx);
                    self.spawn_creates(&mut state);
                    Next::Wait(key, rx)
                }
            };

            let handoff = match next {
                Next::Idle(resource) => Handoff {
                    resource,
                    fresh: false,
                },
                Next::Wait(key, rx) => self.wait_for(key, rx, deadline, timeout).await?,
            };

            if let Some(resource) = self.check_out(handoff).await {
                return Ok(resource);
            }
        }
    }

    async fn wait_for(
        self: &Arc<Self>,
        key: (u32, u64),
        rx: oneshot::Receiver<DbResult<Handoff<F::Resource>>>,
        deadline: Instant,
        timeout: Duration,
    ) -> DbResult<Handoff<F::Resource>> {
        let mut pending = PendingHandoff {
            pool: self,
            key,
            rx,
            settled: false,
        };

        match tokio::time::timeout_at(deadline, &mut pending.rx).await {
            Ok(Ok(delivery)) => {
                pending.settled = true;
                delivery
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(DbError::PoolClosed)
            }
            Err(_) => {
                let still_queued = self.lock_state().waiters.remove(&key).is_some();
                if !still_queued {
                    // A hand-off won the race against the timer.
                    if let Ok(delivery) = pending.rx.try_recv() {
                        pending.settled = true;
                        return delivery;
                    }
                }
                pending.settled = true;
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.role, timeout_ms = timeout.as_millis() as u64, "Acquire timed out");
                Err(DbError::acquire_timeout(self.role.to_string(), timeout))
            }
        }
    }

    /// Validate a reused resource and mark it in use. `None` means it was destroyed.
    async fn check_out(
        self: &Arc<Self>,
        handoff: Handoff<F::Resource>,
    ) -> Option<Pooled<F::Resource>> {
        let Handoff { resource, fresh } = handoff;

        if !fresh && self.options.handle_disconnects_or_default() {
            let guard = CheckoutGuard {
                pool: self,
                resource: Some(resource.clone()),
            };
            let valid = self.factory.validate(&resource).await;
            guard.disarm();

            if !valid {
                warn!(
                    pool = %self.role,
                    resource_id = resource.id(),
                    "Resource failed validation, destroying"
                );
                {
                    let mut state = self.lock_state();
                    state.outstanding.remove(&resource.id());
                    self.spawn_creates(&mut state);
                }
                self.destroy_resource(resource).await;
                return None;
            }
        }

        resource.inner.uses.fetch_add(1, Ordering::Relaxed);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.role, resource_id = resource.id(), "Resource acquired");
        Some(resource)
    }

    async fn release(self: &Arc<Self>, resource: &Pooled<F::Resource>) -> DbResult<()> {
        let leftover = {
            let mut state = self.lock_state();
            if !state.outstanding.remove(&resource.id()) {
                return Err(DbError::ResourceNotInPool);
            }
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            self.check_in(&mut state, resource.clone())
        };

        debug!(pool = %self.role, resource_id = resource.id(), "Resource released");
        if let Some(resource) = leftover {
            self.destroy_resource(resource).await;
        }
        Ok(())
    }

    async fn destroy(self: &Arc<Self>, resource: &Pooled<F::Resource>) -> DbResult<()> {
        {
            let mut state = self.lock_state();
            if !state.outstanding.remove(&resource.id()) {
                return Err(DbError::ResourceNotInPool);
            }
            self.spawn_creates(&mut state);
        }
        self.destroy_resource(resource.clone()).await;
        Ok(())
    }

    /// Route a resource that just left the outstanding set. Returns it when it must
    /// be destroyed instead.
    fn check_in(
        self: &Arc<Self>,
        state: &mut PoolState<F::Resource>,
        resource: Pooled<F::Resource>,
    ) -> Option<Pooled<F::Resource>> {
        let worn_out = self
            .options
            .max_uses
            .is_some_and(|max_uses| resource.use_count() >= max_uses);

        if state.draining || worn_out {
            self.spawn_creates(state);
            return Some(resource);
        }

        if let Some(resource) = state.hand_off(resource, false) {
            state.idle.push_back(IdleEntry {
                resource,
                since: Instant::now(),
            });
        }
        None
    }

    /// Return a resource whose checkout was abandoned before reaching the caller.
    fn abandon(self: &Arc<Self>, resource: Pooled<F::Resource>) {
        let leftover = {
            let mut state = self.lock_state();
            if !state.outstanding.remove(&resource.id()) {
                return;
            }
            self.check_in(&mut state, resource)
        };

        if let Some(resource) = leftover {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.destroy_resource(resource).await });
            }
        }
    }

    /// Start creations until every live waiter has one in flight or `max` is reached.
    fn spawn_creates(self: &Arc<Self>, state: &mut PoolState<F::Resource>) {
        state.waiters.retain(|_, waiter| !waiter.is_closed());

        while !state.draining
            && state.waiters.len() > state.pending_creates
            && state.total() < self.max()
        {
            state.pending_creates += 1;
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.run_create().await });
        }
    }

    async fn run_create(self: Arc<Self>) {
        let result = self.factory.create().await;

        let leftover = {
            let mut state = self.lock_state();
            state.pending_creates = state.pending_creates.saturating_sub(1);

            match result {
                Ok(raw) => {
                    let resource = Pooled::new(raw, self.role);
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.role, resource_id = resource.id(), "Resource created");

                    if state.draining {
                        Some(resource)
                    } else {
                        if let Some(resource) = state.hand_off(resource, true) {
                            state.idle.push_back(IdleEntry {
                                resource,
                                since: Instant::now(),
                            });
                        }
                        None
                    }
                }
                Err(err) => {
                    warn!(pool = %self.role, error = %err, "Resource creation failed");
                    while let Some((_, waiter)) = state.waiters.pop_first() {
                        if waiter.send(Err(err.clone())).is_ok() {
                            break;
                        }
                    }
                    self.spawn_creates(&mut state);
                    None
                }
            }
        };

        if let Some(resource) = leftover {
            self.destroy_resource(resource).await;
        }
    }

    async fn destroy_resource(&self, resource: Pooled<F::Resource>) {
        self.factory.destroy(&resource).await;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.role, resource_id = resource.id(), "Resource destroyed");
    }

    async fn drain(&self) {
        if let Some(handle) = lock(&self.evictor).take() {
            handle.abort();
        }

        let (idle, waiters) = {
            let mut state = self.lock_state();
            state.draining = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        for (_, waiter) in waiters {
            let _ = waiter.send(Err(DbError::PoolClosed));
        }

        info!(pool = %self.role, idle = idle.len(), "Draining pool");
        join_all(
            idle.into_iter()
                .map(|entry| self.destroy_resource(entry.resource)),
        )
        .await;
    }

    async fn clear(&self) {
        let idle = std::mem::take(&mut self.lock_state().idle);
        if idle.is_empty() {
            return;
        }
        debug!(pool = %self.role, idle = idle.len(), "Clearing idle resources");
        join_all(
            idle.into_iter()
                .map(|entry| self.destroy_resource(entry.resource)),
        )
        .await;
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            role: self.role,
            size: state.idle.len() + state.outstanding.len(),
            available: state.idle.len(),
            using: state.outstanding.len(),
            waiting: state.waiters.values().filter(|w| !w.is_closed()).count(),
            pending_creates: state.pending_creates,
            max: self.options.max_or_default(),
            min: self.options.min_or_default(),
            draining: state.draining,
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Periodically destroy resources idle longer than `pool.idle`, keeping `pool.min`.
    async fn run_evictor(weak_pool: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Pool dropped, evictor exiting");
                return;
            };

            let expired = {
                let mut state = pool.lock_state();
                if state.draining {
                    return;
                }

                let idle_timeout = pool.options.idle_timeout_or_default();
                let min = pool.options.min_or_default() as usize;
                let now = Instant::now();
                let mut expired = Vec::new();

                while state.total() > min {
                    let Some(entry) = state.idle.front() else {
                        break;
                    };
                    if now.saturating_duration_since(entry.since) < idle_timeout {
                        break;
                    }
                    if let Some(entry) = state.idle.pop_front() {
                        expired.push(entry.resource);
                    }
                }
                expired
            };

            if !expired.is_empty() {
                debug!(pool = %pool.role, evicted = expired.len(), "Evicting idle resources");
            }
            for resource in expired {
                pool.destroy_resource(resource).await;
            }

            // Drop strong reference before sleeping to allow pool deallocation
            drop(pool);
        }
    }
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.evictor).take() {
            handle.abort();
        }
    }
}

/// Puts a resource back if the acquiring future is dropped during validation.
struct CheckoutGuard<'a, F: ResourceFactory> {
    pool: &'a Arc<PoolInner<F>>,
    resource: Option<Pooled<F::Resource>>,
}

impl<F: ResourceFactory> CheckoutGuard<'_, F> {
    fn disarm(mut self) {
        self.resource = None;
    }
}

impl<F: ResourceFactory> Drop for CheckoutGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.abandon(resource);
        }
    }
}
