//! Read/write routing over two resource pools.
//!
//! Writes (and reads that insist on the primary) go to the write pool; plain
//! `SELECT`s go to the read pool, whose factory spreads creations across the
//! replicas. Every handle remembers its origin pool so release and destroy go
//! back to the right place.

use crate::config::PoolOptions;
use crate::db::resource_pool::{PoolRole, PoolStats, Pooled, ResourceFactory, ResourcePool};
use crate::error::{DbError, DbResult};
use crate::models::QueryType;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Round-robin selector over a fixed list.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    next: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next: AtomicUsize::new(0),
        }
    }

    /// Next item in rotation, `None` when the list is empty.
    pub fn pick(&self) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.items.len();
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A write pool and a read pool behind one acquire/release surface.
pub struct ReplicationRouter<F: ResourceFactory> {
    write: ResourcePool<F>,
    read: ResourcePool<F>,
}

impl<F: ResourceFactory> ReplicationRouter<F> {
    /// Build both pools with the same limits.
    pub fn new(write_factory: F, read_factory: F, options: &PoolOptions) -> DbResult<Self> {
        Ok(Self {
            write: ResourcePool::new(write_factory, options, PoolRole::Write)?,
            read: ResourcePool::new(read_factory, options, PoolRole::Read)?,
        })
    }

    /// Pool a request of this kind is served from.
    pub fn route(query_type: QueryType, use_master: bool) -> PoolRole {
        if query_type.is_select() && !use_master {
            PoolRole::Read
        } else {
            PoolRole::Write
        }
    }

    pub async fn acquire(
        &self,
        priority: u32,
        query_type: QueryType,
        use_master: bool,
    ) -> DbResult<Pooled<F::Resource>> {
        let role = Self::route(query_type, use_master);
        debug!(pool = %role, ?query_type, use_master, "Routing acquire");
        match role {
            PoolRole::Read => self.read.acquire(priority).await,
            _ => self.write.acquire(priority).await,
        }
    }

    pub async fn release(&self, resource: &Pooled<F::Resource>) -> DbResult<()> {
        self.origin(resource)?.release(resource).await
    }

    pub async fn destroy(&self, resource: &Pooled<F::Resource>) -> DbResult<()> {
        self.origin(resource)?.destroy(resource).await
    }

    /// Drain both pools concurrently.
    pub async fn drain(&self) {
        tokio::join!(self.write.drain(), self.read.drain());
    }

    /// Clear idle resources in both pools concurrently.
    pub async fn clear(&self) {
        tokio::join!(self.write.clear(), self.read.clear());
    }

    pub fn write_pool(&self) -> &ResourcePool<F> {
        &self.write
    }

    pub fn read_pool(&self) -> &ResourcePool<F> {
        &self.read
    }

    /// Stats for the write pool followed by the read pool.
    pub fn stats(&self) -> Vec<PoolStats> {
        vec![self.write.stats(), self.read.stats()]
    }

    fn origin(&self, resource: &Pooled<F::Resource>) -> DbResult<&ResourcePool<F>> {
        match resource.role() {
            PoolRole::Write => Ok(&self.write),
            PoolRole::Read => Ok(&self.read),
            PoolRole::Primary => Err(DbError::ResourceNotInPool),
        }
    }
}

impl<F: ResourceFactory> std::fmt::Debug for ReplicationRouter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationRouter")
            .field("write", &self.write)
            .field("read", &self.read)
            .finish()
    }
}
