//! Identity tracking for unique queues.
//!
//! A unique queue holds at most one in-flight task per identity. The
//! identity is claimed atomically on push and released by the worker pool's
//! settle hook once the task is handled or discarded, so a later push of the
//! same identity is accepted again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::metrics::MetricsCollector;

use super::facade::Backend;
use super::pool::{lock, PoolStats};
use super::redis::RedisHandle;
use super::task::{Envelope, SettleHook, Settlement, Task};

/// Set of in-flight identities.
#[async_trait]
pub trait IdentityIndex: Send + Sync + 'static {
    /// Claims `identity`; returns false if it was already claimed.
    async fn add(&self, identity: &str) -> Result<bool, QueueError>;

    /// Releases `identity`.
    async fn remove(&self, identity: &str) -> Result<(), QueueError>;

    /// Reports whether `identity` is claimed.
    async fn contains(&self, identity: &str) -> Result<bool, QueueError>;
}

/// Process-local identity set.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    identities: Mutex<HashSet<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of claimed identities.
    pub fn len(&self) -> usize {
        lock(&self.identities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdentityIndex for MemoryIndex {
    async fn add(&self, identity: &str) -> Result<bool, QueueError> {
        Ok(lock(&self.identities).insert(identity.to_string()))
    }

    async fn remove(&self, identity: &str) -> Result<(), QueueError> {
        lock(&self.identities).remove(identity);
        Ok(())
    }

    async fn contains(&self, identity: &str) -> Result<bool, QueueError> {
        Ok(lock(&self.identities).contains(identity))
    }
}

/// Key of the Redis set holding a unique queue's identities.
pub(crate) fn unique_set_key(name: &str) -> String {
    format!("{}_unique", name)
}

/// Identity set stored in the Redis set `{queue_name}_unique`.
pub struct RedisIndex {
    set_key: String,
    handle: Arc<RedisHandle>,
}

impl RedisIndex {
    pub fn new(name: &str, handle: Arc<RedisHandle>) -> Self {
        Self {
            set_key: unique_set_key(name),
            handle,
        }
    }

    /// Name of the backing set.
    pub fn set_key(&self) -> &str {
        &self.set_key
    }
}

#[async_trait]
impl IdentityIndex for RedisIndex {
    async fn add(&self, identity: &str) -> Result<bool, QueueError> {
        let added: i64 = self
            .handle
            .query(redis::cmd("SADD").arg(&self.set_key).arg(identity))
            .await?;
        Ok(added == 1)
    }

    async fn remove(&self, identity: &str) -> Result<(), QueueError> {
        let _: i64 = self
            .handle
            .query(redis::cmd("SREM").arg(&self.set_key).arg(identity))
            .await?;
        Ok(())
    }

    async fn contains(&self, identity: &str) -> Result<bool, QueueError> {
        self.handle
            .query(redis::cmd("SISMEMBER").arg(&self.set_key).arg(identity))
            .await
    }
}

/// Settle hook releasing a task's identity when it leaves the queue.
pub struct IdentityRelease<I> {
    name: String,
    index: Arc<I>,
}

impl<I: IdentityIndex> IdentityRelease<I> {
    pub fn new(name: &str, index: Arc<I>) -> Self {
        Self {
            name: name.to_string(),
            index,
        }
    }
}

#[async_trait]
impl<T: Task, I: IdentityIndex> SettleHook<T> for IdentityRelease<I> {
    async fn settle(&self, envelope: &Envelope<T>, settlement: Settlement) {
        let Some(identity) = envelope.identity() else {
            return;
        };
        if let Err(e) = self.index.remove(&identity).await {
            warn!(
                queue = %self.name,
                identity = %identity,
                settlement = %settlement,
                error = %e,
                "Failed to release task identity"
            );
        }
    }
}

/// Backend wrapper rejecting pushes whose identity is already in flight.
pub struct UniqueQueue<B> {
    name: String,
    index: Arc<dyn IdentityIndex>,
    inner: B,
    metrics: MetricsCollector,
}

impl<B> UniqueQueue<B> {
    pub fn new(name: &str, index: Arc<dyn IdentityIndex>, inner: B) -> Self {
        Self {
            name: name.to_string(),
            index,
            inner,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl<T: Task, B: Backend<T>> Backend<T> for UniqueQueue<B> {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn push(&self, task: T) -> Result<(), QueueError> {
        let Some(identity) = task.identity() else {
            return self.inner.push(task).await;
        };

        if !self.index.add(&identity).await? {
            debug!(queue = %self.name, identity = %identity, "Task already in flight, skipping push");
            self.metrics.record_duplicate(&self.name);
            return Ok(());
        }

        if let Err(e) = self.inner.push(task).await {
            if let Err(release) = self.index.remove(&identity).await {
                warn!(queue = %self.name, identity = %identity, error = %release, "Failed to release identity after failed push");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn has(&self, identity: &str) -> Result<bool, QueueError> {
        self.index.contains(identity).await
    }

    async fn run(&self) -> Result<(), QueueError> {
        self.inner.run().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    async fn terminate(&self) {
        self.inner.terminate().await
    }

    fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}
