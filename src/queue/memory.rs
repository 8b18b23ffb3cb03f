//! In-memory channel backend.
//!
//! The default backend: a fixed-capacity FIFO owned by the worker pool.
//! `push` blocks while the buffer is full. Nothing is persisted, so a crash
//! loses whatever is buffered; an orderly terminate hands the remaining
//! buffer to the handler once before dropping it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::QueueError;

use super::config::QueueConfig;
use super::facade::Backend;
use super::pool::{PoolStats, WorkerPool};
use super::task::{Envelope, Handler, SettleHook, Task};

/// Queue backed only by the worker pool's buffer.
pub struct ChannelQueue<T: Task> {
    name: String,
    pool: Arc<WorkerPool<T>>,
}

impl<T: Task> ChannelQueue<T> {
    /// Creates a channel queue.
    pub fn new(
        config: &QueueConfig,
        handler: Arc<dyn Handler<T>>,
        settle_hook: Option<Arc<dyn SettleHook<T>>>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            pool: WorkerPool::new(config, handler, settle_hook),
        }
    }
}

#[async_trait]
impl<T: Task> Backend<T> for ChannelQueue<T> {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, task: T) -> Result<(), QueueError> {
        self.pool.push(Envelope::new(task)).await;
        Ok(())
    }

    async fn has(&self, _identity: &str) -> Result<bool, QueueError> {
        Err(QueueError::NotUnique(self.name.clone()))
    }

    async fn run(&self) -> Result<(), QueueError> {
        self.pool.start();
        Ok(())
    }

    async fn shutdown(&self) {
        self.pool.cancel();
        self.pool.wait().await;
        info!(
            queue = %self.name,
            buffered = self.pool.len(),
            "Channel queue workers stopped"
        );
    }

    async fn terminate(&self) {
        self.pool.flush().await;
        let dropped = self.pool.drain_buffered().await;
        if !dropped.is_empty() {
            warn!(
                queue = %self.name,
                dropped = dropped.len(),
                "Dropping tasks still buffered at terminate"
            );
        }
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
