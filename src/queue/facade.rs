//! Queue facade and lifecycle state machine.
//!
//! A [`Queue`] binds a backend, its worker pool and a handler under a name
//! and exposes the same lifecycle whatever the backend:
//!
//! ```text
//! Constructed ──run──▶ Running ──shutdown──▶ ShuttingDown ──terminate──▶ Terminated
//! ```
//!
//! `run` registers `shutdown` and `terminate` with a [`GracefulManager`],
//! which invokes them in that order during process exit. A terminated queue
//! cannot be restarted.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::graceful::GracefulManager;

use super::config::{BackendConfig, QueueConfig};
use super::disk::DiskQueue;
use super::memory::ChannelQueue;
use super::pool::{lock, PoolStats};
use super::redis::{RedisHandle, RedisQueue};
use super::task::{Handler, SettleHook, Task};
use super::unique::{IdentityRelease, MemoryIndex, RedisIndex, UniqueQueue};

/// Storage/transport behind a queue.
#[async_trait]
pub trait Backend<T: Task>: Send + Sync + 'static {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Enqueues a task.
    async fn push(&self, task: T) -> Result<(), QueueError>;

    /// Reports whether a task with this identity is in flight.
    async fn has(&self, identity: &str) -> Result<bool, QueueError>;

    /// Starts workers and read loops.
    async fn run(&self) -> Result<(), QueueError>;

    /// Stops dequeuing and waits for in-flight batches.
    async fn shutdown(&self);

    /// Releases connections and file handles.
    async fn terminate(&self);

    /// Worker pool statistics.
    fn stats(&self) -> PoolStats;
}

/// Lifecycle state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Constructed,
    Running,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueState::Constructed => "constructed",
            QueueState::Running => "running",
            QueueState::ShuttingDown => "shutting_down",
            QueueState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Public queue object producers push into.
pub struct Queue<T: Task> {
    config: QueueConfig,
    backend: Box<dyn Backend<T>>,
    state: Mutex<QueueState>,
    // Serializes shutdown/terminate so terminate never overtakes shutdown.
    transition: tokio::sync::Mutex<()>,
}

impl<T: Task> Queue<T> {
    /// Builds a queue and its backend from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a construction error if the configuration is invalid, the
    /// remote broker cannot be reached, or the on-disk store cannot be
    /// opened.
    pub async fn new(config: QueueConfig, handler: Arc<dyn Handler<T>>) -> Result<Self, QueueError> {
        config.validate()?;
        let backend = build_backend(&config, handler).await?;

        info!(
            queue = %config.name,
            backend = backend.kind(),
            unique = config.unique,
            "Queue created"
        );

        Ok(Self::with_backend(config, backend))
    }

    /// Wraps an already constructed backend.
    pub fn with_backend(config: QueueConfig, backend: Box<dyn Backend<T>>) -> Self {
        Self {
            config,
            backend,
            state: Mutex::new(QueueState::Constructed),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        *lock(&self.state)
    }

    /// Worker pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.backend.stats()
    }

    /// Enqueues a task.
    ///
    /// Blocks while the in-memory buffer is full. For unique queues, pushing
    /// an identity that is already in flight is a successful no-op.
    ///
    /// # Errors
    ///
    /// Fails if the task cannot be serialized, the backend is unreachable,
    /// or the queue has been terminated.
    pub async fn push(&self, task: T) -> Result<(), QueueError> {
        if self.state() == QueueState::Terminated {
            return Err(QueueError::Terminated(self.config.name.clone()));
        }
        self.backend.push(task).await
    }

    /// Reports whether a task with `identity` is pushed but not yet handled.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotUnique`] for queues without identity tracking.
    pub async fn has(&self, identity: &str) -> Result<bool, QueueError> {
        self.backend.has(identity).await
    }

    /// Starts the queue and registers its shutdown and terminate callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyRunning`] unless the queue is freshly
    /// constructed.
    pub async fn run(self: &Arc<Self>, graceful: &GracefulManager) -> Result<(), QueueError> {
        self.start().await?;

        let queue = Arc::clone(self);
        graceful.run_at_shutdown(self.name(), move || async move { queue.shutdown().await });
        let queue = Arc::clone(self);
        graceful.run_at_terminate(self.name(), move || async move { queue.terminate().await });
        Ok(())
    }

    /// Starts the queue without registering lifecycle callbacks.
    pub async fn start(&self) -> Result<(), QueueError> {
        {
            let mut state = lock(&self.state);
            if *state != QueueState::Constructed {
                return Err(QueueError::AlreadyRunning(self.config.name.clone()));
            }
            *state = QueueState::Running;
        }

        self.backend.run().await?;
        info!(queue = %self.config.name, "Queue running");
        Ok(())
    }

    /// Stops dequeuing; in-flight batches are allowed to finish.
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        {
            let mut state = lock(&self.state);
            match *state {
                QueueState::ShuttingDown | QueueState::Terminated => return,
                _ => *state = QueueState::ShuttingDown,
            }
        }

        info!(queue = %self.config.name, "Queue shutting down");
        self.backend.shutdown().await;
        debug!(queue = %self.config.name, "Queue shutdown complete");
    }

    /// Releases backend resources. Runs `shutdown` first if needed.
    pub async fn terminate(&self) {
        self.shutdown().await;

        let _transition = self.transition.lock().await;
        {
            let mut state = lock(&self.state);
            if *state == QueueState::Terminated {
                return;
            }
            *state = QueueState::Terminated;
        }

        self.backend.terminate().await;
        info!(queue = %self.config.name, "Queue terminated");
    }
}

/// Builds the backend described by `config`, wrapping it for uniqueness.
async fn build_backend<T: Task>(
    config: &QueueConfig,
    handler: Arc<dyn Handler<T>>,
) -> Result<Box<dyn Backend<T>>, QueueError> {
    match &config.backend {
        BackendConfig::Memory if config.unique => {
            let index = Arc::new(MemoryIndex::new());
            let hook: Arc<dyn SettleHook<T>> = Arc::new(IdentityRelease::new(
                &config.name,
                index.clone(),
            ));
            let inner = ChannelQueue::new(config, handler, Some(hook));
            Ok(Box::new(UniqueQueue::new(&config.name, index, inner)))
        }
        BackendConfig::Memory => Ok(Box::new(ChannelQueue::new(config, handler, None))),
        BackendConfig::Redis {
            addresses,
            password,
            db_index,
        } => {
            let handle = Arc::new(
                RedisHandle::connect(&config.name, addresses, password.as_deref(), *db_index)
                    .await?,
            );
            if config.unique {
                let index = Arc::new(RedisIndex::new(&config.name, Arc::clone(&handle)));
                let hook: Arc<dyn SettleHook<T>> = Arc::new(IdentityRelease::new(
                    &config.name,
                    index.clone(),
                ));
                let inner = RedisQueue::new(config, handle, handler, Some(hook));
                Ok(Box::new(UniqueQueue::new(&config.name, index, inner)))
            } else {
                Ok(Box::new(RedisQueue::new(config, handle, handler, None)))
            }
        }
        BackendConfig::Disk {
            data_dir,
            sync_writes,
        } => Ok(Box::new(
            DiskQueue::open(config, data_dir, *sync_writes, handler).await?,
        )),
    }
}
