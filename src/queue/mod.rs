//! Generic asynchronous job queue with pluggable backends.
//!
//! Producers push opaque, serializable tasks; a worker pool hands them to a
//! registered handler in batches and re-pushes the ones it reports as
//! failed.
//!
//! - **Queue**: facade producers push into, with a run/shutdown/terminate
//!   lifecycle
//! - **WorkerPool**: bounded buffer drained by baseline and boost workers
//! - **Backends**: in-memory channel, Redis list, disk write-ahead log, and
//!   a unique decorator tracking in-flight identities
//! - **QueueRegistry**: named queues built from one settings document
//!
//! # Architecture
//!
//! ```text
//!   producer ──push──▶ backend ──read loop──▶ WorkerPool buffer
//!                                                   │
//!                          ┌────────────────────────┼─────────────────┐
//!                          ▼                        ▼                 ▼
//!                     ┌─────────┐              ┌─────────┐       ┌─────────┐
//!                     │ Worker 1│              │ Worker N│       │  Boost  │
//!                     └────┬────┘              └────┬────┘       └────┬────┘
//!                          └──────── handler(batch) -> failed ────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_queue::queue::{handler_fn, Queue, QueueConfig};
//! use forge_queue::GracefulManager;
//! use std::sync::Arc;
//!
//! let handler = Arc::new(handler_fn(|tasks: Vec<String>| async move {
//!     for task in &tasks {
//!         tracing::info!(%task, "mirror sync");
//!     }
//!     Vec::new()
//! }));
//!
//! let graceful = GracefulManager::new();
//! let queue = Arc::new(Queue::new(QueueConfig::new("mirror").with_unique(true), handler).await?);
//! queue.run(&graceful).await?;
//!
//! queue.push("repo-42".to_string()).await?;
//! assert!(queue.has("repo-42").await?);
//!
//! graceful.terminate().await;
//! ```

pub mod boost;
pub mod config;
pub mod disk;
pub mod facade;
pub mod memory;
pub mod pool;
pub mod redis;
pub mod registry;
pub mod task;
pub mod unique;

pub use crate::error::QueueError;
pub use boost::{BoostController, BoostState};
pub use config::{BackendConfig, ConfigError, QueueConfig, QueueSettings};
pub use disk::{CompactStats, DiskQueue, DiskStore, PendingTask};
pub use facade::{Backend, Queue, QueueState};
pub use memory::ChannelQueue;
pub use pool::{PoolStats, WorkerKind, WorkerPool};
pub use self::redis::{RedisConnection, RedisHandle, RedisQueue};
pub use registry::QueueRegistry;
pub use task::{handler_fn, Envelope, FnHandler, Handler, Settlement, SettleHook, Task};
pub use unique::{IdentityIndex, IdentityRelease, MemoryIndex, RedisIndex, UniqueQueue};
