//! forge-queue: asynchronous job queues with pluggable backends.
//!
//! This library decouples event producers from the workers that process
//! them: bounded in-memory, Redis and disk-persisted queues, in-flight
//! deduplication, dynamic worker boosting and two-phase graceful shutdown.

pub mod cli;
pub mod error;
pub mod graceful;
pub mod metrics;
pub mod push;
pub mod queue;

pub use error::QueueError;
pub use graceful::{GracefulManager, Phase};
pub use push::{PushError, PushUpdateOptions, PushUpdateService};
pub use queue::{
    handler_fn, BackendConfig, ConfigError, Handler, Queue, QueueConfig, QueueRegistry,
    QueueSettings, QueueState, Task,
};
