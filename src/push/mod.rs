//! Push-update pipeline.
//!
//! The primary consumer of the queue: every `git push` produces one batch of
//! [`PushUpdateOptions`], which is queued on `push_update` and processed by
//! [`PushUpdateHandler`] against a [`PushSink`].
//!
//! # Example
//!
//! ```ignore
//! let service = PushUpdateService::create(&registry, sink).await?;
//! registry.run_all(&graceful).await?;
//!
//! service
//!     .push_update(PushUpdateOptions::new("alice", "forge", "refs/heads/main", old, new))
//!     .await?;
//! ```

pub mod options;
pub mod service;

pub use options::{PushUpdateOptions, RefKind, BRANCH_PREFIX, EMPTY_SHA, TAG_PREFIX};
pub use service::{
    process_push, validate, PushBatch, PushSink, PushSummary, PushUpdateHandler,
    PushUpdateService, QUEUE_NAME,
};

use thiserror::Error;

use crate::error::QueueError;

/// Errors raised by the push-update pipeline.
#[derive(Debug, Error)]
pub enum PushError {
    /// A ref update with neither an old nor a new revision.
    #[error("Old and new revisions of {ref_name} are both {sha}")]
    EmptyRevisions { ref_name: String, sha: &'static str },

    /// One push batch touched more than one repository.
    #[error("Push batch mixes repositories {first} and {other}")]
    MixedRepositories { first: String, other: String },

    /// The queue rejected the batch.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A sink collaborator failed.
    #[error("Push sink failed: {0}")]
    Sink(String),
}
