//! Task definitions for the queue.
//!
//! This module defines the payload side of the queue contract:
//!
//! - `Task`: capability trait every queued value implements
//! - `Envelope`: a task plus its delivery bookkeeping
//! - `Handler`: consumer callback that reports which tasks failed

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value that can travel through a queue.
///
/// Tasks must survive a JSON round trip so they can be stored in the remote
/// broker or the on-disk log. Equality is used to match the tasks a handler
/// reports as failed back to their envelopes.
pub trait Task:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    /// Logical identity used by unique queues for deduplication.
    ///
    /// Returning `None` means the task is never deduplicated.
    fn identity(&self) -> Option<String> {
        None
    }
}

impl Task for String {
    fn identity(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl Task for serde_json::Value {}

impl<T: Task> Task for Vec<T> {}

/// A task together with its delivery bookkeeping.
///
/// Only `task` and `attempts` are persisted; the receipt is a
/// backend-local token (the on-disk record sequence number) that is
/// reassigned when a task is loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    /// The queued task.
    pub task: T,
    /// Number of times the task has been handed to the handler.
    #[serde(default)]
    pub attempts: u32,
    /// Backend receipt used to acknowledge the task once it settles.
    #[serde(skip)]
    pub receipt: Option<u64>,
}

impl<T: Task> Envelope<T> {
    /// Wraps a freshly pushed task.
    pub fn new(task: T) -> Self {
        Self {
            task,
            attempts: 0,
            receipt: None,
        }
    }

    /// Attaches a backend receipt.
    pub fn with_receipt(mut self, receipt: u64) -> Self {
        self.receipt = Some(receipt);
        self
    }

    /// Returns the logical identity of the wrapped task.
    pub fn identity(&self) -> Option<String> {
        self.task.identity()
    }

    /// Serializes the envelope for a remote or durable backend.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes an envelope previously produced by [`Envelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// How a task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The handler processed the task without reporting it as failed.
    Handled,
    /// The task exhausted its delivery attempts and was dropped.
    Discarded,
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Settlement::Handled => write!(f, "handled"),
            Settlement::Discarded => write!(f, "discarded"),
        }
    }
}

/// Consumer callback registered with a queue.
///
/// The handler receives a batch of at most `batch_length` tasks and returns
/// the subset it could not process. Returned tasks are re-pushed to the back
/// of the queue until their attempt budget runs out.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    /// Processes a batch and returns the tasks that failed.
    async fn handle(&self, tasks: Vec<T>) -> Vec<T>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<T, F> {
    f: F,
    _task: PhantomData<fn(T)>,
}

/// Wraps an async closure as a queue handler.
///
/// ```rust,ignore
/// let handler = handler_fn(|tasks: Vec<String>| async move {
///     for task in &tasks {
///         tracing::info!(%task, "handled");
///     }
///     Vec::new()
/// });
/// ```
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<T, F>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<T>> + Send + 'static,
    T: Send + 'static,
{
    FnHandler {
        f,
        _task: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<T, F>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn handle(&self, tasks: Vec<T>) -> Vec<T> {
        (self.f)(tasks).await
    }
}

/// Hook invoked by the worker pool when a task leaves the queue for good.
///
/// Backends use it to release unique identities and acknowledge durable
/// records.
#[async_trait]
pub trait SettleHook<T>: Send + Sync + 'static {
    /// Called once per envelope after it was handled or discarded.
    async fn settle(&self, envelope: &Envelope<T>, settlement: Settlement);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mirror {
        repo_id: i64,
    }

    impl Task for Mirror {
        fn identity(&self) -> Option<String> {
            Some(format!("mirror-{}", self.repo_id))
        }
    }

    #[test]
    fn test_string_identity_is_itself() {
        let task = "user-42-sync".to_string();
        assert_eq!(task.identity().as_deref(), Some("user-42-sync"));
    }

    #[test]
    fn test_json_value_has_no_identity() {
        let task = serde_json::json!({"repo": 1});
        assert!(task.identity().is_none());
    }

    #[test]
    fn test_envelope_encode_skips_receipt() {
        let envelope = Envelope::new(Mirror { repo_id: 7 }).with_receipt(99);
        let bytes = envelope.encode().expect("encode");
        let decoded: Envelope<Mirror> = Envelope::decode(&bytes).expect("decode");

        assert_eq!(decoded.task, envelope.task);
        assert_eq!(decoded.attempts, 0);
        assert!(decoded.receipt.is_none());
        assert_eq!(decoded.identity().as_deref(), Some("mirror-7"));
    }

    #[test]
    fn test_envelope_decode_defaults_attempts() {
        let decoded: Envelope<String> =
            Envelope::decode(br#"{"task":"task-1"}"#).expect("decode");
        assert_eq!(decoded.attempts, 0);
    }

    #[tokio::test]
    async fn test_handler_fn_returns_failures() {
        let handler = handler_fn(|tasks: Vec<u32>| async move {
            tasks.into_iter().filter(|t| t % 2 == 1).collect()
        });

        let failed = handler.handle(vec![1, 2, 3, 4]).await;
        assert_eq!(failed, vec![1, 3]);
    }
}
