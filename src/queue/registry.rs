//! Process-wide queue registry.
//!
//! The bootstrap code constructs one `QueueRegistry`, creates every queue
//! through it and passes it down to the components that push. Queues are
//! keyed by name; each name maps to exactly one task type.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::info;

use crate::error::QueueError;
use crate::graceful::GracefulManager;

use super::config::QueueSettings;
use super::facade::{Queue, QueueState};
use super::pool::PoolStats;
use super::task::{Handler, Task};

/// Type-erased view of a [`Queue`] used for lifecycle management.
#[async_trait]
trait ManagedQueue: Send + Sync + 'static {
    fn state(&self) -> QueueState;
    fn stats(&self) -> PoolStats;
    fn task_type(&self) -> &'static str;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    async fn start(&self) -> Result<(), QueueError>;
    async fn shutdown(&self);
    async fn terminate(&self);
}

#[async_trait]
impl<T: Task> ManagedQueue for Queue<T> {
    fn state(&self) -> QueueState {
        Queue::state(self)
    }

    fn stats(&self) -> PoolStats {
        Queue::stats(self)
    }

    fn task_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn start(&self) -> Result<(), QueueError> {
        Queue::start(self).await
    }

    async fn shutdown(&self) {
        Queue::shutdown(self).await
    }

    async fn terminate(&self) {
        Queue::terminate(self).await
    }
}

/// Registry of named queues sharing one settings document.
pub struct QueueRegistry {
    settings: QueueSettings,
    queues: RwLock<HashMap<String, Arc<dyn ManagedQueue>>>,
}

impl QueueRegistry {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Settings queues are created from.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn ManagedQueue>>> {
        self.queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn ManagedQueue>>> {
        self.queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates and registers a queue configured from the settings section
    /// for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateQueue`] if the name is taken, or any
    /// construction error of the queue itself.
    pub async fn create_queue<T: Task>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<T>>,
    ) -> Result<Arc<Queue<T>>, QueueError> {
        if self.read().contains_key(name) {
            return Err(QueueError::DuplicateQueue(name.to_string()));
        }

        let config = self.settings.config_for(name)?;
        let queue = Arc::new(Queue::new(config, handler).await?);

        let mut queues = self.write();
        if queues.contains_key(name) {
            return Err(QueueError::DuplicateQueue(name.to_string()));
        }
        queues.insert(name.to_string(), queue.clone());
        info!(queue = %name, task_type = std::any::type_name::<T>(), "Queue registered");
        Ok(queue)
    }

    /// Looks up a queue by name.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TypeMismatch`] if the queue was registered with
    /// a different task type.
    pub fn get<T: Task>(&self, name: &str) -> Result<Option<Arc<Queue<T>>>, QueueError> {
        let Some(queue) = self.read().get(name).cloned() else {
            return Ok(None);
        };
        queue
            .into_any()
            .downcast::<Queue<T>>()
            .map(Some)
            .map_err(|_| QueueError::TypeMismatch(name.to_string()))
    }

    /// Registered queue names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Task type a queue was registered with.
    pub fn task_type(&self, name: &str) -> Option<&'static str> {
        self.read().get(name).map(|q| q.task_type())
    }

    /// Statistics of every queue, keyed by name.
    pub fn stats(&self) -> BTreeMap<String, (QueueState, PoolStats)> {
        self.read()
            .iter()
            .map(|(name, q)| (name.clone(), (q.state(), q.stats())))
            .collect()
    }

    /// Starts every constructed queue and registers its lifecycle callbacks.
    pub async fn run_all(&self, graceful: &GracefulManager) -> Result<(), QueueError> {
        let queues: Vec<(String, Arc<dyn ManagedQueue>)> = self
            .read()
            .iter()
            .filter(|(_, q)| q.state() == QueueState::Constructed)
            .map(|(name, q)| (name.clone(), Arc::clone(q)))
            .collect();

        for (name, queue) in queues {
            queue.start().await?;

            let on_shutdown = Arc::clone(&queue);
            graceful.run_at_shutdown(&name, move || async move { on_shutdown.shutdown().await });
            graceful.run_at_terminate(&name, move || async move { queue.terminate().await });
        }
        Ok(())
    }

    /// Shuts down every queue, then terminates them, and empties the
    /// registry.
    pub async fn close(&self) {
        let queues: Vec<Arc<dyn ManagedQueue>> = self.write().drain().map(|(_, q)| q).collect();
        if queues.is_empty() {
            return;
        }

        info!(queues = queues.len(), "Closing queue registry");
        join_all(queues.iter().map(|q| q.shutdown())).await;
        join_all(queues.iter().map(|q| q.terminate())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::pool::eventually;
    use crate::queue::task::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> QueueSettings {
        QueueSettings::from_yaml_str(
            r#"
default:
  block_timeout: 20
queues:
  notifications:
    workers: 2
"#,
        )
        .unwrap()
    }

    fn string_handler(count: Arc<AtomicUsize>) -> Arc<dyn Handler<String>> {
        Arc::new(handler_fn(move |tasks: Vec<String>| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(tasks.len(), Ordering::SeqCst);
                Vec::new()
            }
        }))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = QueueRegistry::new(settings());
        let count = Arc::new(AtomicUsize::new(0));

        let created = registry
            .create_queue("notifications", string_handler(count))
            .await
            .unwrap();
        assert_eq!(created.config().workers, 2);

        let found = registry.get::<String>("notifications").unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert!(registry.get::<String>("missing").unwrap().is_none());
        assert_eq!(registry.names(), vec!["notifications".to_string()]);
        assert!(registry.task_type("notifications").unwrap().contains("String"));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let registry = QueueRegistry::new(settings());
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .create_queue("dup", string_handler(Arc::clone(&count)))
            .await
            .unwrap();

        let again = registry.create_queue("dup", string_handler(count)).await;
        assert!(matches!(again, Err(QueueError::DuplicateQueue(_))));
    }

    #[tokio::test]
    async fn test_wrong_task_type_is_rejected() {
        let registry = QueueRegistry::new(settings());
        registry
            .create_queue("typed", string_handler(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        let result = registry.get::<serde_json::Value>("typed");
        assert!(matches!(result, Err(QueueError::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn test_run_all_and_close() {
        let registry = QueueRegistry::new(settings());
        let graceful = GracefulManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let queue = registry
            .create_queue("lifecycle", string_handler(Arc::clone(&count)))
            .await
            .unwrap();
        registry.run_all(&graceful).await.unwrap();
        assert_eq!(queue.state(), QueueState::Running);

        queue.push("task".to_string()).await.unwrap();
        assert!(eventually(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 1).await);

        registry.close().await;
        assert!(registry.is_empty());
        assert_eq!(queue.state(), QueueState::Terminated);

        // Callbacks registered by run_all are no-ops on a terminated queue.
        graceful.terminate().await;
    }
}
