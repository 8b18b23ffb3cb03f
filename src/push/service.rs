//! Push-update queue and its handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, trace};

use crate::queue::{Handler, Queue, QueueError, QueueRegistry};

use super::options::{PushUpdateOptions, RefKind, EMPTY_SHA};
use super::PushError;

/// Name of the push-update queue in the registry and settings.
pub const QUEUE_NAME: &str = "push_update";

/// All ref updates of one push; one queue task.
pub type PushBatch = Vec<PushUpdateOptions>;

/// Collaborators notified about processed pushes.
///
/// Implemented outside this crate by notification, tag sync and repository
/// bookkeeping code.
#[async_trait]
pub trait PushSink: Send + Sync + 'static {
    /// A branch or tag was created.
    async fn create_ref(&self, opts: &PushUpdateOptions, kind: RefKind) -> Result<(), PushError>;

    /// A branch or tag was deleted.
    async fn delete_ref(&self, opts: &PushUpdateOptions, kind: RefKind) -> Result<(), PushError>;

    /// Commits were pushed to a branch.
    async fn push_commits(&self, opts: &PushUpdateOptions) -> Result<(), PushError>;

    /// Tags added and deleted by one push.
    async fn sync_tags(
        &self,
        repo: &str,
        added: &[String],
        deleted: &[String],
    ) -> Result<(), PushError>;

    /// The repository changed; update its timestamp.
    async fn touch_repository(&self, repo: &str) -> Result<(), PushError>;
}

/// Counts of what one push changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub branches_created: usize,
    pub branches_updated: usize,
    pub branches_deleted: usize,
    pub tags_added: Vec<String>,
    pub tags_deleted: Vec<String>,
    pub other_refs: usize,
}

/// Rejects batches that cannot be processed.
pub fn validate(batch: &[PushUpdateOptions]) -> Result<(), PushError> {
    let Some(first) = batch.first() else {
        return Ok(());
    };
    let repo = first.repo_full_name();

    for opts in batch {
        if opts.is_new_ref() && opts.is_del_ref() {
            return Err(PushError::EmptyRevisions {
                ref_name: opts.ref_full_name.clone(),
                sha: EMPTY_SHA,
            });
        }
        if opts.repo_full_name() != repo {
            return Err(PushError::MixedRepositories {
                first: repo,
                other: opts.repo_full_name(),
            });
        }
    }
    Ok(())
}

/// Runs one push through the sink.
pub async fn process_push(
    sink: &dyn PushSink,
    batch: &[PushUpdateOptions],
) -> Result<PushSummary, PushError> {
    validate(batch)?;
    let Some(first) = batch.first() else {
        return Ok(PushSummary::default());
    };
    let repo = first.repo_full_name();
    let mut summary = PushSummary::default();

    for opts in batch {
        match opts.ref_kind() {
            RefKind::Tag if opts.is_del_ref() => {
                sink.delete_ref(opts, RefKind::Tag).await?;
                summary.tags_deleted.push(opts.tag_name().to_string());
            }
            RefKind::Tag => {
                sink.create_ref(opts, RefKind::Tag).await?;
                summary.tags_added.push(opts.tag_name().to_string());
            }
            RefKind::Branch if opts.is_del_ref() => {
                sink.delete_ref(opts, RefKind::Branch).await?;
                summary.branches_deleted += 1;
            }
            RefKind::Branch => {
                trace!(repo = %repo, branch = opts.branch_name(), pusher = %opts.pusher_name, "Branch pushed");
                if opts.is_new_ref() {
                    sink.create_ref(opts, RefKind::Branch).await?;
                    summary.branches_created += 1;
                } else {
                    summary.branches_updated += 1;
                }
                sink.push_commits(opts).await?;
            }
            RefKind::Other => {
                trace!(repo = %repo, ref_name = %opts.ref_full_name, "Non-tag and non-branch ref pushed");
                summary.other_refs += 1;
            }
        }
    }

    sink.sync_tags(&repo, &summary.tags_added, &summary.tags_deleted)
        .await?;
    sink.touch_repository(&repo).await?;

    debug!(repo = %repo, ?summary, "Push processed");
    Ok(summary)
}

/// Queue handler processing each batch as one push.
///
/// Failed pushes are logged and not retried.
pub struct PushUpdateHandler {
    sink: Arc<dyn PushSink>,
}

impl PushUpdateHandler {
    pub fn new(sink: Arc<dyn PushSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Handler<PushBatch> for PushUpdateHandler {
    async fn handle(&self, tasks: Vec<PushBatch>) -> Vec<PushBatch> {
        for batch in &tasks {
            if let Err(e) = process_push(self.sink.as_ref(), batch).await {
                let repo = batch.first().map(|o| o.repo_full_name()).unwrap_or_default();
                error!(repo = %repo, error = %e, "Push update failed");
            }
        }
        Vec::new()
    }
}

/// Producer side of the push-update queue.
#[derive(Clone)]
pub struct PushUpdateService {
    queue: Arc<Queue<PushBatch>>,
}

impl PushUpdateService {
    /// Registers the `push_update` queue with `registry`.
    pub async fn create(
        registry: &QueueRegistry,
        sink: Arc<dyn PushSink>,
    ) -> Result<Self, QueueError> {
        let handler = Arc::new(PushUpdateHandler::new(sink));
        let queue = registry.create_queue(QUEUE_NAME, handler).await?;
        info!(queue = QUEUE_NAME, backend = queue.config().backend.kind(), "Push update queue ready");
        Ok(Self { queue })
    }

    /// Wraps an existing queue.
    pub fn with_queue(queue: Arc<Queue<PushBatch>>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<Queue<PushBatch>> {
        &self.queue
    }

    /// Queues a single ref update.
    pub async fn push_update(&self, opts: PushUpdateOptions) -> Result<(), PushError> {
        self.push_updates(vec![opts]).await
    }

    /// Queues every ref update of one push as a single task.
    ///
    /// # Errors
    ///
    /// Rejects updates whose old and new revisions are both empty and
    /// batches spanning repositories; queue failures are passed through.
    pub async fn push_updates(&self, opts: Vec<PushUpdateOptions>) -> Result<(), PushError> {
        if opts.is_empty() {
            return Ok(());
        }
        validate(&opts)?;
        self.queue.push(opts).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::pool::{eventually, lock};
    use crate::queue::QueueSettings;
    use crate::GracefulManager;
    use std::sync::Mutex;
    use std::time::Duration;

    const OLD: &str = "1111111111111111111111111111111111111111";
    const NEW: &str = "2222222222222222222222222222222222222222";

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }

        fn record(&self, event: String) -> Result<(), PushError> {
            lock(&self.events).push(event);
            Ok(())
        }
    }

    #[async_trait]
    impl PushSink for RecordingSink {
        async fn create_ref(&self, opts: &PushUpdateOptions, kind: RefKind) -> Result<(), PushError> {
            self.record(format!("create {} {}", kind, opts.ref_name()))
        }

        async fn delete_ref(&self, opts: &PushUpdateOptions, kind: RefKind) -> Result<(), PushError> {
            self.record(format!("delete {} {}", kind, opts.ref_name()))
        }

        async fn push_commits(&self, opts: &PushUpdateOptions) -> Result<(), PushError> {
            self.record(format!("commits {}", opts.ref_name()))
        }

        async fn sync_tags(&self, repo: &str, added: &[String], deleted: &[String]) -> Result<(), PushError> {
            self.record(format!("tags {} +{:?} -{:?}", repo, added, deleted))
        }

        async fn touch_repository(&self, repo: &str) -> Result<(), PushError> {
            self.record(format!("touch {}", repo))
        }
    }

    fn update(ref_name: &str, old: &str, new: &str) -> PushUpdateOptions {
        PushUpdateOptions::new("alice", "forge", ref_name, old, new).with_pusher(1, "alice")
    }

    #[tokio::test]
    async fn test_process_push_routes_refs() {
        let sink = RecordingSink::default();
        let batch = vec![
            update("refs/heads/main", OLD, NEW),
            update("refs/heads/topic", EMPTY_SHA, NEW),
            update("refs/heads/stale", OLD, EMPTY_SHA),
            update("refs/tags/v1", EMPTY_SHA, NEW),
            update("refs/tags/v0", OLD, EMPTY_SHA),
            update("refs/notes/commits", OLD, NEW),
        ];

        let summary = process_push(&sink, &batch).await.unwrap();
        assert_eq!(summary.branches_updated, 1);
        assert_eq!(summary.branches_created, 1);
        assert_eq!(summary.branches_deleted, 1);
        assert_eq!(summary.tags_added, vec!["v1".to_string()]);
        assert_eq!(summary.tags_deleted, vec!["v0".to_string()]);
        assert_eq!(summary.other_refs, 1);

        assert_eq!(
            sink.events(),
            vec![
                "commits main",
                "create branch topic",
                "commits topic",
                "delete branch stale",
                "create tag v1",
                "delete tag v0",
                "tags alice/forge +[\"v1\"] -[\"v0\"]",
                "touch alice/forge",
            ]
        );
    }

    #[test]
    fn test_validate_rejects_empty_revisions_and_mixed_repos() {
        let both_empty = vec![update("refs/heads/main", EMPTY_SHA, EMPTY_SHA)];
        assert!(matches!(validate(&both_empty), Err(PushError::EmptyRevisions { .. })));

        let mixed = vec![
            update("refs/heads/main", OLD, NEW),
            PushUpdateOptions::new("bob", "other", "refs/heads/main", OLD, NEW),
        ];
        assert!(matches!(validate(&mixed), Err(PushError::MixedRepositories { .. })));
        assert!(validate(&[]).is_ok());
    }

    #[tokio::test]
    async fn test_service_queues_and_handles_pushes() {
        let settings = QueueSettings::from_yaml_str("default:\n  block_timeout: 20\n").unwrap();
        let registry = QueueRegistry::new(settings);
        let graceful = GracefulManager::new();
        let sink = Arc::new(RecordingSink::default());

        let service = PushUpdateService::create(&registry, sink.clone()).await.unwrap();
        registry.run_all(&graceful).await.unwrap();

        service.push_updates(Vec::new()).await.unwrap();
        let rejected = service
            .push_update(update("refs/heads/main", EMPTY_SHA, EMPTY_SHA))
            .await;
        assert!(matches!(rejected, Err(PushError::EmptyRevisions { .. })));

        service.push_update(update("refs/tags/v2", EMPTY_SHA, NEW)).await.unwrap();
        assert!(eventually(Duration::from_secs(2), || {
            sink.events().contains(&"touch alice/forge".to_string())
        })
        .await);
        assert!(sink.events().contains(&"create tag v2".to_string()));

        graceful.terminate().await;
        assert!(matches!(
            service.push_update(update("refs/heads/main", OLD, NEW)).await,
            Err(PushError::Queue(QueueError::Terminated(_)))
        ));
    }
}
