//! Redis-backed list queue.
//!
//! Producers RPUSH serialized envelopes onto the list named after the queue;
//! a single read loop LPOPs them and forwards them into the worker pool.
//! Because LPOP is atomic, several processes can share one list and each
//! task reaches exactly one of them.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: pending tasks, FIFO from left to right
//! - `{queue_name}_unique`: in-flight identities (unique queues only)
//!
//! Each list entry is the JSON envelope plus the task's `identity`, so an
//! entry whose task no longer decodes can still release its identity.
//!
//! # Shutdown
//!
//! Shutdown stops the read loop, waits for the pool's in-flight batches and
//! LPUSHes whatever the pool still buffers back to the head of the list
//! while the connection is open. Terminate then drops the connection.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster_async::ClusterConnection;
use redis::FromRedisValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::QueueError;

use super::config::{parse_addresses, QueueConfig};
use super::facade::Backend;
use super::pool::{lock, PoolStats, WorkerPool};
use super::task::{Envelope, Handler, SettleHook, Task};
use super::unique::unique_set_key;

/// Wait between polls when the list is empty.
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait before retrying after a transient broker failure.
const ERROR_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Wait before retrying after any other broker failure.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

fn retry_delay(error: &QueueError) -> Duration {
    if error.is_transient() {
        ERROR_RETRY_INTERVAL
    } else {
        FAILURE_BACKOFF
    }
}

/// Serializes an envelope for the list, tagged with the task identity.
fn encode_entry<T: Task>(envelope: &Envelope<T>) -> Result<Vec<u8>, QueueError> {
    let mut value = serde_json::to_value(envelope)?;
    if let (Some(identity), Some(fields)) = (envelope.identity(), value.as_object_mut()) {
        fields.insert("identity".to_string(), serde_json::Value::String(identity));
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Identity tag of a list entry whose task could not be decoded.
fn entry_identity(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("identity")?.as_str().map(str::to_string)
}

/// Connection to a single node or a cluster.
#[derive(Clone)]
pub enum RedisConnection {
    /// Single node behind a reconnecting connection manager.
    Single(ConnectionManager),
    /// Cluster connection.
    Cluster(ClusterConnection),
}

impl RedisConnection {
    async fn query<V: FromRedisValue>(&self, cmd: &redis::Cmd) -> redis::RedisResult<V> {
        match self {
            RedisConnection::Single(conn) => cmd.query_async(&mut conn.clone()).await,
            RedisConnection::Cluster(conn) => cmd.query_async(&mut conn.clone()).await,
        }
    }
}

/// Builds a `redis://` URL for a single node.
///
/// Addresses that already carry a scheme are used verbatim.
fn node_url(address: &str, password: Option<&str>, db_index: i64) -> String {
    if address.starts_with("redis://") || address.starts_with("rediss://") {
        return address.to_string();
    }
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "redis://:{}@{}/{}",
            urlencoding::encode(password),
            address,
            db_index
        ),
        None => format!("redis://{}/{}", address, db_index),
    }
}

/// Shared, closable connection handle.
///
/// The queue and its unique index share one handle so terminate closes
/// both at once.
pub struct RedisHandle {
    name: String,
    connection: RwLock<Option<RedisConnection>>,
}

impl RedisHandle {
    /// Connects to one node or, for several addresses, to a cluster, and
    /// checks the connection with PING.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if no address is given, the
    /// client cannot be built, or the PING fails.
    pub async fn connect(
        name: &str,
        addresses: &str,
        password: Option<&str>,
        db_index: i64,
    ) -> Result<Self, QueueError> {
        let nodes = parse_addresses(addresses);
        let connection = match nodes.as_slice() {
            [] => return Err(QueueError::ConnectionFailed("no redis host found".to_string())),
            [single] => {
                let client = redis::Client::open(node_url(single, password, db_index))
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
                let manager = ConnectionManager::new(client)
                    .await
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
                RedisConnection::Single(manager)
            }
            many => {
                let urls: Vec<String> = many.iter().map(|a| node_url(a, None, 0)).collect();
                let mut builder = redis::cluster::ClusterClientBuilder::new(urls);
                if let Some(password) = password.filter(|p| !p.is_empty()) {
                    builder = builder.password(password.to_string());
                }
                let client = builder
                    .build()
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
                RedisConnection::Cluster(conn)
            }
        };

        let handle = Self {
            name: name.to_string(),
            connection: RwLock::new(Some(connection)),
        };
        handle
            .ping()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        info!(queue = %name, nodes = nodes.len(), "Connected to redis");
        Ok(handle)
    }

    fn connection(&self) -> Result<RedisConnection, QueueError> {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| QueueError::Terminated(self.name.clone()))
    }

    /// Runs a command on the shared connection.
    pub async fn query<V: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<V, QueueError> {
        let conn = self.connection()?;
        Ok(conn.query(cmd).await?)
    }

    /// Health check.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Drops the connection; later calls fail with `Terminated`.
    pub fn close(&self) {
        let closed = self
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if closed.is_some() {
            debug!(queue = %self.name, "Redis connection closed");
        }
    }

    /// Returns true once [`RedisHandle::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Queue backed by a Redis list.
pub struct RedisQueue<T: Task> {
    name: String,
    list_key: String,
    unique_set: Option<String>,
    handle: Arc<RedisHandle>,
    pool: Arc<WorkerPool<T>>,
    closed_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Task> RedisQueue<T> {
    /// Creates a queue on an established connection.
    pub fn new(
        config: &QueueConfig,
        handle: Arc<RedisHandle>,
        handler: Arc<dyn Handler<T>>,
        settle_hook: Option<Arc<dyn SettleHook<T>>>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: config.name.clone(),
            list_key: config.name.clone(),
            unique_set: config.unique.then(|| unique_set_key(&config.name)),
            handle,
            pool: WorkerPool::new(config, handler, settle_hook),
            closed_tx,
            reader: Mutex::new(None),
        }
    }

    /// Number of tasks waiting in the remote list.
    pub async fn remote_len(&self) -> Result<usize, QueueError> {
        self.handle
            .query(redis::cmd("LLEN").arg(&self.list_key))
            .await
    }

    async fn push_envelope(&self, envelope: &Envelope<T>) -> Result<(), QueueError> {
        let bytes = encode_entry(envelope)?;
        self.handle
            .query::<()>(redis::cmd("RPUSH").arg(&self.list_key).arg(bytes))
            .await
    }

    /// Puts envelopes back at the head of the list, preserving their order.
    async fn return_to_head(&self, envelopes: Vec<Envelope<T>>) -> Result<usize, QueueError> {
        if envelopes.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(&self.list_key);
        let count = envelopes.len();
        for envelope in envelopes.iter().rev() {
            cmd.arg(encode_entry(envelope)?);
        }
        self.handle.query::<()>(&cmd).await?;
        Ok(count)
    }
}

/// Releases the identity of an entry that was dropped undecoded.
async fn release_stranded(
    name: &str,
    unique_set: Option<&str>,
    handle: &RedisHandle,
    bytes: &[u8],
) {
    let Some(set_key) = unique_set else {
        return;
    };
    let Some(identity) = entry_identity(bytes) else {
        warn!(queue = %name, "Dropped task carried no identity tag; its identity may stay claimed");
        return;
    };
    let released: Result<i64, QueueError> = handle
        .query(redis::cmd("SREM").arg(set_key).arg(&identity))
        .await;
    match released {
        Ok(_) => info!(queue = %name, identity = %identity, "Released identity of dropped task"),
        Err(e) => error!(
            queue = %name,
            identity = %identity,
            error = %e,
            "Failed to release identity of dropped task; later pushes of it are ignored"
        ),
    }
}

/// Single consumer moving tasks from the remote list into the pool.
async fn read_loop<T: Task>(
    name: String,
    list_key: String,
    unique_set: Option<String>,
    handle: Arc<RedisHandle>,
    pool: Arc<WorkerPool<T>>,
    mut closed_rx: watch::Receiver<bool>,
) {
    debug!(queue = %name, "Redis read loop started");

    loop {
        if *closed_rx.borrow() {
            break;
        }

        let popped: Result<Option<Vec<u8>>, QueueError> =
            handle.query(redis::cmd("LPOP").arg(&list_key)).await;

        let bytes = match popped {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => {
                if sleep_or_closed(&mut closed_rx, EMPTY_POLL_INTERVAL).await {
                    break;
                }
                continue;
            }
            Err(QueueError::Terminated(_)) => break,
            Err(e) => {
                if e.is_transient() {
                    warn!(queue = %name, error = %e, "LPOP failed, retrying");
                } else {
                    error!(queue = %name, error = %e, "LPOP failed");
                }
                if sleep_or_closed(&mut closed_rx, retry_delay(&e)).await {
                    break;
                }
                continue;
            }
        };

        let envelope = match Envelope::<T>::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(queue = %name, error = %e, "Unable to decode task, dropping it");
                release_stranded(&name, unique_set.as_deref(), &handle, &bytes).await;
                continue;
            }
        };
        trace!(queue = %name, task = ?envelope.task, "Task found");

        // Keep a copy so a push interrupted by shutdown can go back to redis.
        let pending = envelope.clone();
        tokio::select! {
            biased;
            _ = closed_rx.changed() => {
                let mut cmd = redis::cmd("LPUSH");
                cmd.arg(&list_key);
                match encode_entry(&pending) {
                    Ok(bytes) => {
                        cmd.arg(bytes);
                        if let Err(e) = handle.query::<()>(&cmd).await {
                            error!(queue = %name, error = %e, "Failed to return task to redis");
                        }
                    }
                    Err(e) => error!(queue = %name, error = %e, "Unable to encode task"),
                }
                break;
            }
            _ = pool.push(envelope) => {}
        }
    }

    debug!(queue = %name, "Redis read loop stopped");
}

/// Sleeps for `interval`; returns true if the close signal fired meanwhile.
async fn sleep_or_closed(closed_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = closed_rx.changed() => true,
        _ = tokio::time::sleep(interval) => *closed_rx.borrow(),
    }
}

#[async_trait]
impl<T: Task> Backend<T> for RedisQueue<T> {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, task: T) -> Result<(), QueueError> {
        self.push_envelope(&Envelope::new(task)).await
    }

    async fn has(&self, _identity: &str) -> Result<bool, QueueError> {
        Err(QueueError::NotUnique(self.name.clone()))
    }

    async fn run(&self) -> Result<(), QueueError> {
        self.pool.start();

        let reader = tokio::spawn(read_loop(
            self.name.clone(),
            self.list_key.clone(),
            self.unique_set.clone(),
            Arc::clone(&self.handle),
            Arc::clone(&self.pool),
            self.closed_tx.subscribe(),
        ));
        *lock(&self.reader) = Some(reader);
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed_tx.send_replace(true);

        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                error!(queue = %self.name, error = %e, "Redis read loop failed");
            }
        }

        self.pool.cancel();
        self.pool.wait().await;

        let buffered = self.pool.drain_buffered().await;
        match self.return_to_head(buffered).await {
            Ok(0) => {}
            Ok(returned) => info!(queue = %self.name, returned, "Returned buffered tasks to redis"),
            Err(e) => error!(queue = %self.name, error = %e, "Failed to return buffered tasks to redis"),
        }
    }

    async fn terminate(&self) {
        // Anything pushed into the pool after shutdown goes back too.
        let buffered = self.pool.drain_buffered().await;
        if let Err(e) = self.return_to_head(buffered).await {
            warn!(queue = %self.name, error = %e, "Failed to return late tasks to redis");
        }
        self.handle.close();
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::pool::eventually;
    use crate::queue::task::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_node_url() {
        assert_eq!(node_url("127.0.0.1:6379", None, 0), "redis://127.0.0.1:6379/0");
        assert_eq!(
            node_url("cache:6380", Some("p@ss"), 2),
            "redis://:p%40ss@cache:6380/2"
        );
        assert_eq!(node_url("cache:6380", Some(""), 1), "redis://cache:6380/1");
        assert_eq!(
            node_url("redis://user:pw@host:1/3", Some("ignored"), 0),
            "redis://user:pw@host:1/3"
        );
    }

    #[test]
    fn test_entry_carries_identity() {
        let bytes = encode_entry(&Envelope::new("user-42-sync".to_string())).unwrap();
        assert_eq!(entry_identity(&bytes).as_deref(), Some("user-42-sync"));

        let decoded: Envelope<String> = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.task, "user-42-sync");

        let untagged = encode_entry(&Envelope::new(serde_json::json!({"repo": 1}))).unwrap();
        assert!(entry_identity(&untagged).is_none());
    }

    #[test]
    fn test_identity_survives_undecodable_task() {
        let bytes = br#"{"task":{"unexpected":true},"attempts":1,"identity":"user-7"}"#;
        assert!(Envelope::<String>::decode(bytes).is_err());
        assert_eq!(entry_identity(bytes).as_deref(), Some("user-7"));
        assert!(entry_identity(b"not json").is_none());
    }

    #[test]
    fn test_retry_delay_follows_error_kind() {
        let transient = QueueError::Io(std::io::Error::other("reset"));
        assert_eq!(retry_delay(&transient), ERROR_RETRY_INTERVAL);

        let permanent = QueueError::ConnectionFailed("auth".to_string());
        assert_eq!(retry_delay(&permanent), FAILURE_BACKOFF);
    }

    #[tokio::test]
    async fn test_connect_without_hosts_fails() {
        let result = RedisHandle::connect("q", " , ", None, 0).await;
        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_host_fails_fast() {
        let result = RedisHandle::connect("q", "127.0.0.1:1", None, 0).await;
        assert!(result.is_err());
    }

    fn redis_address() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=127.0.0.1:6379 cargo test -- --ignored
    async fn test_redis_queue_round_trip() {
        let name = format!("forge-queue-test-{}", std::process::id());
        let handle = Arc::new(
            RedisHandle::connect(&name, &redis_address(), None, 0)
                .await
                .expect("redis should be reachable"),
        );
        let _: () = handle
            .query(redis::cmd("DEL").arg(&name))
            .await
            .expect("DEL");

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handler = Arc::new(handler_fn(move |tasks: Vec<String>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(tasks.len(), Ordering::SeqCst);
                Vec::new()
            }
        }));

        let config = QueueConfig::new(&name).with_block_timeout(Duration::from_millis(50));
        let queue = RedisQueue::new(&config, Arc::clone(&handle), handler, None);
        for i in 0..10 {
            queue.push(format!("task-{}", i)).await.expect("push");
        }
        assert_eq!(queue.remote_len().await.expect("LLEN"), 10);

        queue.run().await.expect("run");
        assert!(eventually(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 10).await);

        queue.shutdown().await;
        queue.terminate().await;
        assert!(handle.is_closed());
        assert!(matches!(
            queue.push("late".to_string()).await,
            Err(QueueError::Terminated(_))
        ));
    }
}
