//! Disk-persisted queue.
//!
//! Every accepted task is appended to a write-ahead log before it enters the
//! worker pool and acknowledged once it settles, so pending work survives
//! both orderly restarts and crashes. Tasks that do not fit in the pool's
//! buffer stay on disk until a feeder loop has room for them.
//!
//! # On-disk layout
//!
//! One directory per queue under the configured data directory:
//!
//! - `queue.log`: length-prefixed records (`u32` little-endian length, then a
//!   JSON body). A body is either `{"op":"push","seq":..,"identity":..,"task":..}`
//!   or `{"op":"ack","seq":..}`.
//! - `index.json`: checkpoint with the offset scanning starts from, the next
//!   sequence number and the in-flight identities mapped to record offsets.
//!
//! A torn record at the end of the log (crash during a write) is truncated
//! on open. Compaction rewrites the log with only the pending records; it
//! runs at shutdown and whenever an ack leaves the log mostly settled and
//! larger than the compaction threshold.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::metrics::MetricsCollector;

use super::config::QueueConfig;
use super::facade::Backend;
use super::pool::{lock, PoolStats, WorkerPool};
use super::task::{Envelope, Handler, SettleHook, Settlement, Task};

const LOG_FILE: &str = "queue.log";
const INDEX_FILE: &str = "index.json";
const LENGTH_PREFIX: usize = 4;

/// Log size above which a mostly settled log is compacted while running.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1 << 20;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Push {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
        task: serde_json::Value,
    },
    Ack {
        seq: u64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    head: u64,
    next_seq: u64,
    #[serde(default)]
    identities: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
struct PendingRecord {
    offset: u64,
    size: u64,
    identity: Option<String>,
}

/// A pending record as shown by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTask {
    pub seq: u64,
    pub identity: Option<String>,
    pub task: serde_json::Value,
}

/// Outcome of a log compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub pending: usize,
}

struct StoreState {
    writer: Option<File>,
    len: u64,
    // Bytes of the log taken by pending records.
    live_bytes: u64,
    // Bumped by every compaction; record offsets from an older generation
    // are stale.
    generation: u64,
    next_seq: u64,
    pending: BTreeMap<u64, PendingRecord>,
    identities: HashMap<String, u64>,
}

/// Write-ahead log of pending tasks for one queue.
///
/// Writes are serialized behind one async mutex; reads open their own file
/// handle and only take the mutex to look up an offset.
pub struct DiskStore {
    name: String,
    dir: PathBuf,
    sync_writes: bool,
    compact_threshold: u64,
    state: tokio::sync::Mutex<StoreState>,
}

struct Scan {
    // (offset, size, record)
    records: Vec<(u64, u64, LogRecord)>,
    valid_len: u64,
}

fn encode_record(record: &LogRecord) -> Result<Vec<u8>, QueueError> {
    let body = serde_json::to_vec(record)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "task too large for the log")
    })?;

    let mut bytes = Vec::with_capacity(LENGTH_PREFIX + body.len());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn read_prefix(bytes: &[u8], offset: usize) -> Option<usize> {
    let prefix = bytes.get(offset..offset + LENGTH_PREFIX)?;
    Some(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize)
}

/// Parses records from `start` until the end of the complete records.
fn scan_records(bytes: &[u8], start: usize, path: &Path) -> Result<Scan, QueueError> {
    let mut records = Vec::new();
    let mut offset = start;

    while let Some(len) = read_prefix(bytes, offset) {
        let body_start = offset + LENGTH_PREFIX;
        let Some(body) = bytes.get(body_start..body_start + len) else {
            break;
        };
        let record = serde_json::from_slice(body).map_err(|e| QueueError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("record at offset {}: {}", offset, e),
        })?;
        records.push((offset as u64, (LENGTH_PREFIX + len) as u64, record));
        offset = body_start + len;
    }

    Ok(Scan {
        records,
        valid_len: offset as u64,
    })
}

async fn read_checkpoint(path: &Path) -> Checkpoint {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Checkpoint::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read checkpoint, scanning whole log");
            return Checkpoint::default();
        }
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Invalid checkpoint, scanning whole log");
        Checkpoint::default()
    })
}

impl DiskStore {
    /// Opens (or creates) the store in `dir` and rebuilds the pending set.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Io` if the directory or log cannot be accessed
    /// and `QueueError::Corrupt` if a complete record cannot be parsed.
    pub async fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let log_path = dir.join(LOG_FILE);
        let checkpoint = read_checkpoint(&dir.join(INDEX_FILE)).await;
        let bytes = match fs::read(&log_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut head = checkpoint.head as usize;
        if head > bytes.len() {
            warn!(queue = %name, head, len = bytes.len(), "Checkpoint beyond end of log, scanning whole log");
            head = 0;
        }

        let scan = scan_records(&bytes, head, &log_path)?;
        let mut next_seq = checkpoint.next_seq;
        let mut pending = BTreeMap::new();
        for (offset, size, record) in scan.records {
            match record {
                LogRecord::Push { seq, identity, .. } => {
                    next_seq = next_seq.max(seq + 1);
                    pending.insert(
                        seq,
                        PendingRecord {
                            offset,
                            size,
                            identity,
                        },
                    );
                }
                LogRecord::Ack { seq } => {
                    pending.remove(&seq);
                }
            }
        }
        let live_bytes = pending.values().map(|record| record.size).sum();
        let identities = pending
            .iter()
            .filter_map(|(seq, record)| record.identity.clone().map(|id| (id, *seq)))
            .collect();

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        if scan.valid_len < bytes.len() as u64 {
            warn!(
                queue = %name,
                torn_bytes = bytes.len() as u64 - scan.valid_len,
                "Truncating incomplete record at end of log"
            );
            writer.set_len(scan.valid_len).await?;
        }

        info!(queue = %name, pending = pending.len(), dir = %dir.display(), "Disk store opened");

        Ok(Self {
            name,
            dir,
            sync_writes,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            state: tokio::sync::Mutex::new(StoreState {
                writer: Some(writer),
                len: scan.valid_len,
                live_bytes,
                generation: 0,
                next_seq,
                pending,
                identities,
            }),
        })
    }

    /// Sets the log size above which acks may trigger a compaction.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Current size of the log in bytes.
    pub async fn log_len(&self) -> u64 {
        self.state.lock().await.len
    }

    /// Directory holding the log and checkpoint.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn corrupt(&self, reason: String) -> QueueError {
        QueueError::Corrupt {
            path: self.log_path(),
            reason,
        }
    }

    async fn write_record(
        &self,
        state: &mut StoreState,
        record: &LogRecord,
    ) -> Result<u64, QueueError> {
        let bytes = encode_record(record)?;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| QueueError::Terminated(self.name.clone()))?;

        writer.write_all(&bytes).await?;
        writer.flush().await?;
        if self.sync_writes {
            writer.sync_data().await?;
        }

        let offset = state.len;
        state.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Appends a task and returns its sequence number.
    ///
    /// Returns `None` without writing when `identity` is already pending.
    pub async fn append(
        &self,
        identity: Option<&str>,
        task: serde_json::Value,
    ) -> Result<Option<u64>, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(identity) = identity {
            if state.identities.contains_key(identity) {
                return Ok(None);
            }
        }

        let seq = state.next_seq;
        let record = LogRecord::Push {
            seq,
            identity: identity.map(str::to_string),
            task,
        };
        let offset = self.write_record(&mut state, &record).await?;
        let size = state.len - offset;

        state.next_seq += 1;
        state.live_bytes += size;
        state.pending.insert(
            seq,
            PendingRecord {
                offset,
                size,
                identity: identity.map(str::to_string),
            },
        );
        if let Some(identity) = identity {
            state.identities.insert(identity.to_string(), seq);
        }
        Ok(Some(seq))
    }

    /// Marks a record as settled. Returns false if it was not pending.
    pub async fn ack(&self, seq: u64) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.pending.remove(&seq) else {
            return Ok(false);
        };
        if let Some(identity) = &record.identity {
            state.identities.remove(identity);
        }
        state.live_bytes = state.live_bytes.saturating_sub(record.size);
        self.write_record(&mut state, &LogRecord::Ack { seq }).await?;

        if state.len >= self.compact_threshold && state.live_bytes * 2 <= state.len {
            if let Err(e) = self.compact_locked(&mut state).await {
                warn!(queue = %self.name, error = %e, "Background compaction failed");
            }
        }
        Ok(true)
    }

    /// Reads the task of a pending record.
    pub async fn load(&self, seq: u64) -> Result<Option<serde_json::Value>, QueueError> {
        loop {
            let (offset, generation) = {
                let state = self.state.lock().await;
                let Some(record) = state.pending.get(&seq) else {
                    return Ok(None);
                };
                (record.offset, state.generation)
            };

            let read = self.read_record(offset).await;
            if self.state.lock().await.generation != generation {
                // Compacted while reading; look the offset up again.
                continue;
            }

            return match read? {
                LogRecord::Push { seq: found, task, .. } if found == seq => Ok(Some(task)),
                _ => Err(self.corrupt(format!("offset {} does not hold record {}", offset, seq))),
            };
        }
    }

    async fn read_record(&self, offset: u64) -> Result<LogRecord, QueueError> {
        let mut file = File::open(self.log_path()).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut prefix = [0u8; LENGTH_PREFIX];
        file.read_exact(&mut prefix).await?;
        let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
        file.read_exact(&mut body).await?;

        serde_json::from_slice(&body)
            .map_err(|e| self.corrupt(format!("record at offset {}: {}", offset, e)))
    }

    /// Reports whether a record with `identity` is pending.
    pub async fn contains(&self, identity: &str) -> bool {
        self.state.lock().await.identities.contains_key(identity)
    }

    /// Sequence numbers of pending records, oldest first.
    pub async fn pending_seqs(&self) -> Vec<u64> {
        self.state.lock().await.pending.keys().copied().collect()
    }

    /// Number of pending records.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Identities of pending records.
    pub async fn identities(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut identities: Vec<String> = state.identities.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Loads every pending record, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingTask>, QueueError> {
        let records: Vec<(u64, Option<String>)> = {
            let state = self.state.lock().await;
            state
                .pending
                .iter()
                .map(|(seq, record)| (*seq, record.identity.clone()))
                .collect()
        };

        let mut tasks = Vec::with_capacity(records.len());
        for (seq, identity) in records {
            if let Some(task) = self.load(seq).await? {
                tasks.push(PendingTask {
                    seq,
                    identity,
                    task,
                });
            }
        }
        Ok(tasks)
    }

    async fn write_checkpoint(&self, state: &mut StoreState) -> Result<(), QueueError> {
        let checkpoint = Checkpoint {
            head: state
                .pending
                .values()
                .map(|record| record.offset)
                .min()
                .unwrap_or(state.len),
            next_seq: state.next_seq,
            identities: state
                .identities
                .iter()
                .filter_map(|(id, seq)| state.pending.get(seq).map(|r| (id.clone(), r.offset)))
                .collect(),
        };

        if let Some(writer) = state.writer.as_mut() {
            writer.sync_data().await?;
        }
        self.store_checkpoint(&checkpoint).await
    }

    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), QueueError> {
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?).await?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Syncs the log and writes the checkpoint.
    pub async fn checkpoint(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        self.write_checkpoint(&mut state).await
    }

    /// Rewrites the log keeping only pending records, then checkpoints.
    pub async fn compact(&self) -> Result<CompactStats, QueueError> {
        let mut state = self.state.lock().await;
        self.compact_locked(&mut state).await
    }

    async fn compact_locked(&self, state: &mut StoreState) -> Result<CompactStats, QueueError> {
        let log_path = self.log_path();
        let bytes_before = state.len;

        let old = match fs::read(&log_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut compacted = Vec::new();
        let mut moved = Vec::with_capacity(state.pending.len());
        for (seq, record) in &state.pending {
            let start = record.offset as usize;
            let chunk = read_prefix(&old, start)
                .and_then(|len| old.get(start..start + LENGTH_PREFIX + len))
                .ok_or_else(|| self.corrupt(format!("record {} runs past end of log", seq)))?;
            moved.push((*seq, compacted.len() as u64));
            compacted.extend_from_slice(chunk);
        }

        let tmp = self.dir.join(format!("{}.compact", LOG_FILE));
        let mut file = File::create(&tmp).await?;
        file.write_all(&compacted).await?;
        file.sync_all().await?;
        drop(file);

        // Offsets change with the rename; scan from the start until the
        // new checkpoint is written.
        self.store_checkpoint(&Checkpoint {
            head: 0,
            next_seq: state.next_seq,
            identities: BTreeMap::new(),
        })
        .await?;
        fs::rename(&tmp, &log_path).await?;
        state.generation += 1;

        if state.writer.is_some() {
            state.writer = Some(OpenOptions::new().append(true).open(&log_path).await?);
        }
        for (seq, offset) in moved {
            if let Some(record) = state.pending.get_mut(&seq) {
                record.offset = offset;
            }
        }
        state.len = compacted.len() as u64;
        state.live_bytes = state.len;
        self.write_checkpoint(state).await?;

        let stats = CompactStats {
            bytes_before,
            bytes_after: state.len,
            pending: state.pending.len(),
        };
        debug!(queue = %self.name, ?stats, "Log compacted");
        Ok(stats)
    }

    /// Syncs and closes the log; later writes fail with `Terminated`.
    pub async fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(writer) = state.writer.take() {
            writer.sync_all().await?;
        }
        Ok(())
    }
}

/// Acknowledges a record once the pool settles its task.
struct DiskAck {
    name: String,
    store: Arc<DiskStore>,
}

#[async_trait]
impl<T: Task> SettleHook<T> for DiskAck {
    async fn settle(&self, envelope: &Envelope<T>, settlement: Settlement) {
        let Some(seq) = envelope.receipt else {
            return;
        };
        match self.store.ack(seq).await {
            Ok(true) => {}
            Ok(false) => debug!(queue = %self.name, seq, "Record already acknowledged"),
            Err(e) => error!(
                queue = %self.name,
                seq,
                settlement = %settlement,
                error = %e,
                "Failed to acknowledge record; it will be delivered again after restart"
            ),
        }
    }
}

/// Queue persisting every task in a [`DiskStore`].
pub struct DiskQueue<T: Task> {
    name: String,
    unique: bool,
    block_timeout: Duration,
    store: Arc<DiskStore>,
    pool: Arc<WorkerPool<T>>,
    // Records on disk that are not yet in the pool, oldest first.
    overflow: Arc<Mutex<VecDeque<u64>>>,
    wake: Arc<Notify>,
    closed_tx: watch::Sender<bool>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl<T: Task> DiskQueue<T> {
    /// Opens the store under `data_dir/<queue name>` and schedules every
    /// record left from a previous run for replay.
    pub async fn open(
        config: &QueueConfig,
        data_dir: &Path,
        sync_writes: bool,
        handler: Arc<dyn Handler<T>>,
    ) -> Result<Self, QueueError> {
        let store = Arc::new(DiskStore::open(data_dir.join(&config.name), sync_writes).await?);

        let replay: VecDeque<u64> = store.pending_seqs().await.into();
        if !replay.is_empty() {
            info!(queue = %config.name, replay = replay.len(), "Replaying tasks left on disk");
        }

        let hook: Arc<dyn SettleHook<T>> = Arc::new(DiskAck {
            name: config.name.clone(),
            store: Arc::clone(&store),
        });
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            name: config.name.clone(),
            unique: config.unique,
            block_timeout: config.block_timeout,
            store,
            pool: WorkerPool::new(config, handler, Some(hook)),
            overflow: Arc::new(Mutex::new(replay)),
            wake: Arc::new(Notify::new()),
            closed_tx,
            feeder: Mutex::new(None),
            metrics: MetricsCollector::new(),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<DiskStore> {
        &self.store
    }
}

/// Moves records from disk into the pool as buffer space frees up.
async fn feed_loop<T: Task>(
    name: String,
    store: Arc<DiskStore>,
    pool: Arc<WorkerPool<T>>,
    overflow: Arc<Mutex<VecDeque<u64>>>,
    wake: Arc<Notify>,
    mut closed_rx: watch::Receiver<bool>,
    idle_wait: Duration,
) {
    debug!(queue = %name, "Disk feeder started");

    loop {
        if *closed_rx.borrow() {
            break;
        }

        let next = lock(&overflow).pop_front();
        let Some(seq) = next else {
            tokio::select! {
                _ = closed_rx.changed() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(idle_wait) => {}
            }
            continue;
        };

        let task = match store.load(seq).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!(queue = %name, seq, error = %e, "Unable to read record");
                lock(&overflow).push_front(seq);
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    _ = tokio::time::sleep(idle_wait) => {}
                }
                continue;
            }
        };

        let envelope = match serde_json::from_value::<Envelope<T>>(task) {
            Ok(envelope) => envelope.with_receipt(seq),
            Err(e) => {
                error!(queue = %name, seq, error = %e, "Unable to decode task, dropping it");
                if let Err(e) = store.ack(seq).await {
                    warn!(queue = %name, seq, error = %e, "Failed to acknowledge undecodable record");
                }
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = closed_rx.changed() => {
                lock(&overflow).push_front(seq);
                break;
            }
            _ = pool.push(envelope) => {}
        }
    }

    debug!(queue = %name, "Disk feeder stopped");
}

#[async_trait]
impl<T: Task> Backend<T> for DiskQueue<T> {
    fn kind(&self) -> &'static str {
        "disk"
    }

    async fn push(&self, task: T) -> Result<(), QueueError> {
        let identity = if self.unique { task.identity() } else { None };
        let envelope = Envelope::new(task);
        let value = serde_json::to_value(&envelope)?;

        let Some(seq) = self.store.append(identity.as_deref(), value).await? else {
            debug!(queue = %self.name, identity = ?identity, "Task already in flight, skipping push");
            self.metrics.record_duplicate(&self.name);
            return Ok(());
        };

        let envelope = envelope.with_receipt(seq);
        {
            let mut overflow = lock(&self.overflow);
            if overflow.is_empty() && self.pool.try_push(envelope).is_ok() {
                return Ok(());
            }
            overflow.push_back(seq);
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn has(&self, identity: &str) -> Result<bool, QueueError> {
        if !self.unique {
            return Err(QueueError::NotUnique(self.name.clone()));
        }
        Ok(self.store.contains(identity).await)
    }

    async fn run(&self) -> Result<(), QueueError> {
        self.pool.start();

        let feeder = tokio::spawn(feed_loop(
            self.name.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            Arc::clone(&self.overflow),
            Arc::clone(&self.wake),
            self.closed_tx.subscribe(),
            self.block_timeout,
        ));
        *lock(&self.feeder) = Some(feeder);
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed_tx.send_replace(true);

        let feeder = lock(&self.feeder).take();
        if let Some(feeder) = feeder {
            if let Err(e) = feeder.await {
                error!(queue = %self.name, error = %e, "Disk feeder failed");
            }
        }

        self.pool.cancel();
        self.pool.wait().await;

        // Buffered tasks were never acknowledged, so they stay in the log.
        let buffered = self.pool.drain_buffered().await.len();
        let overflow = lock(&self.overflow).len();
        match self.store.compact().await {
            Ok(stats) => info!(
                queue = %self.name,
                pending = stats.pending,
                buffered,
                overflow,
                "Disk queue persisted"
            ),
            Err(e) => error!(queue = %self.name, error = %e, "Failed to compact disk queue"),
        }
    }

    async fn terminate(&self) {
        if let Err(e) = self.store.close().await {
            error!(queue = %self.name, error = %e, "Failed to close disk queue");
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = self.pool.stats();
        stats.buffered += lock(&self.overflow).len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::pool::eventually;
    use crate::queue::task::handler_fn;
    use tempfile::TempDir;

    fn task(n: u32) -> serde_json::Value {
        serde_json::json!({ "task": format!("task-{}", n), "attempts": 0 })
    }

    #[tokio::test]
    async fn test_store_reopen_restores_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        let store = DiskStore::open(&path, false).await.unwrap();
        let a = store.append(Some("a"), task(0)).await.unwrap().unwrap();
        let b = store.append(Some("b"), task(1)).await.unwrap().unwrap();
        let c = store.append(None, task(2)).await.unwrap().unwrap();
        assert!(store.ack(b).await.unwrap());
        assert!(!store.ack(b).await.unwrap());
        drop(store);

        let store = DiskStore::open(&path, false).await.unwrap();
        assert_eq!(store.pending_seqs().await, vec![a, c]);
        assert_eq!(store.identities().await, vec!["a".to_string()]);
        assert_eq!(store.load(c).await.unwrap(), Some(task(2)));
        assert_eq!(store.load(b).await.unwrap(), None);

        let d = store.append(None, task(3)).await.unwrap().unwrap();
        assert!(d > c);
    }

    #[tokio::test]
    async fn test_store_rejects_pending_identity() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().join("q"), false).await.unwrap();

        let seq = store.append(Some("user-42-sync"), task(0)).await.unwrap();
        assert!(seq.is_some());
        assert_eq!(store.append(Some("user-42-sync"), task(1)).await.unwrap(), None);
        assert!(store.contains("user-42-sync").await);

        store.ack(seq.unwrap()).await.unwrap();
        assert!(!store.contains("user-42-sync").await);
        assert!(store.append(Some("user-42-sync"), task(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn");

        let store = DiskStore::open(&path, true).await.unwrap();
        store.append(None, task(0)).await.unwrap();
        store.append(None, task(1)).await.unwrap();
        store.close().await.unwrap();
        drop(store);

        let log = path.join(LOG_FILE);
        let clean_len = std::fs::metadata(&log).unwrap().len();
        let mut bytes = std::fs::read(&log).unwrap();
        bytes.extend_from_slice(&200u32.to_le_bytes());
        bytes.extend_from_slice(b"{\"op\":\"push\"");
        std::fs::write(&log, bytes).unwrap();

        let store = DiskStore::open(&path, false).await.unwrap();
        assert_eq!(store.pending_len().await, 2);
        assert_eq!(std::fs::metadata(&log).unwrap().len(), clean_len);

        // Appends after truncation stay readable.
        let seq = store.append(None, task(2)).await.unwrap().unwrap();
        assert_eq!(store.load(seq).await.unwrap(), Some(task(2)));
    }

    #[tokio::test]
    async fn test_store_reports_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt");
        std::fs::create_dir_all(&path).unwrap();

        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{x}");
        std::fs::write(path.join(LOG_FILE), bytes).unwrap();

        let result = DiskStore::open(&path, false).await;
        assert!(matches!(result, Err(QueueError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_compact_keeps_only_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compact");

        let store = DiskStore::open(&path, false).await.unwrap();
        let mut seqs = Vec::new();
        for n in 0..10 {
            seqs.push(store.append(Some(&format!("id-{}", n)), task(n)).await.unwrap().unwrap());
        }
        for seq in &seqs[..8] {
            store.ack(*seq).await.unwrap();
        }

        let stats = store.compact().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(store.load(seqs[9]).await.unwrap(), Some(task(9)));

        store.ack(seqs[8]).await.unwrap();
        drop(store);

        let store = DiskStore::open(&path, false).await.unwrap();
        assert_eq!(store.pending_seqs().await, vec![seqs[9]]);
        assert_eq!(store.identities().await, vec!["id-9".to_string()]);
        let next = store.append(None, task(10)).await.unwrap().unwrap();
        assert!(next > seqs[9]);
    }

    #[tokio::test]
    async fn test_checkpoint_skips_settled_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");

        let store = DiskStore::open(&path, false).await.unwrap();
        let first = store.append(None, task(0)).await.unwrap().unwrap();
        let second = store.append(None, task(1)).await.unwrap().unwrap();
        store.ack(first).await.unwrap();
        store.checkpoint().await.unwrap();
        drop(store);

        let raw = std::fs::read(path.join(INDEX_FILE)).unwrap();
        let checkpoint: Checkpoint = serde_json::from_slice(&raw).unwrap();
        assert!(checkpoint.head > 0);
        assert_eq!(checkpoint.next_seq, second + 1);

        let store = DiskStore::open(&path, false).await.unwrap();
        assert_eq!(store.pending_seqs().await, vec![second]);
    }

    #[tokio::test]
    async fn test_log_stays_bounded_under_churn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("churn");
        let threshold = 4096;

        let store = DiskStore::open(&path, false)
            .await
            .unwrap()
            .with_compact_threshold(threshold);
        let kept = store.append(Some("kept"), task(0)).await.unwrap().unwrap();

        let mut peak = 0;
        for n in 1..2000 {
            let seq = store.append(None, task(n)).await.unwrap().unwrap();
            store.ack(seq).await.unwrap();
            peak = peak.max(store.log_len().await);
        }

        assert!(peak < threshold * 2, "log grew to {} bytes", peak);
        let on_disk = std::fs::metadata(path.join(LOG_FILE)).unwrap().len();
        assert_eq!(on_disk, store.log_len().await);
        assert_eq!(store.load(kept).await.unwrap(), Some(task(0)));
        drop(store);

        let store = DiskStore::open(&path, false).await.unwrap();
        assert_eq!(store.pending_seqs().await, vec![kept]);
        assert_eq!(store.identities().await, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_load_races_background_compaction() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            DiskStore::open(dir.path().join("race"), false)
                .await
                .unwrap()
                .with_compact_threshold(1024),
        );
        let kept = store.append(None, task(7)).await.unwrap().unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..300 {
                    assert_eq!(store.load(kept).await.unwrap(), Some(task(7)));
                    tokio::task::yield_now().await;
                }
            })
        };
        for n in 0..600 {
            let seq = store.append(None, task(n)).await.unwrap().unwrap();
            store.ack(seq).await.unwrap();
        }
        reader.await.unwrap();
    }

    fn collecting(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn Handler<String>> {
        Arc::new(handler_fn(move |tasks: Vec<String>| {
            let seen = Arc::clone(&seen);
            async move {
                lock(&seen).extend(tasks);
                Vec::new()
            }
        }))
    }

    #[tokio::test]
    async fn test_overflow_is_fed_from_disk() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = QueueConfig::new("overflow")
            .with_boost_workers(0)
            .with_queue_length(2)
            .with_batch_length(1)
            .with_block_timeout(Duration::from_millis(20));

        let queue = DiskQueue::open(&config, dir.path(), false, collecting(Arc::clone(&seen)))
            .await
            .unwrap();
        for n in 0..10 {
            queue.push(format!("task-{}", n)).await.unwrap();
        }
        assert_eq!(queue.stats().buffered, 10);

        queue.run().await.unwrap();
        assert!(eventually(Duration::from_secs(3), || lock(&seen).len() == 10).await);
        let expected: Vec<String> = (0..10).map(|n| format!("task-{}", n)).collect();
        assert_eq!(*lock(&seen), expected);

        queue.shutdown().await;
        assert_eq!(queue.stats().tasks_handled, 10);
        assert_eq!(queue.store().pending_len().await, 0);
        queue.terminate().await;
    }

    #[tokio::test]
    async fn test_unhandled_tasks_survive_restart() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::new("restart")
            .with_unique(true)
            .with_block_timeout(Duration::from_millis(20));

        let idle = Arc::new(Mutex::new(Vec::new()));
        let queue = DiskQueue::open(&config, dir.path(), false, collecting(Arc::clone(&idle)))
            .await
            .unwrap();
        for n in 0..5 {
            queue.push(format!("task-{}", n)).await.unwrap();
        }
        queue.push("task-0".to_string()).await.unwrap();
        assert!(queue.has("task-3").await.unwrap());

        // Never started: everything stays on disk.
        queue.shutdown().await;
        queue.terminate().await;
        assert!(matches!(
            queue.push("late".to_string()).await,
            Err(QueueError::Terminated(_))
        ));
        drop(queue);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = DiskQueue::open(&config, dir.path(), false, collecting(Arc::clone(&seen)))
            .await
            .unwrap();
        assert!(queue.has("task-3").await.unwrap());
        queue.run().await.unwrap();

        assert!(eventually(Duration::from_secs(3), || lock(&seen).len() == 5).await);
        queue.shutdown().await;
        assert!(!queue.has("task-3").await.unwrap());
        assert!(lock(&idle).is_empty());
        queue.terminate().await;
    }

    #[tokio::test]
    async fn test_non_unique_disk_queue_has_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let handler = collecting(Arc::new(Mutex::new(Vec::new())));
        let queue = DiskQueue::open(&QueueConfig::new("plain"), dir.path(), false, handler)
            .await
            .unwrap();
        assert!(matches!(queue.has("x").await, Err(QueueError::NotUnique(_))));
    }
}
