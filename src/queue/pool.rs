//! Worker pool draining a bounded in-memory buffer.
//!
//! Every backend forwards tasks into a `WorkerPool`, which fans them out to
//! concurrent workers. Each worker:
//!
//! 1. waits up to `block_timeout` for a first task (or for shutdown),
//! 2. greedily takes up to `batch_length - 1` more without blocking,
//! 3. calls the handler once with the batch,
//! 4. re-pushes the tasks the handler reports as failed.
//!
//! # Features
//!
//! - Backpressure: `push` blocks while the buffer is full
//! - Boost workers started when the buffer nears capacity, retired after
//!   `boost_timeout` of idleness
//! - Delivery cap: failing tasks are discarded after `max_attempts`
//! - Graceful shutdown: cancelled workers finish their current batch first

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::boost::{BoostController, BoostState};
use super::config::QueueConfig;
use super::task::{Envelope, Handler, Settlement, SettleHook, Task};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Role of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Started by `start`, lives until shutdown.
    Baseline,
    /// Started by a boost, retires after `boost_timeout` of idleness.
    Boost,
}

impl WorkerKind {
    /// Label used for this kind in metrics and worker ids.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Baseline => "baseline",
            WorkerKind::Boost => "boost",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Workers currently alive (baseline and boost).
    pub live_workers: usize,
    /// Current phase of the boost heuristic.
    pub boost_state: BoostState,
    /// Tasks waiting in the buffer and the retry list.
    pub buffered: usize,
    /// Tasks the handler processed successfully.
    pub tasks_handled: u64,
    /// Tasks the handler reported as failed (each report counts).
    pub tasks_failed: u64,
    /// Tasks dropped after exhausting their attempts.
    pub tasks_discarded: u64,
    /// Number of handler invocations.
    pub batches: u64,
}

/// Shared counters behind [`PoolStats`].
#[derive(Default)]
struct SharedPoolStats {
    tasks_handled: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_discarded: AtomicU64,
    batches: AtomicU64,
}

/// Bounded FIFO plus an unbounded side list for re-pushed failures.
///
/// Re-pushes land in the side list only when the channel is full, so a
/// worker never blocks on its own buffer.
struct Buffer<T> {
    tx: mpsc::Sender<Envelope<T>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope<T>>>,
    retry: Mutex<VecDeque<Envelope<T>>>,
}

impl<T: Task> Buffer<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            retry: Mutex::new(VecDeque::new()),
        }
    }

    async fn push(&self, envelope: Envelope<T>) {
        // The receiver lives as long as the buffer, so send only fails if
        // the pool itself is being dropped.
        if let Err(e) = self.tx.send(envelope).await {
            warn!(task = ?e.0.task, "Buffer closed, dropping task");
        }
    }

    fn try_push(&self, envelope: Envelope<T>) -> Result<(), Envelope<T>> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(env) | mpsc::error::TrySendError::Closed(env) => env,
        })
    }

    fn requeue(&self, envelope: Envelope<T>) {
        if let Err(envelope) = self.try_push(envelope) {
            lock(&self.retry).push_back(envelope);
        }
    }

    fn take_retries(&self, max: usize, batch: &mut Vec<Envelope<T>>) {
        let mut retry = lock(&self.retry);
        while batch.len() < max {
            match retry.pop_front() {
                Some(env) => batch.push(env),
                None => break,
            }
        }
    }

    /// Waits for at least one task, then drains up to `max` without blocking.
    async fn next_batch(&self, max: usize) -> Vec<Envelope<T>> {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::with_capacity(max);

        self.take_retries(max, &mut batch);
        if batch.is_empty() {
            match rx.recv().await {
                Some(env) => batch.push(env),
                None => return batch,
            }
        }
        while batch.len() < max {
            match rx.try_recv() {
                Ok(env) => batch.push(env),
                Err(_) => break,
            }
        }
        batch
    }

    /// Takes up to `max` tasks without waiting.
    async fn take_now(&self, max: usize) -> Vec<Envelope<T>> {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::new();
        self.take_retries(max, &mut batch);
        while batch.len() < max {
            match rx.try_recv() {
                Ok(env) => batch.push(env),
                Err(_) => break,
            }
        }
        batch
    }

    fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    fn len(&self) -> usize {
        (self.tx.max_capacity() - self.tx.capacity()) + lock(&self.retry).len()
    }

    fn fill_ratio(&self) -> f64 {
        let max = self.tx.max_capacity();
        (max - self.tx.capacity()) as f64 / max as f64
    }
}

/// Pool of workers processing tasks from a bounded buffer.
pub struct WorkerPool<T: Task> {
    name: String,
    config: QueueConfig,
    handler: Arc<dyn Handler<T>>,
    settle_hook: Option<Arc<dyn SettleHook<T>>>,
    buffer: Buffer<T>,
    boost: Mutex<BoostController>,
    live_workers: AtomicUsize,
    live_baseline: AtomicUsize,
    live_boost: AtomicUsize,
    next_worker_id: AtomicUsize,
    workers: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
}

/// Decrements the live count when a worker loop exits, even on panic.
struct LiveWorker<T: Task> {
    pool: Arc<WorkerPool<T>>,
    kind: WorkerKind,
}

impl<T: Task> Drop for LiveWorker<T> {
    fn drop(&mut self) {
        self.pool.live_workers.fetch_sub(1, Ordering::SeqCst);
        let live = self.pool.kind_counter(self.kind).fetch_sub(1, Ordering::SeqCst) - 1;
        if self.kind == WorkerKind::Boost {
            lock(&self.pool.boost).retire_one();
        }
        self.pool
            .metrics
            .set_workers(&self.pool.name, self.kind.as_str(), live);
    }
}

impl<T: Task> WorkerPool<T> {
    /// Creates a pool for the given queue configuration.
    ///
    /// Workers are not started until [`WorkerPool::start`] is called; pushes
    /// before that simply fill the buffer.
    pub fn new(
        config: &QueueConfig,
        handler: Arc<dyn Handler<T>>,
        settle_hook: Option<Arc<dyn SettleHook<T>>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            name: config.name.clone(),
            config: config.clone(),
            handler,
            settle_hook,
            buffer: Buffer::new(config.queue_length),
            boost: Mutex::new(BoostController::new(
                config.boost_workers,
                config.high_water_mark,
            )),
            live_workers: AtomicUsize::new(0),
            live_baseline: AtomicUsize::new(0),
            live_boost: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            workers: Mutex::new(JoinSet::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
            stats: SharedPoolStats::default(),
            metrics: MetricsCollector::new(),
        })
    }

    /// Name of the owning queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the baseline workers.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            queue = %self.name,
            workers = self.config.workers,
            boost_workers = self.config.boost_workers,
            "Worker pool started"
        );
        self.add_workers(self.config.workers, WorkerKind::Baseline);
        self.sample_boost();
    }

    /// Pushes a task, blocking while the buffer is full.
    pub async fn push(self: &Arc<Self>, envelope: Envelope<T>) {
        self.sample_boost();
        self.buffer.push(envelope).await;
        self.sample_boost();
        self.metrics.set_depth(&self.name, self.buffer.len());
    }

    /// Pushes a task only if the buffer has room, handing it back otherwise.
    pub fn try_push(self: &Arc<Self>, envelope: Envelope<T>) -> Result<(), Envelope<T>> {
        self.sample_boost();
        let result = self.buffer.try_push(envelope);
        self.metrics.set_depth(&self.name, self.buffer.len());
        result
    }

    /// Starts `n` additional workers bound to the pool's lifecycle.
    pub fn add_workers(self: &Arc<Self>, n: usize, kind: WorkerKind) {
        if self.is_cancelled() || n == 0 {
            return;
        }

        let mut workers = lock(&self.workers);
        for _ in 0..n {
            let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
            self.live_workers.fetch_add(1, Ordering::SeqCst);
            let live = self.kind_counter(kind).fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.set_workers(&self.name, kind.as_str(), live);

            let guard = LiveWorker {
                pool: Arc::clone(self),
                kind,
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.spawn(Arc::clone(self).run_worker(id, kind, shutdown_rx, guard));
        }
    }

    /// Signals every worker to stop after its current batch.
    pub fn cancel(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Returns true once [`WorkerPool::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Waits until every worker loop has exited.
    pub async fn wait(&self) {
        loop {
            let mut set = std::mem::take(&mut *lock(&self.workers));
            if set.is_empty() {
                break;
            }
            while let Some(result) = set.join_next().await {
                if let Err(e) = result {
                    error!(queue = %self.name, error = %e, "Worker task failed");
                }
            }
        }
    }

    /// Removes and returns everything still buffered.
    pub async fn drain_buffered(&self) -> Vec<Envelope<T>> {
        let drained = self.buffer.take_now(usize::MAX).await;
        self.metrics.set_depth(&self.name, self.buffer.len());
        drained
    }

    /// Hands every currently buffered task to the handler once.
    ///
    /// Used after the workers have stopped so an orderly shutdown of a
    /// non-durable backend does not lose buffered work. Tasks that fail
    /// again stay buffered.
    pub async fn flush(&self) -> usize {
        let mut remaining = self.buffer.len();
        let mut flushed = 0;

        while remaining > 0 {
            let batch = self
                .buffer
                .take_now(self.config.batch_length.min(remaining))
                .await;
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            flushed += batch.len();
            self.process_batch("flush", batch).await;
        }

        if flushed > 0 {
            info!(queue = %self.name, flushed, "Flushed buffered tasks");
        }
        flushed
    }

    /// Number of tasks waiting in the buffer and the retry list.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the bounded buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Number of live workers.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Number of live workers of one kind.
    pub fn live_workers_of(&self, kind: WorkerKind) -> usize {
        self.kind_counter(kind).load(Ordering::SeqCst)
    }

    fn kind_counter(&self, kind: WorkerKind) -> &AtomicUsize {
        match kind {
            WorkerKind::Baseline => &self.live_baseline,
            WorkerKind::Boost => &self.live_boost,
        }
    }

    /// Current phase of the boost heuristic.
    pub fn boost_state(&self) -> BoostState {
        lock(&self.boost).state()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_workers: self.live_workers(),
            boost_state: self.boost_state(),
            buffered: self.buffer.len(),
            tasks_handled: self.stats.tasks_handled.load(Ordering::SeqCst),
            tasks_failed: self.stats.tasks_failed.load(Ordering::SeqCst),
            tasks_discarded: self.stats.tasks_discarded.load(Ordering::SeqCst),
            batches: self.stats.batches.load(Ordering::SeqCst),
        }
    }

    fn sample_boost(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst) || self.is_cancelled() {
            return;
        }

        let boost = lock(&self.boost).sample(self.buffer.fill_ratio(), self.live_workers());
        if boost > 0 {
            info!(
                queue = %self.name,
                boost_workers = boost,
                buffered = self.buffer.len(),
                "Buffer near capacity, boosting workers"
            );
            self.metrics.record_boost(&self.name);
            self.add_workers(boost, WorkerKind::Boost);
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        id: usize,
        kind: WorkerKind,
        mut shutdown_rx: watch::Receiver<bool>,
        _live: LiveWorker<T>,
    ) {
        let worker_id = format!("{}-{}-{}", self.name, kind, id);
        debug!(worker_id = %worker_id, "Worker started");

        let mut last_active = Instant::now();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                next = tokio::time::timeout(
                    self.config.block_timeout,
                    self.buffer.next_batch(self.config.batch_length),
                ) => next,
            };

            match next {
                Ok(batch) if !batch.is_empty() => {
                    self.process_batch(&worker_id, batch).await;
                    last_active = Instant::now();
                }
                Ok(_) => break,
                Err(_) => {
                    if kind == WorkerKind::Boost
                        && last_active.elapsed() >= self.config.boost_timeout
                    {
                        info!(worker_id = %worker_id, "Boost worker idle, retiring");
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %worker_id, "Worker stopped");
    }

    async fn process_batch(&self, worker_id: &str, mut batch: Vec<Envelope<T>>) {
        let start = Instant::now();
        for envelope in &mut batch {
            envelope.attempts += 1;
        }

        let tasks: Vec<T> = batch.iter().map(|e| e.task.clone()).collect();
        debug!(worker_id = %worker_id, batch_len = tasks.len(), "Handling batch");

        let failed = match AssertUnwindSafe(self.handler.handle(tasks))
            .catch_unwind()
            .await
        {
            Ok(failed) => failed,
            Err(_) => {
                error!(
                    worker_id = %worker_id,
                    batch_len = batch.len(),
                    "Handler panicked, treating whole batch as failed"
                );
                batch.iter().map(|e| e.task.clone()).collect()
            }
        };

        let (handled, failed, unknown) = split_failures(batch, failed);
        if unknown > 0 {
            warn!(
                worker_id = %worker_id,
                unknown,
                "Handler reported failed tasks that were not in its batch; ignoring them"
            );
        }

        self.stats.batches.fetch_add(1, Ordering::SeqCst);
        self.stats
            .tasks_handled
            .fetch_add(handled.len() as u64, Ordering::SeqCst);
        self.stats
            .tasks_failed
            .fetch_add(failed.len() as u64, Ordering::SeqCst);
        self.metrics
            .record_batch(&self.name, handled.len(), failed.len(), start.elapsed());

        for envelope in &handled {
            self.settle(envelope, Settlement::Handled).await;
        }

        for envelope in failed {
            if self.config.max_attempts > 0 && envelope.attempts >= self.config.max_attempts {
                error!(
                    worker_id = %worker_id,
                    task = ?envelope.task,
                    attempts = envelope.attempts,
                    "Task failed too many times, discarding"
                );
                self.stats.tasks_discarded.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_discarded(&self.name);
                self.settle(&envelope, Settlement::Discarded).await;
            } else {
                debug!(
                    worker_id = %worker_id,
                    attempts = envelope.attempts,
                    "Re-pushing failed task"
                );
                self.buffer.requeue(envelope);
            }
        }

        self.metrics.set_depth(&self.name, self.buffer.len());
    }

    async fn settle(&self, envelope: &Envelope<T>, settlement: Settlement) {
        if let Some(hook) = &self.settle_hook {
            hook.settle(envelope, settlement).await;
        }
    }
}

/// Splits a delivered batch into handled and failed envelopes.
///
/// Returns `(handled, failed, unknown)` where `unknown` counts reported
/// tasks that matched nothing in the batch.
fn split_failures<T: PartialEq>(
    batch: Vec<Envelope<T>>,
    failed: Vec<T>,
) -> (Vec<Envelope<T>>, Vec<Envelope<T>>, usize) {
    let mut remaining: Vec<Option<Envelope<T>>> = batch.into_iter().map(Some).collect();
    let mut failed_envelopes = Vec::with_capacity(failed.len());
    let mut unknown = 0;

    for task in failed {
        let slot = remaining
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|e| e.task == task));
        match slot.and_then(Option::take) {
            Some(envelope) => failed_envelopes.push(envelope),
            None => unknown += 1,
        }
    }

    (
        remaining.into_iter().flatten().collect(),
        failed_envelopes,
        unknown,
    )
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
#[cfg(test)]
pub(crate) async fn eventually(timeout: std::time::Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
