//! Two-phase graceful shutdown.
//!
//! Components register callbacks for two phases:
//!
//! - **shutdown**: stop taking new work and flush in-flight work to stable
//!   storage while connections and file handles are still open
//! - **terminate**: release connections and file handles
//!
//! Every shutdown callback completes before the first terminate callback
//! starts, including callbacks registered after shutdown began. Callbacks
//! within one phase run concurrently.

use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::pool::lock;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Process lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Running,
    ShuttingDown,
    Terminating,
    Terminated,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting_down",
            Phase::Terminating => "terminating",
            Phase::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Coordinates the shutdown and terminate phases of the process.
pub struct GracefulManager {
    shutdown_callbacks: Mutex<Vec<(String, Callback)>>,
    terminate_callbacks: Mutex<Vec<(String, Callback)>>,
    // Shutdown callbacks registered after shutdown began, still running.
    late_shutdown: Mutex<Vec<JoinHandle<()>>>,
    phase: watch::Sender<Phase>,
    transition: tokio::sync::Mutex<()>,
}

impl Default for GracefulManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulManager {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            shutdown_callbacks: Mutex::new(Vec::new()),
            terminate_callbacks: Mutex::new(Vec::new()),
            late_shutdown: Mutex::new(Vec::new()),
            phase,
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Registers a callback for the shutdown phase.
    ///
    /// If shutdown has already begun the callback is spawned immediately;
    /// terminate still waits for it.
    pub fn run_at_shutdown<F, Fut>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || callback().boxed());
        let mut callbacks = lock(&self.shutdown_callbacks);
        if self.phase() >= Phase::ShuttingDown {
            warn!(callback = %name, "Registered after shutdown started, running now");
            let running = tokio::spawn(callback());
            if self.phase() == Phase::ShuttingDown {
                lock(&self.late_shutdown).push(running);
            }
            return;
        }
        callbacks.push((name.to_string(), callback));
    }

    /// Registers a callback for the terminate phase.
    ///
    /// If termination has already begun the callback is spawned immediately.
    pub fn run_at_terminate<F, Fut>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || callback().boxed());
        let mut callbacks = lock(&self.terminate_callbacks);
        if self.phase() >= Phase::Terminating {
            warn!(callback = %name, "Registered after terminate started, running now");
            tokio::spawn(callback());
            return;
        }
        callbacks.push((name.to_string(), callback));
    }

    /// Runs every shutdown callback and waits for all of them.
    ///
    /// Later calls wait for a shutdown in progress and then return.
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        if self.phase() != Phase::Running {
            return;
        }

        let callbacks = {
            let mut callbacks = lock(&self.shutdown_callbacks);
            self.phase.send_replace(Phase::ShuttingDown);
            std::mem::take(&mut *callbacks)
        };

        info!(callbacks = callbacks.len(), "Graceful shutdown started");
        run_phase("shutdown", callbacks).await;
        info!("Graceful shutdown complete");
    }

    /// Runs every terminate callback, running shutdown first if needed.
    pub async fn terminate(&self) {
        self.shutdown().await;

        let _transition = self.transition.lock().await;
        if self.phase() >= Phase::Terminating {
            return;
        }

        // Late shutdown callbacks may register more of their kind while
        // they run; the phase only moves on once none is left.
        let callbacks = loop {
            let late = {
                let _registration = lock(&self.shutdown_callbacks);
                let late = std::mem::take(&mut *lock(&self.late_shutdown));
                if late.is_empty() {
                    let mut callbacks = lock(&self.terminate_callbacks);
                    self.phase.send_replace(Phase::Terminating);
                    break std::mem::take(&mut *callbacks);
                }
                late
            };
            debug!(callbacks = late.len(), "Waiting for late shutdown callbacks");
            for result in join_all(late).await {
                if let Err(e) = result {
                    warn!(error = %e, "Late shutdown callback failed");
                }
            }
        };

        info!(callbacks = callbacks.len(), "Terminating");
        run_phase("terminate", callbacks).await;
        self.phase.send_replace(Phase::Terminated);
        info!("Terminated");
    }

    /// Waits for Ctrl-C, then runs both phases.
    pub async fn shutdown_on_signal(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => warn!(error = %e, "Unable to listen for interrupt, shutting down"),
        }
        self.terminate().await;
    }
}

async fn run_phase(phase: &'static str, callbacks: Vec<(String, Callback)>) {
    let runs = callbacks.into_iter().map(|(name, callback)| async move {
        let start = Instant::now();
        callback().await;
        debug!(
            phase,
            callback = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Callback finished"
        );
    });
    join_all(runs).await;
}
