//! Metric recording helpers for queue operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with queue-shaped
//! methods. Every method silently does nothing until
//! [`init_metrics`](super::init_metrics) has run, so library code can record
//! unconditionally.

use std::time::Duration;

use super::prometheus::{BATCH_DURATION, BOOSTS_TOTAL, QUEUE_DEPTH, QUEUE_WORKERS, TASKS_TOTAL};

/// Metrics collector for recording queue metrics.
///
/// # Example
///
/// ```ignore
/// use forge_queue::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.set_depth("push_update", 12);
/// collector.record_batch("push_update", 4, 1, Duration::from_millis(30));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the number of buffered tasks of a queue.
    pub fn set_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
    }

    /// Record the number of live workers of one kind (`baseline` or `boost`).
    pub fn set_workers(&self, queue: &str, kind: &str, count: usize) {
        if let Some(workers) = QUEUE_WORKERS.get() {
            workers.with_label_values(&[queue, kind]).set(count as f64);
        }

        tracing::trace!(queue = queue, kind = kind, count = count, "Updated worker metric");
    }

    /// Record one handler invocation.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue name
    /// * `handled` - Tasks processed successfully
    /// * `failed` - Tasks the handler reported as failed
    /// * `duration` - Time spent in the handler
    pub fn record_batch(&self, queue: &str, handled: usize, failed: usize, duration: Duration) {
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks
                .with_label_values(&[queue, "handled"])
                .inc_by(handled as f64);
            tasks
                .with_label_values(&[queue, "failed"])
                .inc_by(failed as f64);
        }

        if let Some(batch_duration) = BATCH_DURATION.get() {
            batch_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a task dropped after exhausting its attempts.
    pub fn record_discarded(&self, queue: &str) {
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&[queue, "discarded"]).inc();
        }
    }

    /// Record a push skipped because its identity was already in flight.
    pub fn record_duplicate(&self, queue: &str) {
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&[queue, "duplicate"]).inc();
        }
    }

    /// Record a worker boost.
    pub fn record_boost(&self, queue: &str) {
        if let Some(boosts) = BOOSTS_TOTAL.get() {
            boosts.with_label_values(&[queue]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_batch_and_export() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_batch("collector-queue", 3, 1, Duration::from_millis(12));
        collector.record_discarded("collector-queue");
        collector.record_duplicate("collector-queue");
        collector.record_boost("collector-queue");

        let text = export_metrics();
        assert!(text.contains("collector-queue"));
        assert!(text.contains("forge_queue_boosts_total"));
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.set_depth("gauge-queue", 42);
        collector.set_workers("gauge-queue", "baseline", 1);
        collector.set_workers("gauge-queue", "boost", 2);

        if let Some(depth) = QUEUE_DEPTH.get() {
            assert_eq!(depth.with_label_values(&["gauge-queue"]).get(), 42.0);
        }
        if let Some(workers) = QUEUE_WORKERS.get() {
            assert_eq!(workers.with_label_values(&["gauge-queue", "boost"]).get(), 2.0);
            assert_eq!(workers.with_label_values(&["gauge-queue", "baseline"]).get(), 1.0);
        }
    }
}
