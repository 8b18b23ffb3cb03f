//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by forge-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all forge-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of buffered tasks, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of live workers, labeled by queue name and worker kind.
pub static QUEUE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Total tasks by outcome (handled, failed, discarded, duplicate), labeled by queue.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total boosts triggered, labeled by queue name.
pub static BOOSTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler batch duration in seconds, labeled by queue name.
pub static BATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Until it is,
/// every recording call is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = GaugeVec::new(
        Opts::new("forge_queue_depth", "Number of tasks buffered in memory"),
        &["queue"],
    )?;

    let queue_workers = GaugeVec::new(
        Opts::new("forge_queue_workers", "Number of live workers"),
        &["queue", "kind"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("forge_queue_tasks_total", "Total tasks by outcome"),
        &["queue", "outcome"],
    )?;

    let boosts_total = CounterVec::new(
        Opts::new("forge_queue_boosts_total", "Total worker boosts triggered"),
        &["queue"],
    )?;

    let batch_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "forge_queue_batch_duration_seconds",
            "Handler batch duration in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["queue"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_workers.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(boosts_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_WORKERS.set(queue_workers);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = BOOSTS_TOTAL.set(boosts_total);
    let _ = BATCH_DURATION.set(batch_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["export-queue", "handled"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("forge_queue_tasks_total"));
        }
    }
}
