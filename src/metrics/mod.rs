//! Metrics module for Prometheus-based monitoring.
//!
//! Queues record their buffer depth, live workers, task outcomes, boosts and
//! handler batch durations here.
//!
//! # Example
//!
//! ```ignore
//! use forge_queue::metrics::{init_metrics, export_metrics};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    BATCH_DURATION, BOOSTS_TOTAL, QUEUE_DEPTH, QUEUE_WORKERS, REGISTRY, TASKS_TOTAL,
};
