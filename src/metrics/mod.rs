//! Metrics module for Prometheus-based monitoring.
//!
//! Counters and gauges for job claims, terminal statuses, recovery pass
//! outcomes, list depths and in-flight work.
//!
//! # Example
//!
//! ```ignore
//! use lockqueue::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_recovery("requeued");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKERS, JOBS_CLAIMED, JOBS_FINISHED, JOBS_IN_PROGRESS, QUEUE_DEPTH, RECOVERY_TOTAL,
    REGISTRY, RESOLVE_DURATION,
};
