//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by lockqueue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all lockqueue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of job claims, including re-claims after recovery.
pub static JOBS_CLAIMED: OnceLock<Counter> = OnceLock::new();

/// Total number of jobs reaching a terminal status, labeled by status.
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Recovery pass outcomes, labeled by action.
pub static RECOVERY_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of ids on a list, labeled by list name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being resolved in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Resolver invocation duration in seconds.
pub static RESOLVE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of active workers in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Until this runs, every recording method on
/// [`MetricsCollector`](super::MetricsCollector) is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_claimed = Counter::new("lockqueue_jobs_claimed_total", "Total number of job claims")?;

    let jobs_finished = CounterVec::new(
        Opts::new(
            "lockqueue_jobs_finished_total",
            "Total number of jobs reaching a terminal status",
        ),
        &["status"],
    )?;

    let recovery_total = CounterVec::new(
        Opts::new(
            "lockqueue_recovery_total",
            "Backup list entries handled by the recovery pass",
        ),
        &["action"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("lockqueue_queue_depth", "Number of job ids on a list"),
        &["queue"],
    )?;

    // Worker metrics
    let jobs_in_progress = Gauge::new(
        "lockqueue_jobs_in_progress",
        "Number of jobs currently being resolved",
    )?;

    let resolve_duration = Histogram::with_opts(
        HistogramOpts::new(
            "lockqueue_resolve_duration_seconds",
            "Resolver invocation duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let active_workers = Gauge::new("lockqueue_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_claimed.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(recovery_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(resolve_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_CLAIMED.set(jobs_claimed);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = RECOVERY_TOTAL.set(recovery_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = RESOLVE_DURATION.set(resolve_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
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
