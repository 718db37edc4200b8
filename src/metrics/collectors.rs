//! Recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_CLAIMED, JOBS_FINISHED, JOBS_IN_PROGRESS, QUEUE_DEPTH, RECOVERY_TOTAL,
    RESOLVE_DURATION,
};
use crate::scheduler::JobStatus;

/// Metrics collector for queue and worker activity.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has
/// run, so library code can record unconditionally.
///
/// # Example
///
/// ```ignore
/// use lockqueue::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_claim();
/// collector.update_queue_depth("jobs-queue", 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one job claim.
    pub fn record_claim(&self) {
        if let Some(claimed) = JOBS_CLAIMED.get() {
            claimed.inc();
        }

        tracing::trace!("Recorded claim metric");
    }

    /// Record a job reaching `status`, after a resolver run of
    /// `duration_secs`.
    pub fn record_finished(&self, status: JobStatus, duration_secs: f64) {
        let status = status.to_string();

        if let Some(finished) = JOBS_FINISHED.get() {
            finished.with_label_values(&[status.as_str()]).inc();
        }

        if let Some(duration) = RESOLVE_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            status = %status,
            duration_secs = duration_secs,
            "Recorded finished job metric"
        );
    }

    /// Record one recovery pass outcome.
    ///
    /// # Arguments
    ///
    /// * `action` - Outcome label (e.g., "requeued", "deferred", "abandoned")
    pub fn record_recovery(&self, action: &str) {
        if let Some(recovery) = RECOVERY_TOTAL.get() {
            recovery.with_label_values(&[action]).inc();
        }

        tracing::trace!(action = action, "Recorded recovery metric");
    }

    /// Update the depth gauge of a list.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
