//! Admission limit and waiting-time estimate for new submissions.
//!
//! Both only read the main queue length; neither touches queue state.

use std::time::Duration;

use serde::Serialize;

use super::queue::{JobQueue, QueueError};

/// Rejects submissions once the main queue holds `workers * max_factor` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLengthLimit {
    workers: usize,
    max_factor: usize,
}

impl QueueLengthLimit {
    pub fn new(workers: usize, max_factor: usize) -> Self {
        Self {
            workers,
            max_factor,
        }
    }

    /// Maximum number of queued jobs.
    pub fn maximum(&self) -> usize {
        self.workers.saturating_mul(self.max_factor)
    }

    /// Whether a queue of `queue_len` jobs accepts one more.
    pub fn admits(&self, queue_len: usize) -> bool {
        queue_len < self.maximum()
    }

    /// Reads the current queue length and applies the limit.
    pub async fn check(&self, queue: &JobQueue) -> Result<bool, QueueError> {
        Ok(self.admits(queue.len().await?))
    }
}

/// Approximate waiting time for a job submitted now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitEstimate {
    /// Whole seconds.
    pub approx_waiting_time: u64,
    pub approx_waiting_time_human: String,
    pub number_of_jobs_in_queue: usize,
    pub number_of_workers: usize,
}

impl WaitEstimate {
    /// Estimates `queued * average_job / workers`, truncated to whole seconds.
    pub fn new(queued: usize, average_job: Duration, workers: usize) -> Self {
        let divisor = workers.max(1) as u128;
        let seconds = (queued as u128 * average_job.as_millis()) / divisor / 1000;
        let seconds = u64::try_from(seconds).unwrap_or(u64::MAX);

        Self {
            approx_waiting_time: seconds,
            approx_waiting_time_human: human_duration(seconds),
            number_of_jobs_in_queue: queued,
            number_of_workers: workers,
        }
    }

    /// Builds an estimate from the current queue length.
    pub async fn for_queue(
        queue: &JobQueue,
        average_job: Duration,
        workers: usize,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(queue.len().await?, average_job, workers))
    }
}

/// Formats seconds as `"{m} min {s} s"`.
fn human_duration(seconds: u64) -> String {
    format!("{} min {} s", seconds / 60, seconds % 60)
}
