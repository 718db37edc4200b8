//! Two-list job queue over a [`JobStore`].
//!
//! This module provides the distributed job queue shared by submitters and
//! workers. It supports:
//!
//! - TTL-bounded job records, refreshed on every write
//! - FIFO delivery from the main list
//! - Claim registration on a backup list for crash detection
//! - Priority redelivery of stale claims to the head of the main list
//!
//! # Key Structure
//!
//! - `{queue_key}`: Main list of job ids awaiting a claim
//! - `{queue_key}_backup`: Ids believed to be claimed by some worker
//! - `{queue_key}:jobs:{id}`: Serialized job record
//!
//! These keys are stable: external tooling reads job records directly by id.
//!
//! # Reliability
//!
//! A job id sits on at most one of the two lists at a time. The lists are
//! weak references: the record lives and expires independently, and a list
//! entry whose record is gone is dropped by whoever pops it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::job::Job;
use crate::error::StoreError;
use crate::store::JobStore;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Store operation failed.
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize or deserialize a job record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job queue backed by a main and a backup id list.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    /// Name of the main list, also the key namespace.
    queue_key: String,
    /// Name of the backup list.
    backup_key: String,
    /// Time-to-live applied on every record write.
    ttl: Duration,
}

impl JobQueue {
    /// Creates a queue over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Backing store shared with other queue instances
    /// * `queue_key` - Name of the main list, used as prefix for all keys
    /// * `ttl` - Lifetime of a job record after its last write
    pub fn new(store: Arc<dyn JobStore>, queue_key: &str, ttl: Duration) -> Self {
        Self {
            store,
            queue_key: queue_key.to_string(),
            backup_key: format!("{}_backup", queue_key),
            ttl,
        }
    }

    /// Persists a new job and appends its id to the tail of the main list.
    ///
    /// The record is written first, so once this returns the job is both
    /// queryable and enqueued.
    pub async fn add_job(&self, job: &Job) -> Result<(), QueueError> {
        self.update_job(job).await?;
        self.store.rpush(&self.queue_key, job.id()).await?;
        Ok(())
    }

    /// Fetches a job by its id. Unknown and expired ids are `None`.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let data = self.store.get(&self.job_key(job_id)).await?;

        match data {
            Some(s) => {
                let job: Job = serde_json::from_str(&s)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Removes a job from the main list and deletes its record.
    ///
    /// The backup list is left alone; the recovery pass drops entries whose
    /// record no longer exists.
    pub async fn delete_job(&self, job: &Job) -> Result<(), QueueError> {
        self.store.lrem(&self.queue_key, job.id()).await?;
        self.store.del(&self.job_key(job.id())).await?;
        Ok(())
    }

    /// Pops the next job id from the main list, waiting up to `timeout`, and
    /// returns its record.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(job))` if a job was dequeued and its record still exists
    /// - `Ok(None)` if the timeout expired, or the popped id had no record
    pub async fn get_next_job(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        match self.store.blpop(&self.queue_key, timeout).await? {
            Some(job_id) => self.get_job(&job_id).await,
            None => Ok(None),
        }
    }

    /// Re-persists a job record without touching either list, resetting its
    /// TTL to the full configured value.
    pub async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        self.store
            .set_ex(&self.job_key(job.id()), &serialized, self.ttl)
            .await?;
        Ok(())
    }

    /// Returns the number of jobs in the main queue.
    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.llen(&self.queue_key).await?)
    }

    /// Returns whether the main queue is empty.
    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Returns the number of ids on the backup list.
    pub async fn backup_len(&self) -> Result<usize, QueueError> {
        Ok(self.store.llen(&self.backup_key).await?)
    }

    /// Ids waiting on the main list, head first.
    pub async fn pending_ids(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.store.lrange(&self.queue_key).await?)
    }

    /// Ids on the backup list, head first.
    pub async fn backup_ids(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.store.lrange(&self.backup_key).await?)
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending_jobs, backup_jobs) = tokio::try_join!(self.len(), self.backup_len())?;

        Ok(QueueStats {
            queue_name: self.queue_key.clone(),
            pending_jobs,
            backup_jobs,
        })
    }

    /// Store key of a job record.
    pub fn job_key(&self, job_id: &str) -> String {
        format!("{}:jobs:{}", self.queue_key, job_id)
    }

    /// Returns the main list name.
    pub fn queue_name(&self) -> &str {
        &self.queue_key
    }

    /// Returns the backup list name.
    pub fn backup_name(&self) -> &str {
        &self.backup_key
    }

    /// Returns the record TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Pops the head of the main list without blocking.
    pub(crate) async fn pop_next_id(&self) -> Result<Option<String>, QueueError> {
        Ok(self.store.lpop(&self.queue_key).await?)
    }

    /// Puts an id back at the head of the main list, ahead of fresh work.
    pub(crate) async fn requeue_front(&self, job_id: &str) -> Result<(), QueueError> {
        self.store.lpush(&self.queue_key, job_id).await?;
        Ok(())
    }

    /// Pops the oldest claim from the backup list.
    pub(crate) async fn pop_backup(&self) -> Result<Option<String>, QueueError> {
        Ok(self.store.lpop(&self.backup_key).await?)
    }

    /// Registers a claim at the tail of the backup list.
    pub(crate) async fn push_backup(&self, job_id: &str) -> Result<(), QueueError> {
        self.store.rpush(&self.backup_key, job_id).await?;
        Ok(())
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Name of the main queue.
    pub queue_name: String,
    /// Number of jobs waiting for a claim.
    pub pending_jobs: usize,
    /// Number of claims registered on the backup list.
    pub backup_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of ids on both lists.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.backup_jobs
    }
}
