//! Worker pool for running several queue workers in one process.
//!
//! Each worker runs as an independent tokio task over the shared queue and
//! resolver. Workers coordinate only through the store; the pool adds a
//! broadcast shutdown signal and aggregate statistics.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel, honoured between runs
//! - Worker errors stop the pool and surface from `join`/`shutdown`
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::job::JobStatus;
use super::queue::JobQueue;
use super::worker::{Worker, WorkerConfig, WorkerError};
use crate::metrics::MetricsCollector;
use crate::resolver::DependencyResolver;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    WorkerTask(String),

    /// A worker stopped on a queue or job state error.
    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Settings shared by every worker.
    pub worker: WorkerConfig,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            worker: WorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(600),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-worker settings.
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently resolving a job.
    pub active_workers: usize,
    /// Jobs that reached `finished`.
    pub jobs_completed: u64,
    /// Jobs that reached `finished_with_errors`.
    pub jobs_failed: u64,
    /// Average resolver duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Counters shared between the pool and its workers.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_outcome(&self, status: JobStatus, duration: Duration) {
        if status == JobStatus::Finished {
            self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Pool of workers processing jobs from one queue.
pub struct WorkerPool<R: DependencyResolver + 'static> {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    resolver: Arc<R>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<Result<u64, WorkerError>>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl<R: DependencyResolver + 'static> WorkerPool<R> {
    /// Creates a pool over an existing queue.
    pub fn new(config: WorkerPoolConfig, queue: Arc<JobQueue>, resolver: Arc<R>) -> Self {
        // Workers only need to observe one signal; lagging still ends the loop
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            resolver,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.resolver),
                self.config.worker.clone(),
            )
            .with_id(format!("worker-{}", i))
            .with_stats(Arc::clone(&self.stats));
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_tx = self.shutdown_tx.clone();
            let terminate_after_run = self.config.worker.terminate_after_run;

            let handle = tokio::spawn(async move {
                let result = worker.run_until_shutdown(&mut shutdown_rx).await;

                match &result {
                    Ok(processed) if terminate_after_run && *processed > 0 => {
                        info!(worker_id = %worker.id(), "Stopping pool after run");
                        let _ = shutdown_tx.send(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(worker_id = %worker.id(), error = %e, "Worker stopped on error");
                        let _ = shutdown_tx.send(());
                    }
                }

                result
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Waits for every worker to stop on its own. Returns the number of
    /// processed jobs.
    ///
    /// In terminate-after-run mode the first worker to process a job stops
    /// the whole pool; the others finish their current run. A worker error
    /// also stops the pool and is returned as `PoolError::Worker`.
    pub async fn join(&mut self) -> Result<u64, PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        let processed = self.collect_workers().await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);
        processed
    }

    /// Signals every worker to stop after its current run and waits for
    /// them.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within the
    /// configured timeout.
    pub async fn shutdown(&mut self) -> Result<u64, PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.shutdown_timeout;
        let result = tokio::time::timeout(timeout, self.collect_workers()).await;

        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(processed) => {
                info!("Worker pool shutdown complete");
                processed
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    async fn collect_workers(&mut self) -> Result<u64, PoolError> {
        let mut processed = 0;
        let mut failure = None;

        for handle in self.worker_handles.drain(..) {
            match handle.await {
                Ok(Ok(count)) => processed += count,
                Ok(Err(e)) => {
                    failure.get_or_insert(PoolError::Worker(e));
                }
                Err(e) => {
                    error!(error = %e, "Worker task panicked");
                    failure.get_or_insert(PoolError::WorkerTask(e.to_string()));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }

    /// Returns a sender that stops every worker after its current run.
    ///
    /// Lets a signal handler request shutdown while the pool is being
    /// joined.
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::{ResolverError, StoreError};
    use crate::resolver::{Resolution, ResolveRequest};
    use crate::scheduler::{Job, OutputSink};
    use crate::store::{JobStore, MemoryStore};

    /// Succeeds for every manifest except `"fail"`.
    struct EchoResolver;

    #[async_trait]
    impl DependencyResolver for EchoResolver {
        type Handle = ();

        async fn resolve(
            &self,
            request: &ResolveRequest,
            output: &mut dyn OutputSink,
        ) -> Result<Resolution<()>, ResolverError> {
            output.writeln(&format!("Resolving {}", request.job_id)).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;

            if request.manifest == "fail" {
                Ok(Resolution::failure(1, ()))
            } else {
                Ok(Resolution::success(format!("lock-{}", request.job_id), ()))
            }
        }
    }

    fn create_pool(config: WorkerPoolConfig) -> WorkerPool<EchoResolver> {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store, "jobs-queue", Duration::from_secs(600)));
        WorkerPool::new(config, queue, Arc::new(EchoResolver))
    }

    fn fast_worker(terminate_after_run: bool) -> WorkerConfig {
        WorkerConfig::new()
            .with_polling_frequency(Duration::from_millis(10))
            .with_terminate_after_run(terminate_after_run)
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_worker_config(WorkerConfig::new().with_max_retries_per_job(7))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.worker.max_retries_per_job, 7);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.total_processed(), 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_outcome(JobStatus::Finished, Duration::from_secs(10));
        stats.record_outcome(JobStatus::Finished, Duration::from_secs(20));
        stats.record_outcome(JobStatus::FinishedWithErrors, Duration::from_secs(5));
        stats.increment_active();
        stats.increment_active();
        stats.decrement_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert_eq!(pool_stats.average_job_duration, Duration::from_millis(11666));
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }

    #[tokio::test]
    async fn test_pool_stops_after_first_processed_job() {
        let mut pool = create_pool(WorkerPoolConfig::new(3).with_worker_config(fast_worker(true)));
        pool.queue().add_job(&Job::new("only", "{}")).await.expect("add");

        pool.start().expect("start");
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));
        let processed = tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("idle workers must stop with the pool")
            .expect("join");

        assert_eq!(processed, 1);
        assert!(!pool.is_running());
        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn test_pool_leaves_remaining_jobs_queued_after_run() {
        let mut pool = create_pool(WorkerPoolConfig::new(2).with_worker_config(fast_worker(true)));
        for id in ["a", "b", "c", "d"] {
            pool.queue().add_job(&Job::new(id, "{}")).await.expect("add");
        }

        pool.start().expect("start");
        let processed = pool.join().await.expect("join");

        assert!((1..=2).contains(&processed));
        assert_eq!(
            pool.queue().len().await.expect("len"),
            4 - processed as usize
        );
    }

    /// Store whose every operation fails.
    struct DownStore;

    #[async_trait]
    impl JobStore for DownStore {
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(down())
        }

        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }

        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(down())
        }

        async fn rpush(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(down())
        }

        async fn lpush(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(down())
        }

        async fn lpop(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }

        async fn blpop(&self, _: &str, _: Duration) -> Result<Option<String>, StoreError> {
            Err(down())
        }

        async fn lrem(&self, _: &str, _: &str) -> Result<usize, StoreError> {
            Err(down())
        }

        async fn llen(&self, _: &str) -> Result<usize, StoreError> {
            Err(down())
        }

        async fn lrange(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(down())
        }
    }

    fn down() -> StoreError {
        StoreError::ConnectionFailed("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_pool() {
        let queue = Arc::new(JobQueue::new(
            Arc::new(DownStore),
            "jobs-queue",
            Duration::from_secs(600),
        ));
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_worker_config(fast_worker(false)),
            queue,
            Arc::new(EchoResolver),
        );

        pool.start().expect("start");
        let result = tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool must stop on store errors");

        let err = result.expect_err("store outage must propagate");
        assert!(matches!(err, PoolError::Worker(_)));
        assert!(err.to_string().contains("connection refused"));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_until_shutdown() {
        let mut pool =
            create_pool(WorkerPoolConfig::new(3).with_worker_config(fast_worker(false)));
        pool.queue().add_job(&Job::new("ok1", "{}")).await.expect("add");
        pool.queue().add_job(&Job::new("bad", "fail")).await.expect("add");
        pool.queue().add_job(&Job::new("ok2", "{}")).await.expect("add");

        pool.start().expect("start");
        for _ in 0..200 {
            if pool.stats().total_processed() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let processed = pool.shutdown().await.expect("shutdown");

        assert_eq!(processed, 3);
        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 1);

        let bad = pool.queue().get_job("bad").await.expect("get").expect("present");
        assert_eq!(bad.status(), JobStatus::FinishedWithErrors);
        let ok = pool.queue().get_job("ok1").await.expect("get").expect("present");
        assert_eq!(ok.result_artifact(), "lock-ok1");
    }

    #[tokio::test]
    async fn test_shutdown_trigger_stops_joined_pool() {
        let mut pool =
            create_pool(WorkerPoolConfig::new(2).with_worker_config(fast_worker(false)));
        let trigger = pool.shutdown_trigger();

        pool.start().expect("start");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = trigger.send(());
        });

        let processed = pool.join().await.expect("join");
        assert_eq!(processed, 0);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_when_not_running() {
        let mut pool = create_pool(WorkerPoolConfig::default());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        assert!(matches!(pool.join().await, Err(PoolError::NotRunning)));
    }
}
