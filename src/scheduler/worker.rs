//! Queue worker: recovery pass, claim, resolve, finalize.
//!
//! One [`Worker::run`] call performs a single cycle:
//!
//! 1. Sleep for the polling interval
//! 2. Inspect one entry on the backup list and redeliver it if its claim
//!    looks abandoned
//! 3. Pop the next id from the main list; stop if there is none
//! 4. Skip jobs that are already terminal and go back to step 1 without
//!    sleeping
//! 5. Claim the job: status `processing`, retries + 1, persist, register the
//!    id on the backup list
//! 6. Run the resolver through a [`JobOutput`] bound to the job
//! 7. Persist the final record
//!
//! Claims are never released explicitly. A finished job's id stays on the
//! backup list until a later recovery pass redelivers it and the claim step
//! skips it as terminal, or its record expires and the pass drops it.
//!
//! There is no lease renewal: a worker that is slow rather than dead can have
//! its job redelivered once the retry wait elapses, so resolvers must be
//! idempotent.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobError, JobStatus};
use super::output::{JobOutput, OutputSink};
use super::queue::{JobQueue, QueueError};
use super::worker_pool::SharedPoolStats;
use crate::error::ResolverError;
use crate::metrics::MetricsCollector;
use crate::resolver::{DependencyResolver, Resolution, ResolveRequest};

/// Exit code reported when the resolver crashed instead of returning.
pub const CRASH_EXIT_CODE: i32 = 2;

const CRASH_NOTE: &str = "\nAn error occurred during resolving process.";
const FINISHED_NOTE: &str = "\nFinished resolving.";
const MISSING_ARTIFACT_NOTE: &str = "\nResolver reported success but produced no lock file.";

/// Errors that abort a worker run.
///
/// Resolver failures are not among them: those end the job, not the run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Job state error: {0}")]
    Job(#[from] JobError),
}

/// Worker behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep at the start of every run.
    pub polling_frequency: Duration,
    /// Claims after which a stale job is abandoned instead of redelivered.
    pub max_retries_per_job: u32,
    /// Age of a claim after which its worker is presumed dead.
    pub seconds_to_wait_before_retry: Duration,
    /// Stop after the first processed job.
    pub terminate_after_run: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            polling_frequency: Duration::from_secs(5),
            max_retries_per_job: 3,
            seconds_to_wait_before_retry: Duration::from_secs(120),
            terminate_after_run: true,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_polling_frequency(mut self, polling_frequency: Duration) -> Self {
        self.polling_frequency = polling_frequency;
        self
    }

    pub fn with_max_retries_per_job(mut self, max_retries: u32) -> Self {
        self.max_retries_per_job = max_retries;
        self
    }

    pub fn with_seconds_to_wait_before_retry(mut self, wait: Duration) -> Self {
        self.seconds_to_wait_before_retry = wait;
        self
    }

    pub fn with_terminate_after_run(mut self, terminate: bool) -> Self {
        self.terminate_after_run = terminate;
        self
    }
}

/// State of a claim found on the backup list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// No processing start time recorded.
    Untimed,
    /// Younger than the retry wait; its worker may still be running.
    Live,
    /// Stale, and the job has used up its claims.
    Exhausted,
    /// Stale and eligible for redelivery.
    Stale,
}

/// Classifies a claimed job at time `now`.
pub fn assess_claim(job: &Job, now: DateTime<Utc>, config: &WorkerConfig) -> ClaimState {
    let Some(start) = job.processing_start_time() else {
        return ClaimState::Untimed;
    };

    let wait = i64::try_from(config.seconds_to_wait_before_retry.as_secs()).unwrap_or(i64::MAX);
    if now.signed_duration_since(start).num_seconds() < wait {
        return ClaimState::Live;
    }

    if job.retries() >= config.max_retries_per_job {
        ClaimState::Exhausted
    } else {
        ClaimState::Stale
    }
}

/// What the recovery pass did with the backup entry it popped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The backup list was empty.
    Empty,
    /// The job record no longer exists.
    Dropped(String),
    /// The job has no processing start time and was dropped.
    Untimed(String),
    /// Put back at the backup tail to be checked again later.
    Deferred(String),
    /// Abandoned after too many claims; the record expires on its own.
    Abandoned(String),
    /// Redelivered to the head of the main list.
    Requeued(String),
}

impl RecoveryAction {
    /// Metric label for this action.
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::Empty => "empty",
            RecoveryAction::Dropped(_) => "dropped",
            RecoveryAction::Untimed(_) => "untimed",
            RecoveryAction::Deferred(_) => "deferred",
            RecoveryAction::Abandoned(_) => "abandoned",
            RecoveryAction::Requeued(_) => "requeued",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            RecoveryAction::Empty => None,
            RecoveryAction::Dropped(id)
            | RecoveryAction::Untimed(id)
            | RecoveryAction::Deferred(id)
            | RecoveryAction::Abandoned(id)
            | RecoveryAction::Requeued(id) => Some(id),
        }
    }
}

/// Summary of a job processed by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: i32,
    pub duration: Duration,
}

/// What one [`Worker::run`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// One entry per recovery pass; a run makes several when it skips
    /// terminal jobs.
    pub recovery: Vec<RecoveryAction>,
    /// Terminal jobs popped from the main list and skipped.
    pub skipped: Vec<String>,
    pub processed: Option<ProcessedJob>,
}

/// A finished job together with the resolver's exit code and handle.
///
/// The handle is `None` when the resolver crashed.
#[derive(Debug, Clone)]
pub struct ResolvingResult<H> {
    job: Job,
    exit_code: i32,
    handle: Option<H>,
}

impl<H> ResolvingResult<H> {
    pub fn new(job: Job, exit_code: i32, handle: Option<H>) -> Self {
        Self {
            job,
            exit_code,
            handle,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

/// A single queue worker.
pub struct Worker<R: DependencyResolver> {
    id: String,
    queue: Arc<JobQueue>,
    resolver: Arc<R>,
    config: WorkerConfig,
    metrics: MetricsCollector,
    stats: Option<Arc<SharedPoolStats>>,
    last_result: Mutex<Option<ResolvingResult<R::Handle>>>,
}

impl<R: DependencyResolver> Worker<R> {
    pub fn new(queue: Arc<JobQueue>, resolver: Arc<R>, config: WorkerConfig) -> Self {
        Self {
            id: format!("worker-{}", std::process::id()),
            queue,
            resolver,
            config,
            metrics: MetricsCollector::new(),
            stats: None,
            last_result: Mutex::new(None),
        }
    }

    /// Sets the identifier used in log lines.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Result of the latest job processed by [`run`](Self::run).
    pub fn last_result(&self) -> Option<ResolvingResult<R::Handle>>
    where
        R::Handle: Clone,
    {
        self.lock_last_result().clone()
    }

    /// Takes the result of the latest processed job, leaving `None`.
    pub fn take_last_result(&self) -> Option<ResolvingResult<R::Handle>> {
        self.lock_last_result().take()
    }

    fn lock_last_result(&self) -> std::sync::MutexGuard<'_, Option<ResolvingResult<R::Handle>>> {
        self.last_result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Performs one worker cycle.
    ///
    /// Returns once a job has been processed, or once the main list yields
    /// nothing to process. Store failures abort the run.
    pub async fn run(&self, polling_frequency: Duration) -> Result<RunReport, WorkerError> {
        let mut report = RunReport::default();
        let mut pause = polling_frequency;

        loop {
            tokio::time::sleep(pause).await;

            report.recovery.push(self.recover_stale_claim().await?);

            let Some(job) = self.next_job().await? else {
                return Ok(report);
            };

            if job.is_finished() {
                debug!(
                    worker_id = %self.id,
                    job_id = %job.id(),
                    status = %job.status(),
                    "Skipping job that is already finished"
                );
                report.skipped.push(job.id().to_string());
                pause = Duration::ZERO;
                continue;
            }

            report.processed = Some(self.process(job).await?);
            return Ok(report);
        }
    }

    /// Calls [`run`](Self::run) until `shutdown` fires, or, in
    /// terminate-after-run mode, until a job has been processed.
    ///
    /// The signal is only checked between runs. Returns the number of jobs
    /// processed.
    pub async fn run_until_shutdown(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<u64, WorkerError> {
        info!(worker_id = %self.id, "Worker started");
        let mut processed = 0;

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let report = self.run(self.config.polling_frequency).await?;
            self.report_depth().await;

            if report.processed.is_some() {
                processed += 1;

                if self.config.terminate_after_run {
                    info!(worker_id = %self.id, "Terminating worker after run");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, processed, "Worker stopped");
        Ok(processed)
    }

    /// Inspects the oldest entry on the backup list.
    ///
    /// Claims younger than the retry wait go back to the backup tail. Older
    /// ones are redelivered to the head of the main list, unless the job has
    /// exhausted its claims, in which case it is left on neither list.
    pub async fn recover_stale_claim(&self) -> Result<RecoveryAction, WorkerError> {
        let Some(job_id) = self.queue.pop_backup().await? else {
            return Ok(RecoveryAction::Empty);
        };

        let action = match self.queue.get_job(&job_id).await? {
            None => {
                debug!(worker_id = %self.id, job_id = %job_id, "Dropping claim without record");
                RecoveryAction::Dropped(job_id)
            }
            Some(job) => match assess_claim(&job, Utc::now(), &self.config) {
                ClaimState::Untimed => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        "Dropping claim without processing start time"
                    );
                    RecoveryAction::Untimed(job_id)
                }
                ClaimState::Live => {
                    self.queue.push_backup(&job_id).await?;
                    RecoveryAction::Deferred(job_id)
                }
                ClaimState::Exhausted => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        retries = job.retries(),
                        max_retries = self.config.max_retries_per_job,
                        "Abandoning job after too many claims"
                    );
                    RecoveryAction::Abandoned(job_id)
                }
                ClaimState::Stale => {
                    self.queue.requeue_front(&job_id).await?;
                    info!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        retries = job.retries(),
                        "Redelivering stale claim"
                    );
                    RecoveryAction::Requeued(job_id)
                }
            },
        };

        self.metrics.record_recovery(action.label());
        Ok(action)
    }

    /// Resolves `job` outside the queue.
    ///
    /// The job is moved to `processing` and concluded exactly as in a
    /// worker run, but neither list is touched and nothing is persisted.
    pub async fn resolve(
        &self,
        mut job: Job,
        output: &mut dyn OutputSink,
    ) -> Result<ResolvingResult<R::Handle>, WorkerError> {
        job.start_processing(Utc::now())?;

        let request = ResolveRequest::from_job(&job);
        let resolved = self.invoke(&request, output).await;
        let (exit_code, handle) = self.conclude(&mut job, resolved)?;

        Ok(ResolvingResult::new(job, exit_code, handle))
    }

    async fn next_job(&self) -> Result<Option<Job>, WorkerError> {
        let Some(job_id) = self.queue.pop_next_id().await? else {
            return Ok(None);
        };

        let job = self.queue.get_job(&job_id).await?;
        if job.is_none() {
            debug!(worker_id = %self.id, job_id = %job_id, "Popped job without record");
        }

        Ok(job)
    }

    async fn process(&self, mut job: Job) -> Result<ProcessedJob, WorkerError> {
        job.start_processing(Utc::now())?;
        job.increment_retries();
        self.queue.update_job(&job).await?;
        self.queue.push_backup(job.id()).await?;

        info!(
            worker_id = %self.id,
            job_id = %job.id(),
            attempt = job.retries(),
            "Processing job"
        );
        self.metrics.record_claim();
        self.metrics.inc_jobs_in_progress();
        if let Some(stats) = &self.stats {
            stats.increment_active();
        }

        let start = Instant::now();
        let request = ResolveRequest::from_job(&job);
        let resolved = {
            let mut output = JobOutput::new(&mut job, self.queue.as_ref());
            self.invoke(&request, &mut output).await
        };
        let concluded = self.conclude(&mut job, resolved);
        let duration = start.elapsed();

        self.metrics.dec_jobs_in_progress();
        if let Some(stats) = &self.stats {
            stats.decrement_active();
        }
        let (exit_code, handle) = concluded?;

        self.queue.update_job(&job).await?;

        self.metrics
            .record_finished(job.status(), duration.as_secs_f64());
        if let Some(stats) = &self.stats {
            stats.record_outcome(job.status(), duration);
        }
        info!(
            worker_id = %self.id,
            job_id = %job.id(),
            status = %job.status(),
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "Finished working on job"
        );

        let processed = ProcessedJob {
            job_id: job.id().to_string(),
            status: job.status(),
            exit_code,
            duration,
        };
        *self.lock_last_result() = Some(ResolvingResult::new(job, exit_code, handle));

        Ok(processed)
    }

    /// Runs the resolver, converting a panic into an error.
    async fn invoke(
        &self,
        request: &ResolveRequest,
        output: &mut dyn OutputSink,
    ) -> Result<Resolution<R::Handle>, ResolverError> {
        match AssertUnwindSafe(self.resolver.resolve(request, output))
            .catch_unwind()
            .await
        {
            Ok(resolved) => resolved,
            Err(payload) => Err(ResolverError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Applies a resolver outcome to the job and appends the closing note.
    fn conclude(
        &self,
        job: &mut Job,
        resolved: Result<Resolution<R::Handle>, ResolverError>,
    ) -> Result<(i32, Option<R::Handle>), JobError> {
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id(),
                    error = %e,
                    source = ?std::error::Error::source(&e),
                    "Error during resolving process"
                );
                job.append_output(CRASH_NOTE);
                job.finish_with_errors()?;
                return Ok((CRASH_EXIT_CODE, None));
            }
        };

        if let Some(diagnostics) = &resolution.diagnostics {
            job.append_output("\n");
            job.append_output(diagnostics);
        }

        let exit_code = resolution.exit_code;
        match (resolution.is_success(), resolution.artifact) {
            (true, Some(artifact)) => job.finish(artifact)?,
            (true, None) => {
                if resolution.diagnostics.is_none() {
                    job.append_output(MISSING_ARTIFACT_NOTE);
                }
                job.finish_with_errors()?;
            }
            (false, _) => job.finish_with_errors()?,
        }

        job.append_output(FINISHED_NOTE);
        debug!(worker_id = %self.id, job_id = %job.id(), exit_code, "Resolved job");

        Ok((exit_code, Some(resolution.handle)))
    }

    async fn report_depth(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                self.metrics
                    .update_queue_depth(self.queue.queue_name(), stats.pending_jobs);
                self.metrics
                    .update_queue_depth(self.queue.backup_name(), stats.backup_jobs);
            }
            Err(e) => debug!(worker_id = %self.id, error = %e, "Failed to read queue depth"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed(&'static str),
        SucceedWithoutLock,
        Exit(i32),
        Fail,
        Panic,
    }

    struct MockResolver {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockResolver {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DependencyResolver for MockResolver {
        type Handle = usize;

        async fn resolve(
            &self,
            _request: &ResolveRequest,
            output: &mut dyn OutputSink,
        ) -> Result<Resolution<usize>, ResolverError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            output.writeln("Resolving dependencies").await?;

            match self.behavior {
                Behavior::Succeed(lock) => Ok(Resolution::success(lock, call)),
                Behavior::SucceedWithoutLock => Ok(Resolution {
                    exit_code: 0,
                    artifact: None,
                    diagnostics: None,
                    handle: call,
                }),
                Behavior::Exit(code) => Ok(Resolution::failure(code, call)),
                Behavior::Fail => Err(ResolverError::Failed("solver blew up".to_string())),
                Behavior::Panic => panic!("resolver exploded"),
            }
        }
    }

    /// Counts ERROR-level events.
    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    const TTL: Duration = Duration::from_secs(600);

    fn setup(
        behavior: Behavior,
        config: WorkerConfig,
    ) -> (Arc<JobQueue>, Arc<MockResolver>, Worker<MockResolver>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store, "jobs-queue", TTL));
        let resolver = MockResolver::new(behavior);
        let worker = Worker::new(Arc::clone(&queue), Arc::clone(&resolver), config)
            .with_id("test-worker");
        (queue, resolver, worker)
    }

    fn recovery_config() -> WorkerConfig {
        WorkerConfig::new()
            .with_max_retries_per_job(5)
            .with_seconds_to_wait_before_retry(Duration::from_secs(120))
    }

    /// A job that some worker claimed `age` ago, `retries` times.
    fn claimed_job(id: &str, age: chrono::Duration, retries: u32) -> Job {
        let mut job = Job::new(id, "{}");
        job.start_processing(Utc::now() - age).expect("claim");
        for _ in 0..retries {
            job.increment_retries();
        }
        job
    }

    fn finished_job(id: &str) -> Job {
        let mut job = Job::new(id, "{}");
        job.start_processing(Utc::now()).expect("claim");
        job.finish("LOCK").expect("finish");
        job
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.polling_frequency, Duration::from_secs(5));
        assert_eq!(config.max_retries_per_job, 3);
        assert_eq!(config.seconds_to_wait_before_retry, Duration::from_secs(120));
        assert!(config.terminate_after_run);
    }

    #[test]
    fn test_assess_claim_boundaries() {
        let config = recovery_config();
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut job = Job::new("j1", "{}");
        job.start_processing(start).expect("claim");
        job.increment_retries();

        let at = |secs: i64| start + chrono::Duration::seconds(secs);

        assert_eq!(assess_claim(&job, at(0), &config), ClaimState::Live);
        assert_eq!(assess_claim(&job, at(119), &config), ClaimState::Live);
        assert_eq!(
            assess_claim(&job, at(119) + chrono::Duration::milliseconds(999), &config),
            ClaimState::Live
        );
        assert_eq!(assess_claim(&job, at(120), &config), ClaimState::Stale);
        assert_eq!(assess_claim(&job, at(1000), &config), ClaimState::Stale);
        // clock skew: a start time in the future counts as live
        assert_eq!(assess_claim(&job, at(-30), &config), ClaimState::Live);
    }

    #[test]
    fn test_assess_claim_exhaustion_only_when_stale() {
        let config = recovery_config();
        let live = claimed_job("a", chrono::Duration::seconds(10), 5);
        let stale = claimed_job("b", chrono::Duration::seconds(1000), 5);
        let untimed = Job::new("c", "{}");

        assert_eq!(assess_claim(&live, Utc::now(), &config), ClaimState::Live);
        assert_eq!(assess_claim(&stale, Utc::now(), &config), ClaimState::Exhausted);
        assert_eq!(assess_claim(&untimed, Utc::now(), &config), ClaimState::Untimed);
    }

    #[tokio::test]
    async fn test_successful_run() {
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");

        let report = worker.run(Duration::ZERO).await.expect("run");

        let processed = report.processed.expect("job processed");
        assert_eq!(processed.job_id, "j1");
        assert_eq!(processed.status, JobStatus::Finished);
        assert_eq!(processed.exit_code, 0);
        assert_eq!(resolver.calls(), 1);

        let job = queue.get_job("j1").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.result_artifact(), "LOCK");
        assert_eq!(job.retries(), 1);
        assert!(job.processing_start_time().is_some());
        assert_eq!(job.output(), "Resolving dependencies\n\nFinished resolving.");

        // the claim stays registered until a recovery pass clears it
        assert!(queue.is_empty().await.expect("is_empty"));
        assert_eq!(queue.backup_ids().await.expect("ids"), vec!["j1"]);

        let last = worker.last_result().expect("last result");
        assert_eq!(last.exit_code(), 0);
        assert_eq!(last.handle(), Some(&1));
        assert_eq!(last.job(), &job);
    }

    #[tokio::test]
    async fn test_non_zero_exit_finishes_with_errors() {
        let (queue, _, worker) = setup(Behavior::Exit(1), WorkerConfig::new());
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");

        let report = worker.run(Duration::ZERO).await.expect("run");

        assert_eq!(report.processed.map(|p| p.exit_code), Some(1));
        let job = queue.get_job("j1").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::FinishedWithErrors);
        assert!(job.result_artifact().is_empty());
        assert!(job.output().ends_with("\nFinished resolving."));
    }

    #[tokio::test]
    async fn test_success_without_artifact_finishes_with_errors() {
        let (queue, _, worker) = setup(Behavior::SucceedWithoutLock, WorkerConfig::new());
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");

        worker.run(Duration::ZERO).await.expect("run");

        let job = queue.get_job("j1").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::FinishedWithErrors);
        assert!(job.output().contains("produced no lock file"));
    }

    #[tokio::test]
    async fn test_resolver_error_is_contained_and_logged_once() {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (queue, _, worker) = setup(Behavior::Fail, WorkerConfig::new());
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");

        let report = worker.run(Duration::ZERO).await.expect("run survives resolver error");

        assert_eq!(report.processed.map(|p| p.exit_code), Some(CRASH_EXIT_CODE));
        let job = queue.get_job("j1").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::FinishedWithErrors);
        assert!(job
            .output()
            .ends_with("\nAn error occurred during resolving process."));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let last = worker.last_result().expect("last result");
        assert_eq!(last.exit_code(), CRASH_EXIT_CODE);
        assert!(last.handle().is_none());
    }

    #[tokio::test]
    async fn test_resolver_panic_is_contained() {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (queue, _, worker) = setup(Behavior::Panic, WorkerConfig::new());
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");

        worker.run(Duration::ZERO).await.expect("run survives panic");

        let job = queue.get_job("j1").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::FinishedWithErrors);
        // output written before the panic was persisted
        assert!(job.output().starts_with("Resolving dependencies\n"));
        assert!(job
            .output()
            .ends_with("\nAn error occurred during resolving process."));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_job_is_skipped_without_sleeping() {
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        queue.add_job(&finished_job("done")).await.expect("add");
        queue.add_job(&Job::new("fresh", "{}")).await.expect("add");
        let started = Instant::now();

        let report = worker.run(Duration::from_secs(5)).await.expect("run");

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(report.skipped, vec!["done"]);
        assert_eq!(report.recovery.len(), 2);
        assert_eq!(report.processed.map(|p| p.job_id), Some("fresh".to_string()));
        assert_eq!(resolver.calls(), 1);

        let done = queue.get_job("done").await.expect("get").expect("present");
        assert_eq!(done.retries(), 0);
        assert_eq!(done.result_artifact(), "LOCK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_terminal_jobs_means_no_resolution() {
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        queue.add_job(&finished_job("done")).await.expect("add");
        let started = Instant::now();

        let report = worker.run(Duration::from_secs(5)).await.expect("run");

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(report.skipped, vec!["done"]);
        assert!(report.processed.is_none());
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_with_empty_queue() {
        let (_, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());

        let report = worker.run(Duration::ZERO).await.expect("run");

        assert_eq!(report.recovery, vec![RecoveryAction::Empty]);
        assert!(report.processed.is_none());
        assert_eq!(resolver.calls(), 0);
        assert!(worker.take_last_result().is_none());
    }

    #[tokio::test]
    async fn test_popped_id_without_record_ends_run() {
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        queue.requeue_front("ghost").await.expect("push");

        let report = worker.run(Duration::ZERO).await.expect("run");

        assert!(report.processed.is_none());
        assert_eq!(resolver.calls(), 0);
        assert!(queue.is_empty().await.expect("is_empty"));
    }

    #[tokio::test]
    async fn test_stale_claim_is_requeued_to_head() {
        let (queue, _, worker) = setup(Behavior::Succeed("LOCK"), recovery_config());
        queue.add_job(&Job::new("fresh", "{}")).await.expect("add");
        let stale = claimed_job("stale", chrono::Duration::seconds(1000), 1);
        queue.update_job(&stale).await.expect("update");
        queue.push_backup("stale").await.expect("backup");

        let action = worker.recover_stale_claim().await.expect("recover");

        assert_eq!(action, RecoveryAction::Requeued("stale".to_string()));
        assert_eq!(queue.pending_ids().await.expect("ids"), vec!["stale", "fresh"]);
        assert!(queue.backup_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_claim_is_abandoned() {
        let (queue, _, worker) = setup(Behavior::Succeed("LOCK"), recovery_config());
        let job = claimed_job("tired", chrono::Duration::seconds(1000), 5);
        queue.update_job(&job).await.expect("update");
        queue.push_backup("tired").await.expect("backup");

        let action = worker.recover_stale_claim().await.expect("recover");

        assert_eq!(action, RecoveryAction::Abandoned("tired".to_string()));
        assert!(queue.pending_ids().await.expect("ids").is_empty());
        assert!(queue.backup_ids().await.expect("ids").is_empty());
        // the record is left for the TTL to clean up
        assert!(queue.get_job("tired").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_live_claim_is_deferred_to_tail() {
        let (queue, _, worker) = setup(Behavior::Succeed("LOCK"), recovery_config());
        let live = claimed_job("live", chrono::Duration::seconds(10), 1);
        let other = claimed_job("other", chrono::Duration::seconds(10), 1);
        queue.update_job(&live).await.expect("update");
        queue.update_job(&other).await.expect("update");
        queue.push_backup("live").await.expect("backup");
        queue.push_backup("other").await.expect("backup");

        let action = worker.recover_stale_claim().await.expect("recover");

        assert_eq!(action, RecoveryAction::Deferred("live".to_string()));
        assert_eq!(queue.backup_ids().await.expect("ids"), vec!["other", "live"]);
        assert!(queue.pending_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn test_claims_without_record_or_start_time_are_dropped() {
        let (queue, _, worker) = setup(Behavior::Succeed("LOCK"), recovery_config());
        queue.push_backup("ghost").await.expect("backup");
        queue.update_job(&Job::new("untimed", "{}")).await.expect("update");
        queue.push_backup("untimed").await.expect("backup");

        assert_eq!(
            worker.recover_stale_claim().await.expect("recover"),
            RecoveryAction::Dropped("ghost".to_string())
        );
        assert_eq!(
            worker.recover_stale_claim().await.expect("recover"),
            RecoveryAction::Untimed("untimed".to_string())
        );
        assert!(queue.backup_ids().await.expect("ids").is_empty());
        assert!(queue.pending_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_keeps_start_time_and_counts_retries() {
        let (queue, _, worker) = setup(Behavior::Succeed("LOCK"), recovery_config());
        let crashed = claimed_job("crashed", chrono::Duration::seconds(1000), 1);
        let first_start = crashed.processing_start_time();
        queue.update_job(&crashed).await.expect("update");
        queue.push_backup("crashed").await.expect("backup");

        let report = worker.run(Duration::ZERO).await.expect("run");

        assert_eq!(
            report.recovery,
            vec![RecoveryAction::Requeued("crashed".to_string())]
        );
        let job = queue.get_job("crashed").await.expect("get").expect("present");
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.retries(), 2);
        assert_eq!(job.processing_start_time(), first_start);
    }

    #[tokio::test]
    async fn test_finished_claim_is_cleared_by_later_run() {
        let config = recovery_config().with_seconds_to_wait_before_retry(Duration::ZERO);
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), config);
        queue.add_job(&Job::new("j1", "{}")).await.expect("add");
        worker.run(Duration::ZERO).await.expect("first run");

        let report = worker.run(Duration::ZERO).await.expect("second run");

        assert_eq!(report.recovery[0], RecoveryAction::Requeued("j1".to_string()));
        assert_eq!(report.skipped, vec!["j1"]);
        assert_eq!(resolver.calls(), 1);
        assert!(queue.backup_ids().await.expect("ids").is_empty());
        assert!(queue.is_empty().await.expect("is_empty"));
    }

    #[tokio::test]
    async fn test_manual_resolve_leaves_lists_alone() {
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        let job = Job::new("manual", "{}");
        queue.add_job(&job).await.expect("add");
        let mut output = JobOutput::detached(crate::scheduler::Verbosity::Normal);

        let result = worker.resolve(job, &mut output).await.expect("resolve");

        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.job().status(), JobStatus::Finished);
        assert_eq!(result.job().result_artifact(), "LOCK");
        assert_eq!(result.job().retries(), 0);
        assert_eq!(resolver.calls(), 1);
        assert_eq!(queue.pending_ids().await.expect("ids"), vec!["manual"]);
        assert!(queue.backup_ids().await.expect("ids").is_empty());
        let stored = queue.get_job("manual").await.expect("get").expect("present");
        assert_eq!(stored.status(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_manual_resolve_rejects_finished_job() {
        let (_, resolver, worker) = setup(Behavior::Succeed("LOCK"), WorkerConfig::new());
        let mut output = JobOutput::detached(crate::scheduler::Verbosity::Normal);

        let result = worker.resolve(finished_job("done"), &mut output).await;

        assert!(matches!(result, Err(WorkerError::Job(_))));
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_after_run_stops_after_first_job() {
        let config = WorkerConfig::new().with_polling_frequency(Duration::from_secs(1));
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), config);
        queue.add_job(&Job::new("a", "{}")).await.expect("add");
        queue.add_job(&Job::new("b", "{}")).await.expect("add");
        let (_tx, mut rx) = broadcast::channel(1);

        let processed = worker.run_until_shutdown(&mut rx).await.expect("loop");

        assert_eq!(processed, 1);
        assert_eq!(resolver.calls(), 1);
        assert_eq!(queue.pending_ids().await.expect("ids"), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_checked_between_runs() {
        let config = WorkerConfig::new()
            .with_polling_frequency(Duration::from_secs(1))
            .with_terminate_after_run(false);
        let (queue, resolver, worker) = setup(Behavior::Succeed("LOCK"), config);
        queue.add_job(&Job::new("a", "{}")).await.expect("add");
        let (tx, mut rx) = broadcast::channel(1);

        tx.send(()).expect("send");
        let processed = worker.run_until_shutdown(&mut rx).await.expect("loop");

        assert_eq!(processed, 0);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(queue.len().await.expect("len"), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_recovery_action_labels() {
        assert_eq!(RecoveryAction::Empty.label(), "empty");
        assert_eq!(RecoveryAction::Requeued("a".into()).label(), "requeued");
        assert_eq!(RecoveryAction::Abandoned("a".into()).job_id(), Some("a"));
        assert_eq!(RecoveryAction::Empty.job_id(), None);
    }
}
