//! Job scheduling: records, the two-list queue, workers and admission.
//!
//! - **Job**: The persisted unit of work and its status machine
//! - **JobQueue**: Main and backup id lists plus TTL-bounded job records
//! - **JobOutput**: Captures resolver output into the job, persisting as it goes
//! - **Worker**: Recovery pass, claim, resolve, finalize
//! - **WorkerPool**: Several workers in one process with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//!    submit ──► SETEX {queue}:jobs:{id}
//!               RPUSH {queue} id
//!                      │
//!                      ▼
//!    ┌─────────────────────────────────────────┐
//!    │ main list       {queue}                 │◄──── LPUSH (redelivery)
//!    └──────────────────┬──────────────────────┘            ▲
//!                       │ LPOP                              │
//!                       ▼                                   │
//!    ┌──────────┐  RPUSH id   ┌───────────────────────┐     │
//!    │  Worker  ├────────────►│ backup list           ├─────┘
//!    └──────────┘   (claim)   │ {queue}_backup        │ recovery pass:
//!                             └───────────────────────┘ stale claims only
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lockqueue::scheduler::{Job, JobQueue, Worker, WorkerConfig};
//! use lockqueue::resolver::ProcessResolver;
//! use lockqueue::store::RedisStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//! let queue = Arc::new(JobQueue::new(store, "jobs-queue", Duration::from_secs(600)));
//!
//! queue.add_job(&Job::new(Job::generate_id(), manifest)).await?;
//!
//! let resolver = Arc::new(ProcessResolver::new("composer", "/tmp/jobs"));
//! let worker = Worker::new(queue, resolver, WorkerConfig::default());
//! worker.run(Duration::from_secs(5)).await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic pops**: no two workers ever take the same id from a list
//! - **Crash recovery**: claims older than the retry wait are redelivered
//!   ahead of fresh work, up to a maximum number of claims per job
//! - **Expiry**: job records carry a TTL refreshed on every write, so
//!   abandoned jobs disappear on their own

pub mod admission;
pub mod job;
pub mod output;
pub mod queue;
pub mod worker;
pub mod worker_pool;

pub use admission::{QueueLengthLimit, WaitEstimate};
pub use job::{Job, JobError, JobStatus, ResolveOptions, Verbosity};
pub use output::{strip_ansi, ConsoleOutput, JobOutput, JobUpdater, OutputSink};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use worker::{
    assess_claim, ClaimState, ProcessedJob, RecoveryAction, ResolvingResult, RunReport, Worker,
    WorkerConfig, WorkerError, CRASH_EXIT_CODE,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
