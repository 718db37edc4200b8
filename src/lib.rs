//! lockqueue: dependency resolution jobs on a Redis-backed work queue.
//!
//! Clients submit a manifest as a [`Job`](scheduler::Job); stateless
//! workers claim jobs from the queue, run the resolver and persist the
//! lock file and captured output on the job record.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod resolver;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use error::{ResolverError, StoreError};
pub use scheduler::{Job, JobQueue, JobStatus, Worker, WorkerConfig};
