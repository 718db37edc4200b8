//! Error types shared across lockqueue subsystems.
//!
//! Subsystem-local errors (`QueueError`, `WorkerError`, `PoolError`,
//! `ConfigError`, `JobError`) live next to the code that raises them. This
//! module holds the two errors that cross module boundaries:
//! - Store access (Redis or in-memory)
//! - Dependency resolution

use thiserror::Error;

use crate::scheduler::QueueError;

/// Errors raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors raised while invoking a [`DependencyResolver`](crate::resolver::DependencyResolver).
///
/// Any of these is treated by the worker as a resolver crash: the job is
/// forced to `finished_with_errors` and the worker keeps running.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to launch resolver command '{command}': {reason}")]
    Launch { command: String, reason: String },

    #[error("Invalid job id for resolution: {0}")]
    InvalidJobId(String),

    #[error("Failed to persist resolver output: {0}")]
    Output(#[from] QueueError),

    #[error("Resolver panicked: {0}")]
    Panicked(String),

    #[error("Resolver failed: {0}")]
    Failed(String),
}
