//! Backing stores for job records and queue lists.
//!
//! The queue only needs a handful of atomic single-key operations from its
//! store:
//!
//! - string `SETEX` / `GET` / `DEL` for job records
//! - list `RPUSH` / `LPUSH` / `LPOP` / `BLPOP` / `LREM` / `LLEN` / `LRANGE`
//!   for the main and backup id lists
//!
//! No multi-key transactions are assumed. [`RedisStore`] is the production
//! backend; [`MemoryStore`] implements the same contract in-process and is
//! what the test suite runs against.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Atomic key/value and list primitives required by the job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value and resetting
    /// its time-to-live to `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Reads a string value. Expired and unknown keys are `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deletes a key. Deleting an unknown key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Appends `value` to the tail of `list`.
    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Prepends `value` to the head of `list`.
    async fn lpush(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Pops the head of `list` without blocking.
    async fn lpop(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Pops the head of `list`, waiting up to `timeout` for an element.
    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Removes every occurrence of `value` from `list`, returning how many
    /// elements were removed.
    async fn lrem(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    /// Returns the length of `list`.
    async fn llen(&self, list: &str) -> Result<usize, StoreError>;

    /// Returns all elements of `list`, head first.
    async fn lrange(&self, list: &str) -> Result<Vec<String>, StoreError>;
}

/// Whole seconds used for TTLs and blocking timeouts.
///
/// Redis rejects a zero `SETEX` TTL and treats a zero `BLPOP` timeout as
/// "block forever", so both are clamped to one second.
pub(crate) fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}
