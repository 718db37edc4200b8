//! In-process job store with Redis-like TTL and list semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{whole_seconds, JobStore};
use crate::error::StoreError;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    /// Drops `key` if its TTL has lapsed and returns the live entry, if any.
    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        let expired = self
            .values
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());

        if expired {
            self.values.remove(key);
        }

        self.values.get(key)
    }
}

/// Job store kept entirely in memory.
///
/// Every operation takes a single lock, so each is atomic with respect to
/// the others, matching the per-command atomicity of Redis. Expiry uses the
/// tokio clock, which lets tests drive TTLs with paused time.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remaining time-to-live of `key`, or `None` if it is absent or expired.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.lock();
        state
            .live_entry(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Whether `key` currently holds a live value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live_entry(key).is_some()
    }

    fn pop_front(&self, list: &str) -> Option<String> {
        let mut state = self.lock();
        let items = state.lists.get_mut(list)?;
        let value = items.pop_front();

        if items.is_empty() {
            state.lists.remove(list);
        }

        value
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(whole_seconds(ttl));
        self.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        Ok(state.live_entry(key).map(|entry| entry.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.values.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lpop(&self, list: &str) -> Result<Option<String>, StoreError> {
        Ok(self.pop_front(list))
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + Duration::from_secs(whole_seconds(timeout));

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_front(list) {
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let Some(items) = state.lists.get_mut(list) else {
            return Ok(0);
        };

        let before = items.len();
        items.retain(|item| item != value);
        let removed = before - items.len();

        if items.is_empty() {
            state.lists.remove(list);
        }

        Ok(removed)
    }

    async fn llen(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn lrange(&self, list: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }
}
