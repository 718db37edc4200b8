//! Redis-backed job store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{whole_seconds, JobStore};
use crate::error::StoreError;

/// Job store backed by a Redis server.
///
/// Wraps a [`ConnectionManager`], which reconnects automatically. Clones
/// share the same underlying multiplexed connection.
///
/// A blocking `BLPOP` would stall every other command queued on that shared
/// connection, so stores created with [`connect`](Self::connect) run it on a
/// connection of its own.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    client: Option<redis::Client>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            redis,
            client: Some(client),
        })
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Without a client to open extra connections, blocking pops share the
    /// manager's connection and hold up other commands until they return.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            client: None,
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(whole_seconds(ttl))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn lpop(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("LPOP")
            .arg(list)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(list).arg(whole_seconds(timeout));

        // BLPOP replies with a (list, value) pair, or nil on timeout
        let popped: Option<(String, String)> = match &self.client {
            Some(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                cmd.query_async(&mut conn).await?
            }
            None => {
                let mut conn = self.redis.clone();
                cmd.query_async(&mut conn).await?
            }
        };

        Ok(popped.map(|(_, value)| value))
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.lrem(list, 0, value).await?;
        Ok(removed)
    }

    async fn llen(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn lrange(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let items: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(items)
    }
}
