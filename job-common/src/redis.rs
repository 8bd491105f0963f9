use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use thiserror::Error;
use tokio::time::timeout;

/// Enumeration of errors for operations against the shared store.
/// The dedup gate, the dead-letter store and the queue all surface these, and the pipeline
/// reports any of them as the store being unavailable.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("timed out waiting for a response from redis")]
    Timeout,
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to serialize value for redis: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The subset of redis commands the consumer relies on.
/// Every command maps to a single atomic redis operation; callers never need to combine two of
/// them to get a consistent answer.
#[async_trait]
pub trait Client: Send + Sync {
    /// `SET k v EX seconds NX`. Returns whether the key was set.
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> Result<bool, StoreError>;
    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn lrange(&self, k: String, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;
    async fn llen(&self, k: String) -> Result<u64, StoreError>;
    /// Remove up to `count` occurrences of `v`, returning how many were removed.
    async fn lrem(&self, k: String, count: isize, v: String) -> Result<u64, StoreError>;
    async fn rpoplpush(&self, src: String, dst: String) -> Result<Option<String>, StoreError>;
    async fn zadd(&self, k: String, member: String, score: i64) -> Result<(), StoreError>;
    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, StoreError>;
    /// Returns whether the member was present.
    async fn zrem(&self, k: String, member: String) -> Result<bool, StoreError>;
    async fn publish(&self, channel: String, message: String) -> Result<(), StoreError>;
}

/// A `Client` backed by a single multiplexed connection, shared by every worker task.
pub struct RedisClient {
    connection: MultiplexedConnection,
    response_timeout: Duration,
}

impl RedisClient {
    /// Connect to redis at `addr`. Every command is bounded by `response_timeout`.
    pub async fn new(addr: String, response_timeout: Duration) -> Result<RedisClient, StoreError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_tokio_connection().await?;

        Ok(RedisClient {
            connection,
            response_timeout,
        })
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.response_timeout, command).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&k).arg(&v).arg("EX").arg(seconds).arg("NX");

        // Redis replies OK when the key was written and nil when it already existed.
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;

        Ok(reply.is_some())
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded::<(), _>(conn.lpush(k, v)).await
    }

    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded::<(), _>(conn.rpush(k, v)).await
    }

    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.lrange(k, start, stop)).await
    }

    async fn llen(&self, k: String) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.llen(k)).await
    }

    async fn lrem(&self, k: String, count: isize, v: String) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.lrem(k, count, v)).await
    }

    async fn rpoplpush(&self, src: String, dst: String) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.rpoplpush(src, dst)).await
    }

    async fn zadd(&self, k: String, member: String, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded::<(), _>(conn.zadd(k, member, score)).await
    }

    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.zrangebyscore(k, min, max)).await
    }

    async fn zrem(&self, k: String, member: String) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = self.bounded(conn.zrem(k, member)).await?;

        Ok(removed > 0)
    }

    async fn publish(&self, channel: String, message: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded::<(), _>(conn.publish(channel, message)).await
    }
}
