//! Redis-backed cache store

use crate::{
    cache_store::CacheStore,
    error::{AccessError, AccessResult},
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Cache store over a multiplexed Redis connection.
///
/// Each call is bounded by `operation_timeout`; a call that runs over is
/// reported as an unavailable cache rather than left to hang.
#[derive(Clone)]
pub struct RedisCacheStore {
    redis: ConnectionManager,
    operation_timeout: Duration,
}

impl RedisCacheStore {
    /// # Errors
    ///
    /// Returns [`AccessError::StoreUnavailable`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str, operation_timeout: Duration) -> AccessResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        info!(timeout = ?operation_timeout, "Connected to Redis cache");
        Ok(Self::new(redis, operation_timeout))
    }

    pub fn new(redis: ConnectionManager, operation_timeout: Duration) -> Self {
        Self {
            redis,
            operation_timeout,
        }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> AccessResult<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(AccessError::from),
            Err(_) => Err(AccessError::cache(format!(
                "{operation} timed out after {}ms",
                self.operation_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> AccessResult<Option<String>> {
        let mut conn = self.redis.clone();
        self.bounded("GET", async move {
            redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<()> {
        let mut conn = self.redis.clone();
        let seconds = ttl.as_secs().max(1);
        self.bounded("SET", async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(seconds)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn delete(&self, key: &str) -> AccessResult<()> {
        let mut conn = self.redis.clone();
        self.bounded("DEL", async move {
            redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn increment_fields(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> AccessResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, _) in increments {
            pipe.cmd("HSETNX").arg(key).arg(*field).arg(0).ignore();
        }
        // NX keeps the first writer's expiry (Redis 7+)
        pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).arg("NX").ignore();
        for (field, by) in increments {
            pipe.cmd("HINCRBY").arg(key).arg(*field).arg(*by).ignore();
        }

        let mut conn = self.redis.clone();
        self.bounded("MULTI/EXEC", async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn read_fields(&self, key: &str, fields: &[&str]) -> AccessResult<Vec<Option<i64>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        self.bounded("HMGET", async move {
            cmd.query_async::<_, Vec<Option<i64>>>(&mut conn).await
        })
        .await
    }

    async fn ping(&self) -> AccessResult<()> {
        let mut conn = self.redis.clone();
        self.bounded("PING", async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await?;
        Ok(())
    }
}
