//! Fixed-window usage counters per (credential, resource)
//!
//! Windows are aligned to the epoch, not to first use, so every caller
//! sharing a pair sees the same boundaries. A burst straddling a boundary can
//! reach twice the nominal per-window budget.

use crate::{
    cache_store::CacheStore,
    clock::Clock,
    error::{AccessError, AccessResult},
    models::CurrentUsage,
};
use logger_redacted::fingerprint;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub const REQUEST_COUNT_FIELD: &str = "request_count";
pub const RESOURCE_USED_FIELD: &str = "resource_used";

/// Version segment of window keys; bump when the record layout changes
const WINDOW_KEY_VERSION: &str = "v1";

pub struct RateLimiter {
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    window_secs: i64,
    key_prefix: String,
}

impl RateLimiter {
    /// # Errors
    ///
    /// Returns [`AccessError::Configuration`] for a zero or oversized window.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        window: Duration,
        key_prefix: impl Into<String>,
    ) -> AccessResult<Self> {
        let window_secs = i64::try_from(window.as_secs())
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                AccessError::Configuration(format!("invalid rate-limit window: {window:?}"))
            })?;

        Ok(Self {
            cache,
            clock,
            window_secs,
            key_prefix: key_prefix.into(),
        })
    }

    /// Start of the window containing `timestamp` (unix seconds)
    pub fn window_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.window_secs) * self.window_secs
    }

    pub fn window_key(&self, key_hash: &str, resource_name: &str, window_start: i64) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.key_prefix, WINDOW_KEY_VERSION, key_hash, resource_name, window_start
        )
    }

    fn window_ttl(&self) -> Duration {
        Duration::from_secs(self.window_secs.unsigned_abs())
    }

    /// Count one request consuming `amount` units in the current window.
    ///
    /// The counter update is a single atomic batch. Failures propagate so a
    /// cache outage never lets traffic through uncounted.
    ///
    /// # Errors
    ///
    /// Cache [`AccessError::StoreUnavailable`], or
    /// [`AccessError::InvalidRateLimit`] if `amount` exceeds `i64::MAX`.
    pub async fn record_usage(
        &self,
        key_hash: &str,
        resource_name: &str,
        amount: u64,
    ) -> AccessResult<()> {
        let amount = i64::try_from(amount).map_err(|_| {
            AccessError::InvalidRateLimit(format!("usage amount {amount} out of range"))
        })?;

        let start = self.window_start(self.clock.now().timestamp());
        let key = self.window_key(key_hash, resource_name, start);

        let increments = [(REQUEST_COUNT_FIELD, 1), (RESOURCE_USED_FIELD, amount)];
        self.cache
            .increment_fields(&key, &increments, self.window_ttl())
            .await
            .map_err(|e| {
                error!(
                    credential = %fingerprint(key_hash),
                    resource = %resource_name,
                    error = %e,
                    "Failed to record usage"
                );
                e
            })?;

        debug!(
            credential = %fingerprint(key_hash),
            resource = %resource_name,
            window_start = start,
            amount,
            "Usage recorded"
        );
        Ok(())
    }

    /// Counters for the current window; an untouched window reads as zero
    ///
    /// # Errors
    ///
    /// Cache [`AccessError::StoreUnavailable`].
    pub async fn get_current_usage(
        &self,
        key_hash: &str,
        resource_name: &str,
    ) -> AccessResult<CurrentUsage> {
        let now = self.clock.now().timestamp();
        let key = self.window_key(key_hash, resource_name, self.window_start(now));

        let values = self
            .cache
            .read_fields(&key, &[REQUEST_COUNT_FIELD, RESOURCE_USED_FIELD])
            .await?;
        let counter = |index: usize| -> u64 {
            values
                .get(index)
                .copied()
                .flatten()
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0)
        };

        Ok(CurrentUsage {
            request_count: counter(0),
            resource_used: counter(1),
            seconds_remaining: (self.window_secs - now.rem_euclid(self.window_secs)).unsigned_abs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::InMemoryCacheStore;
    use crate::clock::ManualClock;

    fn limiter_at(seconds: i64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::at_unix(seconds));
        let cache = Arc::new(InMemoryCacheStore::with_clock(clock.clone()));
        let limiter =
            RateLimiter::new(cache, clock.clone(), Duration::from_secs(60), "RateLimits").unwrap();
        (clock, limiter)
    }

    #[test]
    fn test_window_alignment() {
        let (_clock, limiter) = limiter_at(0);
        assert_eq!(limiter.window_start(1_700_000_059), 1_700_000_040);
        assert_eq!(limiter.window_start(120), 120);
        assert_eq!(limiter.window_start(-1), -60);
        assert_eq!(limiter.window_key("abc", "GPT-4", 120), "RateLimits:v1:abc:GPT-4:120");
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let clock = Arc::new(ManualClock::at_unix(0));
        let cache = Arc::new(InMemoryCacheStore::new());
        assert!(matches!(
            RateLimiter::new(cache, clock, Duration::ZERO, "RateLimits"),
            Err(AccessError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_seconds_remaining_counts_down_to_boundary() {
        let (clock, limiter) = limiter_at(1_200);
        assert_eq!(limiter.get_current_usage("abc", "GPT-4").await.unwrap().seconds_remaining, 60);

        clock.advance(chrono::Duration::seconds(59));
        let usage = limiter.get_current_usage("abc", "GPT-4").await.unwrap();
        assert_eq!(usage.seconds_remaining, 1);
        assert_eq!(usage.request_count, 0);
    }

    #[tokio::test]
    async fn test_usage_is_scoped_per_resource() {
        let (_clock, limiter) = limiter_at(1_200);
        limiter.record_usage("abc", "GPT-4", 10).await.unwrap();

        let other = limiter.get_current_usage("abc", "Whisper").await.unwrap();
        assert_eq!((other.request_count, other.resource_used), (0, 0));
    }
}
