use crate::{
    clock::{Clock, SystemClock},
    error::{AccessError, AccessResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod redis;

pub use self::redis::RedisCacheStore;

/// Key/value store shared by the permission cache and the rate limiter.
///
/// Every failure surfaces as [`AccessError::StoreUnavailable`] with
/// [`crate::StoreKind::Cache`]; callers decide whether to degrade or fail.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> AccessResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<()>;

    /// Deleting an absent key succeeds
    async fn delete(&self, key: &str) -> AccessResult<()>;

    /// As one atomic unit: create missing counter fields at zero, set the
    /// key's expiry only if it has none, then add each increment.
    async fn increment_fields(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> AccessResult<()>;

    /// Counter values in `fields` order; absent key or field reads as `None`
    async fn read_fields(&self, key: &str, fields: &[&str]) -> AccessResult<Vec<Option<i64>>>;

    async fn ping(&self) -> AccessResult<()>;
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counters(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> AccessResult<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| AccessError::cache(format!("invalid ttl: {e}")))?;
    Ok(now + ttl)
}

/// Concurrent in-process cache store.
///
/// Expiry follows the injected clock, so window and TTL boundaries can be
/// tested without sleeping. Each key's shard lock is held for a whole
/// [`CacheStore::increment_fields`] call, which makes the batch atomic.
pub struct InMemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the cache becoming (un)reachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining lifetime of `key`, if it exists and has an expiry
    pub fn ttl(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> AccessResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AccessError::cache("in-memory cache is offline"))
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> AccessResult<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();

        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return Ok(None);
        }

        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            Value::Counters(_) => {
                Err(AccessError::cache(format!("key {key} holds counters, not text")))
            }
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<()> {
        self.check_available()?;
        let expires_at = expiry(self.clock.now(), ttl)?;

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Value::Text(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AccessResult<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn increment_fields(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> AccessResult<()> {
        self.check_available()?;
        let now = self.clock.now();

        let mut entry = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(CacheEntry {
                        value: Value::Counters(HashMap::new()),
                        expires_at: None,
                    });
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(CacheEntry {
                value: Value::Counters(HashMap::new()),
                expires_at: None,
            }),
        };

        if entry.expires_at.is_none() {
            entry.expires_at = Some(expiry(now, ttl)?);
        }

        let Value::Counters(counters) = &mut entry.value else {
            return Err(AccessError::cache(format!("key {key} holds text, not counters")));
        };
        for (field, _) in increments {
            counters.entry((*field).to_string()).or_insert(0);
        }
        for (field, by) in increments {
            if let Some(counter) = counters.get_mut(*field) {
                *counter = counter.saturating_add(*by);
            }
        }
        Ok(())
    }

    async fn read_fields(&self, key: &str, fields: &[&str]) -> AccessResult<Vec<Option<i64>>> {
        self.check_available()?;
        let now = self.clock.now();

        let Some(entry) = self.entries.get(key).filter(|e| !e.is_expired(now)) else {
            return Ok(vec![None; fields.len()]);
        };

        match &entry.value {
            Value::Counters(counters) => {
                Ok(fields.iter().map(|f| counters.get(*f).copied()).collect())
            }
            Value::Text(_) => {
                Err(AccessError::cache(format!("key {key} holds text, not counters")))
            }
        }
    }

    async fn ping(&self) -> AccessResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(seconds: i64) -> (Arc<ManualClock>, InMemoryCacheStore) {
        let clock = Arc::new(ManualClock::at_unix(seconds));
        let store = InMemoryCacheStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_text_expires_with_clock() {
        let (clock, store) = store_at(1_000);
        store.set_with_ttl("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_sets_expiry_only_once() {
        let (clock, store) = store_at(1_000);
        let fields = [("a", 1), ("b", 5)];

        store.increment_fields("w", &fields, Duration::from_secs(60)).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        store.increment_fields("w", &fields, Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.ttl("w"), Some(chrono::Duration::seconds(30)));
        assert_eq!(
            store.read_fields("w", &["a", "b", "c"]).await.unwrap(),
            vec![Some(2), Some(10), None]
        );

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(store.read_fields("w", &["a"]).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_zero_increment_initializes_field() {
        let store = InMemoryCacheStore::new();
        store
            .increment_fields("w", &[("a", 1), ("b", 0)], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.read_fields("w", &["a", "b"]).await.unwrap(), vec![Some(1), Some(0)]);
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = InMemoryCacheStore::new();
        store.set_available(false);

        assert!(store.get("k").await.unwrap_err().is_store_unavailable());
        assert!(store.delete("k").await.unwrap_err().is_store_unavailable());
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
