//! End-to-end behaviour of the access engine against the in-memory stores
//!
//! Covers the grant/revoke/re-grant cycle, credential and resource lifecycle,
//! and how the engine behaves when either store is offline.

use async_trait::async_trait;
use model_access::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Ten seconds into a window, so 50 seconds remain
const START: i64 = 1_699_999_990;

struct Harness {
    store: Arc<InMemoryAccessStore>,
    cache: Arc<InMemoryCacheStore>,
    clock: Arc<ManualClock>,
    engine: AccessEngine,
}

fn harness_with(refresh: RefreshPolicy) -> Harness {
    let clock = Arc::new(ManualClock::at_unix(START));
    let store = Arc::new(InMemoryAccessStore::new());
    let cache = Arc::new(InMemoryCacheStore::with_clock(clock.clone()));

    let mut config = AccessConfig::default();
    config.cache.refresh = refresh;
    let engine =
        AccessEngine::with_clock(store.clone(), cache.clone(), clock.clone(), &config).unwrap();

    Harness {
        store,
        cache,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(RefreshPolicy::Rebuild)
}

fn limits(rpm: u32, quota: u32) -> RateLimits {
    RateLimits::new(rpm, quota).unwrap()
}

fn allowed(rpm: u32, quota: u32) -> Decision {
    Decision::allowed(limits(rpm, quota))
}

fn denied(reason: DenyReason) -> Decision {
    Decision::denied(reason)
}

#[tokio::test]
async fn test_gpt4_scenario() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();

    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), allowed(60, 60));

    for _ in 0..3 {
        h.engine.record_usage("abc", "GPT-4", 100).await.unwrap();
    }
    let usage = h.engine.get_current_usage("abc", "GPT-4").await.unwrap();
    assert_eq!(usage.request_count, 3);
    assert_eq!(usage.resource_used, 300);
    assert_eq!(usage.seconds_remaining, 50);

    h.engine.disable_credential("abc").await.unwrap();
    assert_eq!(
        h.engine.authorize("abc", "GPT-4").await.unwrap(),
        denied(DenyReason::DisabledCredential)
    );
}

#[tokio::test]
async fn test_grant_revoke_regrant_reuses_grant_row() {
    for refresh in [RefreshPolicy::Rebuild, RefreshPolicy::Invalidate] {
        let h = harness_with(refresh);
        h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
        let gpt4 = h.engine.create_resource("GPT-4", 3).await.unwrap();

        h.engine.grant("abc", "GPT-4", limits(60, 1000)).await.unwrap();
        assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), allowed(60, 1000));

        h.engine.revoke("abc", "GPT-4").await.unwrap();
        assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), denied(DenyReason::NoGrant));

        // limits survive revocation
        let kept = h.store.find_grant("abc", gpt4.id).await.unwrap().unwrap();
        assert_eq!(kept.limits, limits(60, 1000));

        let regrant = h.engine.grant("abc", "GPT-4", limits(30, 500)).await.unwrap();
        assert_eq!(regrant.resource_id, gpt4.id);
        assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), allowed(30, 500));
    }
}

#[tokio::test]
async fn test_unknown_credential_and_ungranted_resource() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();

    assert_eq!(
        h.engine.authorize("nope", "GPT-4").await.unwrap(),
        denied(DenyReason::InvalidCredential)
    );
    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), denied(DenyReason::NoGrant));
    assert_eq!(
        h.engine.authorize("abc", "not-registered").await.unwrap(),
        denied(DenyReason::NoGrant)
    );
}

#[tokio::test]
async fn test_invalidate_is_idempotent() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    assert!(h.cache.get("Permissions:abc").await.unwrap().is_some());

    h.engine.invalidate_permissions("abc").await.unwrap();
    let once = h.cache.get("Permissions:abc").await.unwrap();
    h.engine.invalidate_permissions("abc").await.unwrap();
    let twice = h.cache.get("Permissions:abc").await.unwrap();

    assert_eq!(once, None);
    assert_eq!(once, twice);
    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), allowed(60, 60));

    // unknown credentials are fine too
    h.engine.invalidate_permissions("nope").await.unwrap();
}

#[tokio::test]
async fn test_duplicate_resource_changes_nothing() {
    let h = harness();
    let gpt4 = h.engine.create_resource("GPT-4", 0).await.unwrap();

    let err = h.engine.create_resource("Whisper", 0).await.unwrap_err();
    assert!(matches!(
        err,
        AccessError::DuplicateResource { ref name, permission_bit: 0 } if name == "Whisper"
    ));
    assert_eq!(err.code(), "REGISTRY_3101");

    assert!(matches!(
        h.engine.create_resource("GPT-4", 1).await,
        Err(AccessError::DuplicateResource { .. })
    ));

    assert_eq!(h.engine.list_resources().await.unwrap(), vec![gpt4.clone()]);
    assert_eq!(h.engine.find_resource_by_id(gpt4.id).await.unwrap(), Some(gpt4));
    assert!(h.engine.find_resource_by_name("Whisper").await.unwrap().is_none());
}

#[tokio::test]
async fn test_grant_and_revoke_on_disabled_credential() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    h.engine.disable_credential("abc").await.unwrap();

    assert!(matches!(
        h.engine.grant("abc", "GPT-4", limits(1, 1)).await,
        Err(AccessError::DisabledCredential)
    ));
    h.engine.revoke("abc", "GPT-4").await.unwrap();

    let credential = h.engine.find_credential("abc").await.unwrap().unwrap();
    assert!(!credential.enabled);
    assert!(credential.permission_bits.is_empty());
}

#[tokio::test]
async fn test_disable_and_delete_unknown_credentials() {
    let h = harness();
    assert!(matches!(
        h.engine.disable_credential("nope").await,
        Err(AccessError::InvalidCredential)
    ));
    assert!(matches!(
        h.engine.delete_credential("nope").await,
        Err(AccessError::InvalidCredential)
    ));
    assert!(matches!(
        h.engine.grant("nope", "GPT-4", limits(1, 1)).await,
        Err(AccessError::UnknownResource(_))
    ));
}

#[tokio::test]
async fn test_duplicate_credential() {
    let h = harness();
    let owner = Uuid::new_v4();
    h.engine.register_credential(owner, "abc").await.unwrap();

    let err = h.engine.register_credential(owner, "abc").await.unwrap_err();
    assert!(matches!(err, AccessError::DuplicateCredential));
}

#[tokio::test]
async fn test_delete_credential_removes_grants_and_cache() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    let gpt4 = h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    assert!(h.engine.authorize("abc", "GPT-4").await.unwrap().is_allowed());

    h.engine.delete_credential("abc").await.unwrap();

    assert!(h.cache.get("Permissions:abc").await.unwrap().is_none());
    assert!(h.store.find_grant("abc", gpt4.id).await.unwrap().is_none());
    assert_eq!(
        h.engine.authorize("abc", "GPT-4").await.unwrap(),
        denied(DenyReason::InvalidCredential)
    );
}

#[tokio::test]
async fn test_deleted_resource_bit_is_not_inherited() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.register_credential(Uuid::new_v4(), "def").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    h.engine.grant("def", "GPT-4", limits(10, 10)).await.unwrap();

    let deleted = h.engine.delete_resource_by_name("GPT-4").await.unwrap();
    assert_eq!(deleted.permission_bit.index(), 0);
    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), denied(DenyReason::NoGrant));

    // bit 0 is free in the registry but still set on both credentials
    assert!(matches!(
        h.engine.delete_resource(deleted.id).await,
        Err(AccessError::UnknownResource(_))
    ));
    let llama = h.engine.create_resource("Llama", 0).await.unwrap();
    assert!(matches!(
        h.engine.release_permission_bit(0).await,
        Err(AccessError::PermissionBitInUse(0))
    ));
    assert_eq!(h.engine.authorize("abc", "Llama").await.unwrap(), denied(DenyReason::NoGrant));

    h.engine.delete_resource(llama.id).await.unwrap();
    assert_eq!(h.engine.release_permission_bit(0).await.unwrap(), 2);
    assert_eq!(h.engine.release_permission_bit(0).await.unwrap(), 0);
    assert!(h
        .engine
        .find_credential("abc")
        .await
        .unwrap()
        .unwrap()
        .permission_bits
        .is_empty());

    h.engine.create_resource("Llama", 0).await.unwrap();
    h.engine.grant("def", "Llama", limits(5, 5)).await.unwrap();
    assert_eq!(h.engine.authorize("def", "Llama").await.unwrap(), allowed(5, 5));
    assert_eq!(h.engine.authorize("abc", "Llama").await.unwrap(), denied(DenyReason::NoGrant));
}

#[tokio::test]
async fn test_admission_throttles_until_next_window() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(2, 1000)).await.unwrap();

    assert!(h.engine.admit("abc", "GPT-4").await.unwrap().is_admitted());
    h.engine.record_usage("abc", "GPT-4", 10).await.unwrap();
    h.engine.record_usage("abc", "GPT-4", 10).await.unwrap();

    assert_eq!(
        h.engine.admit("abc", "GPT-4").await.unwrap(),
        Admission::Throttled {
            limits: limits(2, 1000),
            usage: CurrentUsage {
                request_count: 2,
                resource_used: 20,
                seconds_remaining: 50,
            },
        }
    );

    h.clock.advance(chrono::Duration::seconds(50));
    assert!(h.engine.admit("abc", "GPT-4").await.unwrap().is_admitted());

    assert_eq!(
        h.engine.admit("nope", "GPT-4").await.unwrap(),
        Admission::Denied(DenyReason::InvalidCredential)
    );
}

#[tokio::test]
async fn test_quota_exhaustion_throttles() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(100, 500)).await.unwrap();

    h.engine.record_usage("abc", "GPT-4", 500).await.unwrap();
    assert!(matches!(
        h.engine.admit("abc", "GPT-4").await.unwrap(),
        Admission::Throttled { .. }
    ));
}

#[tokio::test]
async fn test_cache_outage_degrades_reads_and_fails_limiter_closed() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();

    h.cache.set_available(false);

    // mutation commits even though the cache cannot be refreshed
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), allowed(60, 60));

    let err = h.engine.record_usage("abc", "GPT-4", 1).await.unwrap_err();
    assert!(matches!(err, AccessError::StoreUnavailable { store: StoreKind::Cache, .. }));
    assert!(h.engine.get_current_usage("abc", "GPT-4").await.is_err());
    assert!(h.engine.admit("abc", "GPT-4").await.is_err());
    assert!(h.engine.invalidate_permissions("abc").await.is_err());

    h.cache.set_available(true);
    h.engine.record_usage("abc", "GPT-4", 1).await.unwrap();
}

#[tokio::test]
async fn test_missed_invalidation_stays_stale_until_cleared() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    assert!(h.engine.authorize("abc", "GPT-4").await.unwrap().is_allowed());

    h.cache.set_available(false);
    h.engine.revoke("abc", "GPT-4").await.unwrap();
    h.cache.set_available(true);

    // the entry written before the outage is still served
    assert!(h.engine.authorize("abc", "GPT-4").await.unwrap().is_allowed());

    h.engine.invalidate_permissions("abc").await.unwrap();
    assert_eq!(h.engine.authorize("abc", "GPT-4").await.unwrap(), denied(DenyReason::NoGrant));
}

#[tokio::test]
async fn test_cached_set_expires_after_ttl() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();

    assert_eq!(h.cache.ttl("Permissions:abc"), Some(chrono::Duration::hours(1)));
    h.clock.advance(chrono::Duration::hours(1));
    assert!(h.cache.get("Permissions:abc").await.unwrap().is_none());
}

#[tokio::test]
async fn test_durable_outage_surfaces_on_miss() {
    let h = harness();
    h.engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    h.engine.create_resource("GPT-4", 0).await.unwrap();
    h.engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();

    h.store.set_available(false);

    // served from cache
    assert!(h.engine.authorize("abc", "GPT-4").await.unwrap().is_allowed());

    h.engine.invalidate_permissions("abc").await.unwrap();
    let err = h.engine.authorize("abc", "GPT-4").await.unwrap_err();
    assert!(matches!(err, AccessError::StoreUnavailable { store: StoreKind::Durable, .. }));

    assert!(h.engine.grant("abc", "GPT-4", limits(1, 1)).await.unwrap_err().is_store_unavailable());
}

/// Cache whose writes can be switched off while reads and deletes keep working
struct WriteFailingCache {
    inner: InMemoryCacheStore,
    fail_writes: AtomicBool,
}

#[async_trait]
impl CacheStore for WriteFailingCache {
    async fn get(&self, key: &str) -> AccessResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AccessError::cache("write refused"));
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> AccessResult<()> {
        self.inner.delete(key).await
    }

    async fn increment_fields(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> AccessResult<()> {
        self.inner.increment_fields(key, increments, ttl).await
    }

    async fn read_fields(&self, key: &str, fields: &[&str]) -> AccessResult<Vec<Option<i64>>> {
        self.inner.read_fields(key, fields).await
    }

    async fn ping(&self) -> AccessResult<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_failed_rebuild_write_falls_back_to_invalidation() {
    let cache = Arc::new(WriteFailingCache {
        inner: InMemoryCacheStore::new(),
        fail_writes: AtomicBool::new(false),
    });
    let store = Arc::new(InMemoryAccessStore::new());
    let engine = AccessEngine::new(store, cache.clone(), &AccessConfig::default()).unwrap();

    engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    engine.create_resource("GPT-4", 0).await.unwrap();
    engine.grant("abc", "GPT-4", limits(60, 60)).await.unwrap();
    assert!(cache.get("Permissions:abc").await.unwrap().is_some());

    cache.fail_writes.store(true, Ordering::SeqCst);
    engine.revoke("abc", "GPT-4").await.unwrap();

    // the pre-revoke entry was dropped instead of being served until TTL
    assert!(cache.get("Permissions:abc").await.unwrap().is_none());
    assert_eq!(engine.authorize("abc", "GPT-4").await.unwrap(), denied(DenyReason::NoGrant));
}
