use crate::{
    cache_store::{CacheStore, RedisCacheStore},
    clock::{Clock, SystemClock},
    config::{AccessConfig, RefreshPolicy},
    error::{AccessError, AccessResult},
    keys,
    models::*,
    permissions::{CachedPermissionSet, PermissionCache},
    rate_limit::RateLimiter,
    repository::{AccessStore, PostgresAccessStore},
};
use logger_redacted::fingerprint;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn denied(key_hash: &str, resource_name: &str, reason: DenyReason) -> Decision {
    debug!(
        credential = %fingerprint(key_hash),
        resource = %resource_name,
        %reason,
        "Access denied"
    );
    Decision::denied(reason)
}

/// A freshly issued credential. The secret is not stored anywhere and
/// cannot be recovered once this value is dropped.
#[derive(Debug)]
pub struct IssuedCredential {
    pub secret: SecretString,
    pub credential: Credential,
}

/// Authorization facade over the durable store, the permission cache and
/// the rate limiter.
///
/// Every mutation commits to the durable store first and only then touches
/// the cache, per the configured [`RefreshPolicy`]. A cache failure at that
/// point is logged and the mutation still succeeds; the stale entry lives at
/// most one TTL.
pub struct AccessEngine {
    store: Arc<dyn AccessStore>,
    cache: Arc<dyn CacheStore>,
    permissions: PermissionCache,
    limiter: RateLimiter,
    refresh: RefreshPolicy,
    key_prefix: String,
}

impl AccessEngine {
    /// # Errors
    ///
    /// Returns [`AccessError::Configuration`] for an invalid rate-limit window.
    pub fn new(
        store: Arc<dyn AccessStore>,
        cache: Arc<dyn CacheStore>,
        config: &AccessConfig,
    ) -> AccessResult<Self> {
        Self::with_clock(store, cache, Arc::new(SystemClock), config)
    }

    /// Same as [`AccessEngine::new`] with an explicit clock for the limiter
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Configuration`] for an invalid rate-limit window.
    pub fn with_clock(
        store: Arc<dyn AccessStore>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: &AccessConfig,
    ) -> AccessResult<Self> {
        let permissions = PermissionCache::new(
            store.clone(),
            cache.clone(),
            config.permission_ttl(),
            config.cache.permission_key_prefix.clone(),
        );
        let limiter = RateLimiter::new(
            cache.clone(),
            clock,
            config.window(),
            config.rate_limit.key_prefix.clone(),
        )?;

        Ok(Self {
            store,
            cache,
            permissions,
            limiter,
            refresh: config.cache.refresh,
            key_prefix: config.keys.prefix.clone(),
        })
    }

    /// Connect to PostgreSQL and Redis, apply migrations, and build an engine
    ///
    /// # Errors
    ///
    /// [`AccessError::StoreUnavailable`] if either store cannot be reached or
    /// a migration fails.
    pub async fn connect(config: &AccessConfig) -> AccessResult<Self> {
        let store = PostgresAccessStore::connect(&config.database).await?;
        store.migrate().await?;
        let cache =
            RedisCacheStore::connect(&config.cache.redis_url, config.operation_timeout()).await?;

        info!("Access engine connected to durable and cache stores");
        Self::new(Arc::new(store), Arc::new(cache), config)
    }

    // =============================================================================
    // Authorization
    // =============================================================================

    /// May `key_hash` use `resource_name`?
    ///
    /// Allowed iff the credential exists, is enabled, holds a grant row for
    /// the resource and has the resource's bit set. Never records usage.
    ///
    /// # Errors
    ///
    /// Only a durable [`AccessError::StoreUnavailable`]; cache failures fall
    /// back to the durable store.
    pub async fn authorize(&self, key_hash: &str, resource_name: &str) -> AccessResult<Decision> {
        let set = match self.permissions.get_permissions(key_hash).await {
            Ok(set) => set,
            Err(AccessError::InvalidCredential) => {
                return Ok(denied(key_hash, resource_name, DenyReason::InvalidCredential));
            }
            Err(AccessError::DisabledCredential) => {
                return Ok(denied(key_hash, resource_name, DenyReason::DisabledCredential));
            }
            Err(e) => return Err(e),
        };

        let limits = set
            .find(resource_name)
            .filter(|entry| entry.access)
            .and_then(|entry| entry.limits());

        match limits {
            Some(limits) => {
                debug!(
                    credential = %fingerprint(key_hash),
                    resource = %resource_name,
                    rpm = limits.requests_per_minute,
                    quota = limits.resource_quota_per_minute,
                    "Access allowed"
                );
                Ok(Decision::allowed(limits))
            }
            None => Ok(denied(key_hash, resource_name, DenyReason::NoGrant)),
        }
    }

    /// Authorize and compare the current window's usage against the grant.
    ///
    /// # Errors
    ///
    /// Durable store failures, and cache failures while reading usage (the
    /// limiter fails closed).
    pub async fn admit(&self, key_hash: &str, resource_name: &str) -> AccessResult<Admission> {
        let limits = match self.authorize(key_hash, resource_name).await? {
            Decision::Denied { reason } => return Ok(Admission::Denied(reason)),
            allowed => allowed.limits().ok_or(AccessError::NoGrant)?,
        };

        let usage = self.limiter.get_current_usage(key_hash, resource_name).await?;
        if usage.exhausts(&limits) {
            info!(
                credential = %fingerprint(key_hash),
                resource = %resource_name,
                requests = usage.request_count,
                used = usage.resource_used,
                "Request throttled"
            );
            Ok(Admission::Throttled { limits, usage })
        } else {
            Ok(Admission::Admitted { limits, usage })
        }
    }

    /// # Errors
    ///
    /// Cache [`AccessError::StoreUnavailable`]; usage is never silently dropped.
    pub async fn record_usage(
        &self,
        key_hash: &str,
        resource_name: &str,
        amount: u64,
    ) -> AccessResult<()> {
        self.limiter.record_usage(key_hash, resource_name, amount).await
    }

    /// # Errors
    ///
    /// Cache [`AccessError::StoreUnavailable`].
    pub async fn get_current_usage(
        &self,
        key_hash: &str,
        resource_name: &str,
    ) -> AccessResult<CurrentUsage> {
        self.limiter.get_current_usage(key_hash, resource_name).await
    }

    /// # Errors
    ///
    /// See [`PermissionCache::get_permissions`].
    pub async fn get_permissions(&self, key_hash: &str) -> AccessResult<CachedPermissionSet> {
        self.permissions.get_permissions(key_hash).await
    }

    /// Drop the cached permission set; idempotent
    ///
    /// # Errors
    ///
    /// Cache [`AccessError::StoreUnavailable`].
    pub async fn invalidate_permissions(&self, key_hash: &str) -> AccessResult<()> {
        self.permissions.invalidate(key_hash).await
    }

    // =============================================================================
    // Grants
    // =============================================================================

    /// Set the resource's bit on the credential and store its rate limits.
    ///
    /// Re-granting after a revoke reuses the existing grant row.
    ///
    /// # Errors
    ///
    /// [`AccessError::UnknownResource`], [`AccessError::InvalidCredential`],
    /// [`AccessError::DisabledCredential`], or a durable store failure.
    pub async fn grant(
        &self,
        key_hash: &str,
        resource_name: &str,
        limits: RateLimits,
    ) -> AccessResult<Grant> {
        let resource = self.require_resource(resource_name).await?;
        let grant = self.store.grant(key_hash, &resource, limits).await?;

        info!(
            credential = %fingerprint(key_hash),
            resource = %resource.name,
            bit = %resource.permission_bit,
            rpm = limits.requests_per_minute,
            quota = limits.resource_quota_per_minute,
            "Grant written"
        );
        self.refresh_after_commit(key_hash).await;
        Ok(grant)
    }

    /// Clear the resource's bit; the grant row and its limits are kept
    ///
    /// # Errors
    ///
    /// [`AccessError::UnknownResource`], [`AccessError::InvalidCredential`],
    /// or a durable store failure.
    pub async fn revoke(&self, key_hash: &str, resource_name: &str) -> AccessResult<()> {
        let resource = self.require_resource(resource_name).await?;
        self.store.revoke(key_hash, &resource).await?;

        info!(
            credential = %fingerprint(key_hash),
            resource = %resource.name,
            bit = %resource.permission_bit,
            "Grant revoked"
        );
        self.refresh_after_commit(key_hash).await;
        Ok(())
    }

    async fn require_resource(&self, resource_name: &str) -> AccessResult<Resource> {
        self.store
            .find_resource_by_name(resource_name)
            .await?
            .ok_or_else(|| AccessError::UnknownResource(resource_name.to_string()))
    }

    /// Bring the cached set in line with a committed mutation
    async fn refresh_after_commit(&self, key_hash: &str) {
        if self.refresh == RefreshPolicy::Rebuild {
            match self.permissions.refresh(key_hash).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(
                        credential = %fingerprint(key_hash),
                        "Rebuilt set not stored, invalidating"
                    );
                }
                Err(e) => {
                    // disabled or deleted credentials have nothing to cache
                    debug!(
                        credential = %fingerprint(key_hash),
                        error = %e,
                        "Rebuild skipped, invalidating"
                    );
                }
            }
        }
        self.invalidate_after_commit(key_hash).await;
    }

    async fn invalidate_after_commit(&self, key_hash: &str) {
        if let Err(e) = self.permissions.invalidate(key_hash).await {
            warn!(
                credential = %fingerprint(key_hash),
                error = %e,
                "Cache invalidation failed after commit; entry stays stale until TTL"
            );
        }
    }

    // =============================================================================
    // Credentials
    // =============================================================================

    /// Generate a new API key for `owner_id` and store only its hash
    ///
    /// # Errors
    ///
    /// Durable store failures.
    pub async fn issue_credential(&self, owner_id: Uuid) -> AccessResult<IssuedCredential> {
        let api_key = keys::generate_api_key(&self.key_prefix);
        let credential = self.register_credential(owner_id, &keys::hash_api_key(&api_key)).await?;

        Ok(IssuedCredential {
            secret: SecretString::new(api_key),
            credential,
        })
    }

    /// # Errors
    ///
    /// [`AccessError::DuplicateCredential`] or durable store failures.
    pub async fn register_credential(
        &self,
        owner_id: Uuid,
        key_hash: &str,
    ) -> AccessResult<Credential> {
        let credential = self.store.create_credential(owner_id, key_hash).await?;
        info!(credential = %fingerprint(key_hash), owner = %owner_id, "Credential registered");
        Ok(credential)
    }

    /// # Errors
    ///
    /// Durable store failures.
    pub async fn find_credential(&self, key_hash: &str) -> AccessResult<Option<Credential>> {
        self.store.find_credential(key_hash).await
    }

    /// # Errors
    ///
    /// Durable store failures.
    pub async fn list_credentials(&self, owner_id: Uuid) -> AccessResult<Vec<Credential>> {
        self.store.list_credentials(owner_id).await
    }

    /// Disable without deleting; the stored bitmask is kept but ignored
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidCredential`] or durable store failures.
    pub async fn disable_credential(&self, key_hash: &str) -> AccessResult<()> {
        if !self.store.set_enabled(key_hash, false).await? {
            return Err(AccessError::InvalidCredential);
        }

        info!(credential = %fingerprint(key_hash), "Credential disabled");
        self.invalidate_after_commit(key_hash).await;
        Ok(())
    }

    /// Delete the credential and all of its grant rows
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidCredential`] or durable store failures.
    pub async fn delete_credential(&self, key_hash: &str) -> AccessResult<()> {
        if !self.store.delete_credential(key_hash).await? {
            return Err(AccessError::InvalidCredential);
        }

        info!(credential = %fingerprint(key_hash), "Credential deleted");
        self.invalidate_after_commit(key_hash).await;
        Ok(())
    }

    // =============================================================================
    // Resources
    // =============================================================================

    /// # Errors
    ///
    /// [`AccessError::InvalidPermissionBit`], [`AccessError::DuplicateResource`]
    /// or durable store failures.
    pub async fn create_resource(&self, name: &str, permission_bit: u8) -> AccessResult<Resource> {
        let bit = PermissionBit::new(permission_bit)?;
        let resource = self.store.create_resource(name, bit).await?;

        info!(resource = %resource.name, bit = %bit, id = %resource.id, "Resource registered");
        Ok(resource)
    }

    /// # Errors
    ///
    /// Durable store failures.
    pub async fn find_resource_by_name(&self, name: &str) -> AccessResult<Option<Resource>> {
        self.store.find_resource_by_name(name).await
    }

    /// # Errors
    ///
    /// Durable store failures.
    pub async fn find_resource_by_id(&self, id: Uuid) -> AccessResult<Option<Resource>> {
        self.store.find_resource_by_id(id).await
    }

    /// # Errors
    ///
    /// Durable store failures.
    pub async fn list_resources(&self) -> AccessResult<Vec<Resource>> {
        self.store.list_resources().await
    }

    /// Delete a resource and its grant rows.
    ///
    /// Credentials that held a grant get their cached set invalidated. Bits
    /// left in bitmasks are reported, not cleared; see
    /// [`AccessEngine::release_permission_bit`].
    ///
    /// # Errors
    ///
    /// [`AccessError::UnknownResource`] or durable store failures.
    pub async fn delete_resource(&self, id: Uuid) -> AccessResult<Resource> {
        let removal = self
            .store
            .delete_resource(id)
            .await?
            .ok_or_else(|| AccessError::UnknownResource(id.to_string()))?;

        info!(
            resource = %removal.resource.name,
            bit = %removal.resource.permission_bit,
            grants = removal.granted_credentials.len(),
            "Resource deleted"
        );
        if removal.stale_bit_holders > 0 {
            warn!(
                resource = %removal.resource.name,
                bit = %removal.resource.permission_bit,
                credentials = removal.stale_bit_holders,
                "Deleted resource's bit is still set on credentials; release it before reuse"
            );
        }

        for key_hash in &removal.granted_credentials {
            self.invalidate_after_commit(key_hash).await;
        }
        Ok(removal.resource)
    }

    /// # Errors
    ///
    /// [`AccessError::UnknownResource`] or durable store failures.
    pub async fn delete_resource_by_name(&self, name: &str) -> AccessResult<Resource> {
        let resource = self.require_resource(name).await?;
        self.delete_resource(resource.id).await
    }

    /// Clear a retired bit from every credential so it can be reassigned.
    ///
    /// Returns how many credentials were changed.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidPermissionBit`], [`AccessError::PermissionBitInUse`]
    /// while a resource owns the bit, or durable store failures.
    pub async fn release_permission_bit(&self, permission_bit: u8) -> AccessResult<usize> {
        let bit = PermissionBit::new(permission_bit)?;
        let released = self.store.release_permission_bit(bit).await?;

        info!(bit = %bit, credentials = released.len(), "Permission bit released");
        for key_hash in &released {
            self.invalidate_after_commit(key_hash).await;
        }
        Ok(released.len())
    }

    // =============================================================================
    // Health
    // =============================================================================

    /// # Errors
    ///
    /// The first [`AccessError::StoreUnavailable`] encountered.
    pub async fn health_check(&self) -> AccessResult<()> {
        self.store.ping().await?;
        self.cache.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::InMemoryCacheStore;
    use crate::repository::InMemoryAccessStore;
    use secrecy::ExposeSecret;

    type Fixture = (Arc<InMemoryAccessStore>, Arc<InMemoryCacheStore>, AccessEngine);

    fn engine_with(refresh: RefreshPolicy) -> Fixture {
        let store = Arc::new(InMemoryAccessStore::new());
        let cache = Arc::new(InMemoryCacheStore::new());
        let mut config = AccessConfig::default();
        config.cache.refresh = refresh;
        let engine = AccessEngine::new(store.clone(), cache.clone(), &config).unwrap();
        (store, cache, engine)
    }

    #[tokio::test]
    async fn test_issued_secret_hashes_to_stored_credential() {
        let (_store, _cache, engine) = engine_with(RefreshPolicy::Rebuild);
        let owner = Uuid::new_v4();

        let issued = engine.issue_credential(owner).await.unwrap();
        assert!(issued.secret.expose_secret().starts_with("sk_"));

        let hash = keys::hash_api_key(issued.secret.expose_secret());
        assert_eq!(hash, issued.credential.key_hash);
        assert_eq!(engine.find_credential(&hash).await.unwrap(), Some(issued.credential));
        assert_eq!(engine.list_credentials(owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_policy_writes_cache_on_grant() {
        let (_store, cache, engine) = engine_with(RefreshPolicy::Rebuild);
        engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
        engine.create_resource("GPT-4", 0).await.unwrap();

        engine.grant("abc", "GPT-4", RateLimits::new(60, 60).unwrap()).await.unwrap();
        assert!(cache.get("Permissions:abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_policy_drops_cache_on_grant() {
        let (_store, cache, engine) = engine_with(RefreshPolicy::Invalidate);
        engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
        engine.create_resource("GPT-4", 0).await.unwrap();
        engine.get_permissions("abc").await.unwrap();
        assert!(cache.get("Permissions:abc").await.unwrap().is_some());

        engine.grant("abc", "GPT-4", RateLimits::new(60, 60).unwrap()).await.unwrap();
        assert!(cache.get("Permissions:abc").await.unwrap().is_none());
        assert!(engine.authorize("abc", "GPT-4").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_grant_to_unknown_resource() {
        let (_store, _cache, engine) = engine_with(RefreshPolicy::Rebuild);
        engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();

        let err = engine.grant("abc", "GPT-4", RateLimits::new(1, 1).unwrap()).await.unwrap_err();
        assert!(matches!(err, AccessError::UnknownResource(name) if name == "GPT-4"));
        assert!(matches!(
            engine.revoke("abc", "GPT-4").await,
            Err(AccessError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_create_resource_rejects_bit_out_of_range() {
        let (_store, _cache, engine) = engine_with(RefreshPolicy::Rebuild);
        assert!(matches!(
            engine.create_resource("GPT-4", 64).await,
            Err(AccessError::InvalidPermissionBit(64))
        ));
    }

    #[tokio::test]
    async fn test_health_check_reports_each_store() {
        let (store, cache, engine) = engine_with(RefreshPolicy::Rebuild);
        assert!(engine.health_check().await.is_ok());

        cache.set_available(false);
        let err = engine.health_check().await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::CACHE_UNAVAILABLE);

        cache.set_available(true);
        store.set_available(false);
        let err = engine.health_check().await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::DURABLE_UNAVAILABLE);
    }
}
