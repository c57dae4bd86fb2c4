//! Read-through, write-invalidate cache of per-credential permission sets.
//!
//! The cache holds the derived decision (access flag plus rate limits per
//! provisioned resource), so a hit answers an authorization check in one
//! cache read. Entries are rebuilt from the durable store on miss and expire
//! after the configured TTL.

use crate::{
    cache_store::CacheStore,
    error::{AccessError, AccessResult},
    models::RateLimits,
    repository::{AccessStore, ProvisionedCredential},
};
use logger_redacted::fingerprint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One resource the credential holds a grant row for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub name: String,
    /// Whether the resource's bit is set in the credential's bitmask
    pub access: bool,
    pub requests_per_minute: Option<u32>,
    pub resource_quota_per_minute: Option<u32>,
}

impl ProvisionedResource {
    pub fn limits(&self) -> Option<RateLimits> {
        Some(RateLimits {
            requests_per_minute: self.requests_per_minute?,
            resource_quota_per_minute: self.resource_quota_per_minute?,
        })
    }
}

/// Snapshot of everything a credential is provisioned for, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPermissionSet {
    pub resources: Vec<ProvisionedResource>,
}

/// Stored form of a permission set; the tag makes format changes explicit
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "version")]
enum CachedPayload {
    #[serde(rename = "1")]
    V1(CachedPermissionSet),
}

impl CachedPermissionSet {
    /// Derive the set from a durable snapshot
    pub fn from_provisioned(provisioned: &ProvisionedCredential) -> Self {
        let bits = provisioned.credential.permission_bits;
        let mut resources: Vec<ProvisionedResource> = provisioned
            .grants
            .iter()
            .map(|(resource, grant)| ProvisionedResource {
                name: resource.name.clone(),
                access: bits.contains(resource.permission_bit),
                requests_per_minute: Some(grant.limits.requests_per_minute),
                resource_quota_per_minute: Some(grant.limits.resource_quota_per_minute),
            })
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        Self { resources }
    }

    pub fn find(&self, name: &str) -> Option<&ProvisionedResource> {
        self.resources
            .binary_search_by(|r| r.name.as_str().cmp(name))
            .ok()
            .and_then(|index| self.resources.get(index))
    }

    /// # Errors
    ///
    /// Returns [`AccessError::Serialization`] if encoding fails.
    pub fn encode(&self) -> AccessResult<String> {
        serde_json::to_string(&CachedPayload::V1(self.clone()))
            .map_err(|e| AccessError::Serialization(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`AccessError::Serialization`] for unknown versions or
    /// malformed payloads.
    pub fn decode(raw: &str) -> AccessResult<Self> {
        let payload: CachedPayload =
            serde_json::from_str(raw).map_err(|e| AccessError::Serialization(e.to_string()))?;
        match payload {
            CachedPayload::V1(mut set) => {
                // older writers may not have sorted
                set.resources.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(set)
            }
        }
    }
}

/// Permission cache over a durable store and a cache store
pub struct PermissionCache {
    store: Arc<dyn AccessStore>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    key_prefix: String,
}

impl PermissionCache {
    pub fn new(
        store: Arc<dyn AccessStore>,
        cache: Arc<dyn CacheStore>,
        ttl: Duration,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            ttl,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn cache_key(&self, key_hash: &str) -> String {
        format!("{}{}", self.key_prefix, key_hash)
    }

    /// Cached set on hit, otherwise rebuild from the durable store.
    ///
    /// Cache failures and unreadable payloads count as a miss.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidCredential`] or [`AccessError::DisabledCredential`]
    /// when rebuilding, or a durable [`AccessError::StoreUnavailable`].
    pub async fn get_permissions(&self, key_hash: &str) -> AccessResult<CachedPermissionSet> {
        let key = self.cache_key(key_hash);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match CachedPermissionSet::decode(&raw) {
                Ok(set) => {
                    debug!(credential = %fingerprint(key_hash), "Permission cache hit");
                    return Ok(set);
                }
                Err(e) => {
                    warn!(
                        credential = %fingerprint(key_hash),
                        error = %e,
                        "Discarding unreadable cached permission set"
                    );
                }
            },
            Ok(None) => {
                debug!(credential = %fingerprint(key_hash), "Permission cache miss");
            }
            Err(e) => {
                warn!(
                    credential = %fingerprint(key_hash),
                    error = %e,
                    "Permission cache read failed, rebuilding from durable store"
                );
            }
        }

        self.rebuild(key_hash).await
    }

    /// Recompute the set from the durable store and write it to the cache.
    ///
    /// A failed cache write is logged; the computed set is still returned.
    ///
    /// # Errors
    ///
    /// Same as [`PermissionCache::get_permissions`].
    pub async fn rebuild(&self, key_hash: &str) -> AccessResult<CachedPermissionSet> {
        self.rebuild_and_store(key_hash).await.map(|(set, _)| set)
    }

    /// Recompute and write the set, reporting whether the write landed.
    ///
    /// `Ok(false)` means the cache may still hold an older set for this
    /// credential.
    ///
    /// # Errors
    ///
    /// Same as [`PermissionCache::get_permissions`].
    pub async fn refresh(&self, key_hash: &str) -> AccessResult<bool> {
        self.rebuild_and_store(key_hash).await.map(|(_, stored)| stored)
    }

    async fn rebuild_and_store(
        &self,
        key_hash: &str,
    ) -> AccessResult<(CachedPermissionSet, bool)> {
        let provisioned = self
            .store
            .load_provisioned(key_hash)
            .await?
            .ok_or(AccessError::InvalidCredential)?;

        if !provisioned.credential.enabled {
            return Err(AccessError::DisabledCredential);
        }

        let set = CachedPermissionSet::from_provisioned(&provisioned);
        let encoded = set.encode()?;
        let key = self.cache_key(key_hash);

        let stored = match self.cache.set_with_ttl(&key, &encoded, self.ttl).await {
            Ok(()) => {
                debug!(
                    credential = %fingerprint(key_hash),
                    resources = set.resources.len(),
                    "Permission set rebuilt"
                );
                true
            }
            Err(e) => {
                warn!(
                    credential = %fingerprint(key_hash),
                    error = %e,
                    "Failed to store rebuilt permission set"
                );
                false
            }
        };

        Ok((set, stored))
    }

    /// Remove the cached set; absent entries are not an error
    ///
    /// # Errors
    ///
    /// Returns a cache [`AccessError::StoreUnavailable`] if the delete fails.
    pub async fn invalidate(&self, key_hash: &str) -> AccessResult<()> {
        self.cache.delete(&self.cache_key(key_hash)).await?;
        debug!(credential = %fingerprint(key_hash), "Permission set invalidated");
        Ok(())
    }
}
