use crate::{
    error::{AccessError, AccessResult},
    models::*,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresAccessStore;

/// Durable record of credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Register a credential by the hash of its secret
    async fn create_credential(&self, owner_id: Uuid, key_hash: &str) -> AccessResult<Credential>;

    async fn find_credential(&self, key_hash: &str) -> AccessResult<Option<Credential>>;

    async fn list_credentials(&self, owner_id: Uuid) -> AccessResult<Vec<Credential>>;

    /// Returns `false` when no such credential exists
    async fn set_enabled(&self, key_hash: &str, enabled: bool) -> AccessResult<bool>;

    /// Delete the credential and cascade its grants
    async fn delete_credential(&self, key_hash: &str) -> AccessResult<bool>;

    /// Round-trip to the store without touching any rows
    async fn ping(&self) -> AccessResult<()>;
}

/// Durable record of resources and their permission bits
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Fails with [`AccessError::DuplicateResource`] if the name or bit is taken
    async fn create_resource(
        &self,
        name: &str,
        permission_bit: PermissionBit,
    ) -> AccessResult<Resource>;

    async fn find_resource_by_name(&self, name: &str) -> AccessResult<Option<Resource>>;

    async fn find_resource_by_id(&self, id: Uuid) -> AccessResult<Option<Resource>>;

    /// All resources, ordered by permission bit
    async fn list_resources(&self) -> AccessResult<Vec<Resource>>;

    /// Delete the resource together with its grant rows.
    ///
    /// Credentials' bitmasks are left untouched.
    async fn delete_resource(&self, id: Uuid) -> AccessResult<Option<ResourceRemoval>>;

    /// Clear `permission_bit` from every credential.
    ///
    /// Refused with [`AccessError::PermissionBitInUse`] while a resource owns
    /// the bit. Returns the hashes of credentials that changed.
    async fn release_permission_bit(
        &self,
        permission_bit: PermissionBit,
    ) -> AccessResult<Vec<String>>;
}

/// Durable per-(credential, resource) rate-limit configuration
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Set the resource's bit on the credential and upsert the grant row,
    /// atomically. Fails on unknown or disabled credentials.
    async fn grant(
        &self,
        key_hash: &str,
        resource: &Resource,
        limits: RateLimits,
    ) -> AccessResult<Grant>;

    /// Clear the resource's bit; the grant row is kept
    async fn revoke(&self, key_hash: &str, resource: &Resource) -> AccessResult<()>;

    async fn find_grant(&self, key_hash: &str, resource_id: Uuid) -> AccessResult<Option<Grant>>;

    /// Credential plus every (resource, grant) pair it has, read together
    async fn load_provisioned(
        &self,
        key_hash: &str,
    ) -> AccessResult<Option<ProvisionedCredential>>;
}

/// The complete durable store consumed by the engine
pub trait AccessStore: CredentialStore + ResourceRegistry + GrantStore {}

impl<T: CredentialStore + ResourceRegistry + GrantStore + ?Sized> AccessStore for T {}

/// Snapshot used to derive a cached permission set
#[derive(Debug, Clone)]
pub struct ProvisionedCredential {
    pub credential: Credential,
    /// Ordered by resource name
    pub grants: Vec<(Resource, Grant)>,
}

/// What a resource deletion touched
#[derive(Debug, Clone)]
pub struct ResourceRemoval {
    pub resource: Resource,
    /// Credentials whose grant row was removed with the resource
    pub granted_credentials: Vec<String>,
    /// Credentials still carrying the freed bit in their bitmask
    pub stale_bit_holders: u64,
}

#[derive(Default)]
struct State {
    credentials: HashMap<String, Credential>,
    resources: HashMap<Uuid, Resource>,
    grants: HashMap<(String, Uuid), Grant>,
}

/// In-memory durable store for testing and development.
///
/// Enforces the same uniqueness rules as the relational schema. Can be
/// switched offline to exercise store-outage paths.
pub struct InMemoryAccessStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl InMemoryAccessStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming (un)reachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> AccessResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AccessError::durable("in-memory store is offline"))
        }
    }
}

impl Default for InMemoryAccessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryAccessStore {
    async fn create_credential(&self, owner_id: Uuid, key_hash: &str) -> AccessResult<Credential> {
        self.check_available()?;
        let mut state = self.state.lock();

        if state.credentials.contains_key(key_hash) {
            return Err(AccessError::DuplicateCredential);
        }

        let credential = Credential::new(owner_id, key_hash);
        state.credentials.insert(key_hash.to_string(), credential.clone());
        Ok(credential)
    }

    async fn find_credential(&self, key_hash: &str) -> AccessResult<Option<Credential>> {
        self.check_available()?;
        Ok(self.state.lock().credentials.get(key_hash).cloned())
    }

    async fn list_credentials(&self, owner_id: Uuid) -> AccessResult<Vec<Credential>> {
        self.check_available()?;
        let mut credentials: Vec<Credential> = self
            .state
            .lock()
            .credentials
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect();
        credentials.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(credentials)
    }

    async fn set_enabled(&self, key_hash: &str, enabled: bool) -> AccessResult<bool> {
        self.check_available()?;
        match self.state.lock().credentials.get_mut(key_hash) {
            Some(credential) => {
                credential.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_credential(&self, key_hash: &str) -> AccessResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();

        if state.credentials.remove(key_hash).is_none() {
            return Ok(false);
        }
        state.grants.retain(|(hash, _), _| hash != key_hash);
        Ok(true)
    }

    async fn ping(&self) -> AccessResult<()> {
        self.check_available()
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryAccessStore {
    async fn create_resource(
        &self,
        name: &str,
        permission_bit: PermissionBit,
    ) -> AccessResult<Resource> {
        self.check_available()?;
        let mut state = self.state.lock();

        let taken = state
            .resources
            .values()
            .any(|r| r.name == name || r.permission_bit == permission_bit);
        if taken {
            return Err(AccessError::DuplicateResource {
                name: name.to_string(),
                permission_bit: permission_bit.index(),
            });
        }

        let resource = Resource::new(name, permission_bit);
        state.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn find_resource_by_name(&self, name: &str) -> AccessResult<Option<Resource>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .resources
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn find_resource_by_id(&self, id: Uuid) -> AccessResult<Option<Resource>> {
        self.check_available()?;
        Ok(self.state.lock().resources.get(&id).cloned())
    }

    async fn list_resources(&self) -> AccessResult<Vec<Resource>> {
        self.check_available()?;
        let mut resources: Vec<Resource> = self.state.lock().resources.values().cloned().collect();
        resources.sort_by_key(|r| r.permission_bit);
        Ok(resources)
    }

    async fn delete_resource(&self, id: Uuid) -> AccessResult<Option<ResourceRemoval>> {
        self.check_available()?;
        let mut state = self.state.lock();

        let Some(resource) = state.resources.remove(&id) else {
            return Ok(None);
        };

        let mut granted_credentials = Vec::new();
        state.grants.retain(|(hash, resource_id), _| {
            if *resource_id == id {
                granted_credentials.push(hash.clone());
                false
            } else {
                true
            }
        });
        granted_credentials.sort();

        let stale_bit_holders = state
            .credentials
            .values()
            .filter(|c| c.permission_bits.contains(resource.permission_bit))
            .count() as u64;

        Ok(Some(ResourceRemoval {
            resource,
            granted_credentials,
            stale_bit_holders,
        }))
    }

    async fn release_permission_bit(
        &self,
        permission_bit: PermissionBit,
    ) -> AccessResult<Vec<String>> {
        self.check_available()?;
        let mut state = self.state.lock();

        if state.resources.values().any(|r| r.permission_bit == permission_bit) {
            return Err(AccessError::PermissionBitInUse(permission_bit.index()));
        }

        let mut released = Vec::new();
        for credential in state.credentials.values_mut() {
            if credential.permission_bits.contains(permission_bit) {
                credential.permission_bits = credential.permission_bits.without(permission_bit);
                released.push(credential.key_hash.clone());
            }
        }
        released.sort();
        Ok(released)
    }
}

#[async_trait]
impl GrantStore for InMemoryAccessStore {
    async fn grant(
        &self,
        key_hash: &str,
        resource: &Resource,
        limits: RateLimits,
    ) -> AccessResult<Grant> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.resources.contains_key(&resource.id) {
            return Err(AccessError::UnknownResource(resource.name.clone()));
        }

        let credential = state
            .credentials
            .get_mut(key_hash)
            .ok_or(AccessError::InvalidCredential)?;
        if !credential.enabled {
            return Err(AccessError::DisabledCredential);
        }
        credential.permission_bits = credential.permission_bits.with(resource.permission_bit);

        let grant = Grant {
            key_hash: key_hash.to_string(),
            resource_id: resource.id,
            limits,
        };
        state
            .grants
            .insert((key_hash.to_string(), resource.id), grant.clone());
        Ok(grant)
    }

    async fn revoke(&self, key_hash: &str, resource: &Resource) -> AccessResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.resources.contains_key(&resource.id) {
            return Err(AccessError::UnknownResource(resource.name.clone()));
        }

        let credential = state
            .credentials
            .get_mut(key_hash)
            .ok_or(AccessError::InvalidCredential)?;
        credential.permission_bits = credential.permission_bits.without(resource.permission_bit);
        Ok(())
    }

    async fn find_grant(&self, key_hash: &str, resource_id: Uuid) -> AccessResult<Option<Grant>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .grants
            .get(&(key_hash.to_string(), resource_id))
            .cloned())
    }

    async fn load_provisioned(
        &self,
        key_hash: &str,
    ) -> AccessResult<Option<ProvisionedCredential>> {
        self.check_available()?;
        let state = self.state.lock();

        let Some(credential) = state.credentials.get(key_hash).cloned() else {
            return Ok(None);
        };

        let mut grants: Vec<(Resource, Grant)> = state
            .grants
            .iter()
            .filter(|((hash, _), _)| hash == key_hash)
            .filter_map(|((_, resource_id), grant)| {
                state
                    .resources
                    .get(resource_id)
                    .map(|resource| (resource.clone(), grant.clone()))
            })
            .collect();
        grants.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));

        Ok(Some(ProvisionedCredential { credential, grants }))
    }
}
