//! Credential authorization and per-minute rate limiting for model gateways
//!
//! This crate decides whether an API credential may call a resource (a served
//! model) and tracks how much of its per-minute budget it has used:
//! - Credentials carry a 64-bit access mask; each resource owns one bit
//! - Grants hold the per-(credential, resource) rate limits
//! - Permission sets are cached read-through and invalidated on mutation
//! - Usage is counted in fixed, epoch-aligned 60 second windows
//!
//! # Core Concepts
//!
//! - **Credential**: identified only by the SHA-512 hash of its secret
//! - **Resource**: a named capability guarded by a permission bit
//! - **Grant**: rate limits for a pair, kept across revoke/re-grant
//! - **Decision**: `Allowed { rpm, quota }` or `Denied { reason }`
//!
//! # Example
//!
//! ```rust,no_run
//! use model_access::{AccessConfig, AccessEngine, RateLimits};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AccessConfig::load(None)?;
//!     let engine = AccessEngine::connect(&config).await?;
//!
//!     engine.create_resource("GPT-4", 0).await?;
//!     let issued = engine.issue_credential(uuid::Uuid::new_v4()).await?;
//!     let hash = issued.credential.key_hash.clone();
//!
//!     engine.grant(&hash, "GPT-4", RateLimits::new(60, 100_000)?).await?;
//!
//!     if engine.admit(&hash, "GPT-4").await?.is_admitted() {
//!         // ... dispatch the request, then account for it
//!         engine.record_usage(&hash, "GPT-4", 1_250).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache_store;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod models;
pub mod permissions;
pub mod rate_limit;
pub mod repository;

pub use cache_store::{CacheStore, InMemoryCacheStore, RedisCacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessConfig, RefreshPolicy};
pub use engine::{AccessEngine, IssuedCredential};
pub use error::{AccessError, AccessResult, StoreKind};
pub use models::*;
pub use permissions::{CachedPermissionSet, PermissionCache, ProvisionedResource};
pub use rate_limit::RateLimiter;
pub use repository::{
    AccessStore, CredentialStore, GrantStore, InMemoryAccessStore, PostgresAccessStore,
    ResourceRegistry,
};
