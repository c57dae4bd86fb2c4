use crate::error::AccessResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `MODEL_ACCESS__CACHE__REDIS_URL`
pub const ENV_PREFIX: &str = "MODEL_ACCESS";

/// Main engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub keys: KeyConfig,
}

/// Durable store connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long a store call may wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

/// What a grant/revoke does to the cached permission set after commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Recompute and store the set immediately
    Rebuild,
    /// Drop the entry; the next read rebuilds it
    Invalidate,
}

/// Cache store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Lifetime of an untouched cached permission set (default: 1 hour)
    #[serde(default = "default_permission_ttl")]
    pub permission_ttl_secs: u64,

    #[serde(default = "default_permission_key_prefix")]
    pub permission_key_prefix: String,

    /// Upper bound on a single cache call before it counts as unavailable
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    #[serde(default = "default_refresh_policy")]
    pub refresh: RefreshPolicy,
}

/// Fixed-window limiter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Window length; windows align to multiples of this since the epoch
    #[serde(default = "default_window")]
    pub window_secs: u64,

    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,
}

/// Credential issuance settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyConfig {
    /// Prefix of generated API keys (`<prefix>_<hex>`)
    #[serde(default = "default_key_prefix")]
    pub prefix: String,
}

fn default_database_url() -> String { "postgresql://localhost:5432/model_access".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 1 }
fn default_acquire_timeout() -> u64 { 5 } // 5 seconds

fn default_redis_url() -> String { "redis://127.0.0.1:6379/".to_string() }
fn default_permission_ttl() -> u64 { 3600 } // 1 hour
fn default_permission_key_prefix() -> String { "Permissions:".to_string() }
fn default_operation_timeout() -> u64 { 500 } // 500 ms
fn default_refresh_policy() -> RefreshPolicy { RefreshPolicy::Rebuild }

fn default_window() -> u64 { 60 }
fn default_rate_limit_prefix() -> String { "RateLimits".to_string() }

fn default_key_prefix() -> String { "sk".to_string() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            permission_ttl_secs: default_permission_ttl(),
            permission_key_prefix: default_permission_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            refresh: default_refresh_policy(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            key_prefix: default_rate_limit_prefix(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            prefix: default_key_prefix(),
        }
    }
}

impl AccessConfig {
    /// Load configuration from an optional file plus `MODEL_ACCESS__*`
    /// environment variables. Later sources override earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AccessError::Configuration`] when the file is missing
    /// or any value fails to deserialize.
    pub fn load(path: Option<&Path>) -> AccessResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn permission_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.permission_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.operation_timeout_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database.acquire_timeout_secs)
    }
}
