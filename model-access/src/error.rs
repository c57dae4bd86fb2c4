use std::fmt;
use thiserror::Error;

/// Which backing store an operation failed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Relational store holding credentials, resources and grants
    Durable,
    /// Key/value store holding cached permission sets and rate windows
    Cache,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Durable => write!(f, "durable"),
            StoreKind::Cache => write!(f, "cache"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential is disabled")]
    DisabledCredential,

    #[error("Credential already registered")]
    DuplicateCredential,

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("No grant for resource")]
    NoGrant,

    #[error(
        "Duplicate resource: name '{name}' or permission bit {permission_bit} already registered"
    )]
    DuplicateResource { name: String, permission_bit: u8 },

    #[error("Permission bit {0} is outside 0..=63")]
    InvalidPermissionBit(u8),

    #[error("Permission bit {0} is still owned by a registered resource")]
    PermissionBitInUse(u8),

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("{store} store unavailable: {reason}")]
    StoreUnavailable { store: StoreKind, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AccessError {
    pub fn durable(reason: impl Into<String>) -> Self {
        AccessError::StoreUnavailable {
            store: StoreKind::Durable,
            reason: reason.into(),
        }
    }

    pub fn cache(reason: impl Into<String>) -> Self {
        AccessError::StoreUnavailable {
            store: StoreKind::Cache,
            reason: reason.into(),
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AccessError::StoreUnavailable { .. })
    }

    /// Stable code for API responses and log correlation
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::InvalidCredential => codes::INVALID_CREDENTIAL,
            AccessError::DisabledCredential => codes::DISABLED_CREDENTIAL,
            AccessError::DuplicateCredential => codes::DUPLICATE_CREDENTIAL,
            AccessError::UnknownResource(_) => codes::UNKNOWN_RESOURCE,
            AccessError::NoGrant => codes::NO_GRANT,
            AccessError::DuplicateResource { .. } => codes::DUPLICATE_RESOURCE,
            AccessError::InvalidPermissionBit(_) => codes::INVALID_PERMISSION_BIT,
            AccessError::PermissionBitInUse(_) => codes::PERMISSION_BIT_IN_USE,
            AccessError::InvalidRateLimit(_) => codes::INVALID_RATE_LIMIT,
            AccessError::StoreUnavailable {
                store: StoreKind::Durable,
                ..
            } => codes::DURABLE_UNAVAILABLE,
            AccessError::StoreUnavailable {
                store: StoreKind::Cache,
                ..
            } => codes::CACHE_UNAVAILABLE,
            AccessError::Serialization(_) => codes::SERIALIZATION,
            AccessError::Configuration(_) => codes::CONFIGURATION,
        }
    }
}

impl From<sqlx::Error> for AccessError {
    fn from(err: sqlx::Error) -> Self {
        AccessError::durable(err.to_string())
    }
}

impl From<redis::RedisError> for AccessError {
    fn from(err: redis::RedisError) -> Self {
        AccessError::cache(err.to_string())
    }
}

impl From<config::ConfigError> for AccessError {
    fn from(err: config::ConfigError) -> Self {
        AccessError::Configuration(err.to_string())
    }
}

pub type AccessResult<T> = std::result::Result<T, AccessError>;

pub mod codes {
    pub const INVALID_CREDENTIAL: &str = "AUTH_2001";
    pub const DISABLED_CREDENTIAL: &str = "AUTH_2002";
    pub const DUPLICATE_CREDENTIAL: &str = "AUTH_2003";

    pub const UNKNOWN_RESOURCE: &str = "AUTHZ_3001";
    pub const NO_GRANT: &str = "AUTHZ_3002";

    pub const DUPLICATE_RESOURCE: &str = "REGISTRY_3101";
    pub const INVALID_PERMISSION_BIT: &str = "REGISTRY_3102";
    pub const PERMISSION_BIT_IN_USE: &str = "REGISTRY_3103";
    pub const INVALID_RATE_LIMIT: &str = "VALIDATION_1001";

    pub const DURABLE_UNAVAILABLE: &str = "DB_4001";
    pub const CACHE_UNAVAILABLE: &str = "CACHE_4101";

    pub const SERIALIZATION: &str = "INTERNAL_5001";
    pub const CONFIGURATION: &str = "CONFIG_5101";
}
