use crate::error::{AccessError, AccessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Index of a resource inside a credential's 64-bit access bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PermissionBit(u8);

impl PermissionBit {
    pub const MAX: u8 = 63;

    /// # Errors
    ///
    /// Returns [`AccessError::InvalidPermissionBit`] for indexes above 63.
    pub fn new(index: u8) -> AccessResult<Self> {
        if index > Self::MAX {
            return Err(AccessError::InvalidPermissionBit(index));
        }
        Ok(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u64 {
        1u64 << self.0
    }
}

impl TryFrom<u8> for PermissionBit {
    type Error = AccessError;

    fn try_from(index: u8) -> AccessResult<Self> {
        Self::new(index)
    }
}

impl From<PermissionBit> for u8 {
    fn from(bit: PermissionBit) -> Self {
        bit.0
    }
}

impl fmt::Display for PermissionBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A credential's access bitmask; bit *i* grants the resource owning bit *i*
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionBits(u64);

impl PermissionBits {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn contains(self, bit: PermissionBit) -> bool {
        self.0 & bit.mask() != 0
    }

    #[must_use]
    pub fn with(self, bit: PermissionBit) -> Self {
        Self(self.0 | bit.mask())
    }

    #[must_use]
    pub fn without(self, bit: PermissionBit) -> Self {
        Self(self.0 & !bit.mask())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Caller-held credential, stored and looked up by the hash of its secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub key_hash: String,
    pub owner_id: Uuid,
    pub enabled: bool,
    pub permission_bits: PermissionBits,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(owner_id: Uuid, key_hash: impl Into<String>) -> Self {
        Self {
            key_hash: key_hash.into(),
            owner_id,
            enabled: true,
            permission_bits: PermissionBits::empty(),
            created_at: Utc::now(),
        }
    }

    /// Whether the access bit for `resource` is set (ignores `enabled`)
    pub fn has_bit_for(&self, resource: &Resource) -> bool {
        self.permission_bits.contains(resource.permission_bit)
    }
}

/// A named capability (a served model) guarded by one permission bit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub permission_bit: PermissionBit,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(name: impl Into<String>, permission_bit: PermissionBit) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            permission_bit,
            created_at: Utc::now(),
        }
    }
}

/// Per-minute budget attached to a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub resource_quota_per_minute: u32,
}

impl RateLimits {
    /// Largest value the durable store can hold (signed 32-bit column)
    pub const MAX_VALUE: u32 = i32::MAX as u32;

    /// # Errors
    ///
    /// Both values must be positive and fit the durable store's column type.
    pub fn new(requests_per_minute: u32, resource_quota_per_minute: u32) -> AccessResult<Self> {
        for (field, value) in [
            ("requests_per_minute", requests_per_minute),
            ("resource_quota_per_minute", resource_quota_per_minute),
        ] {
            if value == 0 || value > Self::MAX_VALUE {
                return Err(AccessError::InvalidRateLimit(format!(
                    "{field} must be between 1 and {}, got {value}",
                    Self::MAX_VALUE
                )));
            }
        }

        Ok(Self {
            requests_per_minute,
            resource_quota_per_minute,
        })
    }
}

/// Rate-limit configuration for a (credential, resource) pair.
///
/// Survives revocation: revoke clears the permission bit only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub key_hash: String,
    pub resource_id: Uuid,
    pub limits: RateLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    InvalidCredential,
    DisabledCredential,
    UnknownResource,
    NoGrant,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DenyReason::InvalidCredential => "invalid_credential",
            DenyReason::DisabledCredential => "disabled_credential",
            DenyReason::UnknownResource => "unknown_resource",
            DenyReason::NoGrant => "no_grant",
        };
        write!(f, "{reason}")
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Allowed {
        requests_per_minute: u32,
        resource_quota_per_minute: u32,
    },
    Denied {
        reason: DenyReason,
    },
}

impl Decision {
    pub fn allowed(limits: RateLimits) -> Self {
        Decision::Allowed {
            requests_per_minute: limits.requests_per_minute,
            resource_quota_per_minute: limits.resource_quota_per_minute,
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        Decision::Denied { reason }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn limits(&self) -> Option<RateLimits> {
        match *self {
            Decision::Allowed {
                requests_per_minute,
                resource_quota_per_minute,
            } => Some(RateLimits {
                requests_per_minute,
                resource_quota_per_minute,
            }),
            Decision::Denied { .. } => None,
        }
    }
}

/// Consumption inside the current fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub request_count: u64,
    pub resource_used: u64,
    /// Seconds until the window boundary, in `1..=window`
    pub seconds_remaining: u64,
}

impl CurrentUsage {
    /// Whether either budget is already spent
    pub fn exhausts(&self, limits: &RateLimits) -> bool {
        self.request_count >= u64::from(limits.requests_per_minute)
            || self.resource_used >= u64::from(limits.resource_quota_per_minute)
    }
}

/// Result of combining authorization with the current window's usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { limits: RateLimits, usage: CurrentUsage },
    Throttled { limits: RateLimits, usage: CurrentUsage },
    Denied(DenyReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}
