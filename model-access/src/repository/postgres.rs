//! PostgreSQL-backed durable store
//!
//! Credentials, resources and grants live in three tables (see
//! `migrations/0001_model_access.sql`):
//! - the 64-bit access mask is a `BIGINT` holding the raw bit pattern
//! - uniqueness of resource names and bits is enforced by the schema
//! - grant and revoke lock the credential row so concurrent mutations serialize

use crate::{
    config::DatabaseConfig,
    error::{AccessError, AccessResult},
    models::*,
    repository::{
        CredentialStore, GrantStore, ProvisionedCredential, ResourceRegistry, ResourceRemoval,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL implementation of every durable-store trait
#[derive(Clone)]
pub struct PostgresAccessStore {
    pool: PgPool,
}

impl PostgresAccessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized by `config`
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::StoreUnavailable`] if the database is unreachable.
    pub async fn connect(config: &DatabaseConfig) -> AccessResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| AccessError::durable(format!("Failed to connect: {e}")))?;

        info!(
            max_connections = config.max_connections,
            "Durable store connection pool created"
        );
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::StoreUnavailable`] if a migration fails.
    pub async fn migrate(&self) -> AccessResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AccessError::durable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[allow(clippy::cast_possible_wrap)]
fn bits_to_db(bits: PermissionBits) -> i64 {
    bits.raw() as i64
}

#[allow(clippy::cast_sign_loss)]
fn bits_from_db(raw: i64) -> PermissionBits {
    PermissionBits::from_raw(raw as u64)
}

#[allow(clippy::cast_possible_wrap)]
fn mask_to_db(bit: PermissionBit) -> i64 {
    bit.mask() as i64
}

fn limit_to_db(value: u32) -> AccessResult<i32> {
    i32::try_from(value)
        .map_err(|_| AccessError::InvalidRateLimit(format!("{value} exceeds column range")))
}

fn limit_from_db(value: i32) -> AccessResult<u32> {
    u32::try_from(value)
        .map_err(|_| AccessError::durable(format!("stored rate limit {value} is negative")))
}

fn credential_from_row(row: &PgRow) -> AccessResult<Credential> {
    Ok(Credential {
        key_hash: row.try_get("key_hash")?,
        owner_id: row.try_get("owner_id")?,
        enabled: row.try_get("enabled")?,
        permission_bits: bits_from_db(row.try_get("permission_bits")?),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn resource_from_row(row: &PgRow) -> AccessResult<Resource> {
    let raw_bit: i16 = row.try_get("permission_bit")?;
    let index = u8::try_from(raw_bit).map_err(|_| {
        AccessError::durable(format!("stored permission bit {raw_bit} out of range"))
    })?;

    Ok(Resource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        permission_bit: PermissionBit::new(index)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn grant_from_row(row: &PgRow) -> AccessResult<Grant> {
    Ok(Grant {
        key_hash: row.try_get("key_hash")?,
        resource_id: row.try_get("resource_id")?,
        limits: RateLimits {
            requests_per_minute: limit_from_db(row.try_get("requests_per_minute")?)?,
            resource_quota_per_minute: limit_from_db(row.try_get("resource_quota_per_minute")?)?,
        },
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[async_trait]
impl CredentialStore for PostgresAccessStore {
    async fn create_credential(&self, owner_id: Uuid, key_hash: &str) -> AccessResult<Credential> {
        let credential = Credential::new(owner_id, key_hash);

        let result = sqlx::query(
            r"
            INSERT INTO credentials (key_hash, owner_id, enabled, permission_bits, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(&credential.key_hash)
        .bind(credential.owner_id)
        .bind(credential.enabled)
        .bind(bits_to_db(credential.permission_bits))
        .bind(credential.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(credential),
            Err(e) if is_unique_violation(&e) => Err(AccessError::DuplicateCredential),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_credential(&self, key_hash: &str) -> AccessResult<Option<Credential>> {
        let row = sqlx::query(
            r"
            SELECT key_hash, owner_id, enabled, permission_bits, created_at
            FROM credentials
            WHERE key_hash = $1
            ",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn list_credentials(&self, owner_id: Uuid) -> AccessResult<Vec<Credential>> {
        let rows = sqlx::query(
            r"
            SELECT key_hash, owner_id, enabled, permission_bits, created_at
            FROM credentials
            WHERE owner_id = $1
            ORDER BY created_at
            ",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(credential_from_row).collect()
    }

    async fn set_enabled(&self, key_hash: &str, enabled: bool) -> AccessResult<bool> {
        let result = sqlx::query("UPDATE credentials SET enabled = $2 WHERE key_hash = $1")
            .bind(key_hash)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_credential(&self, key_hash: &str) -> AccessResult<bool> {
        // grants go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM credentials WHERE key_hash = $1")
            .bind(key_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> AccessResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceRegistry for PostgresAccessStore {
    async fn create_resource(
        &self,
        name: &str,
        permission_bit: PermissionBit,
    ) -> AccessResult<Resource> {
        let resource = Resource::new(name, permission_bit);

        let result = sqlx::query(
            "INSERT INTO resources (id, name, permission_bit, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(resource.id)
        .bind(&resource.name)
        .bind(i16::from(permission_bit.index()))
        .bind(resource.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(resource = %resource.name, bit = %permission_bit, "Resource row inserted");
                Ok(resource)
            }
            Err(e) if is_unique_violation(&e) => Err(AccessError::DuplicateResource {
                name: name.to_string(),
                permission_bit: permission_bit.index(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_resource_by_name(&self, name: &str) -> AccessResult<Option<Resource>> {
        let row = sqlx::query(
            "SELECT id, name, permission_bit, created_at FROM resources WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(resource_from_row).transpose()
    }

    async fn find_resource_by_id(&self, id: Uuid) -> AccessResult<Option<Resource>> {
        let row =
            sqlx::query("SELECT id, name, permission_bit, created_at FROM resources WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.as_ref().map(resource_from_row).transpose()
    }

    async fn list_resources(&self) -> AccessResult<Vec<Resource>> {
        let rows = sqlx::query(
            "SELECT id, name, permission_bit, created_at FROM resources ORDER BY permission_bit",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(resource_from_row).collect()
    }

    async fn delete_resource(&self, id: Uuid) -> AccessResult<Option<ResourceRemoval>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, name, permission_bit, created_at FROM resources WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let resource = resource_from_row(&row)?;

        let granted_credentials: Vec<String> = sqlx::query_scalar(
            "SELECT key_hash FROM grants WHERE resource_id = $1 ORDER BY key_hash",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let stale_bit_holders: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM credentials WHERE permission_bits & $1::BIGINT <> 0",
        )
        .bind(mask_to_db(resource.permission_bit))
        .fetch_one(&mut *tx)
        .await?;

        // grant rows go with it via ON DELETE CASCADE
        sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(ResourceRemoval {
            resource,
            granted_credentials,
            stale_bit_holders: u64::try_from(stale_bit_holders).unwrap_or_default(),
        }))
    }

    async fn release_permission_bit(
        &self,
        permission_bit: PermissionBit,
    ) -> AccessResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let owned: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM resources WHERE permission_bit = $1 FOR UPDATE")
                .bind(i16::from(permission_bit.index()))
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_some() {
            tx.rollback().await?;
            return Err(AccessError::PermissionBitInUse(permission_bit.index()));
        }

        let mut released: Vec<String> = sqlx::query_scalar(
            r"
            UPDATE credentials
            SET permission_bits = permission_bits & ~$1::BIGINT
            WHERE permission_bits & $1::BIGINT <> 0
            RETURNING key_hash
            ",
        )
        .bind(mask_to_db(permission_bit))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        released.sort();
        Ok(released)
    }
}

#[async_trait]
impl GrantStore for PostgresAccessStore {
    async fn grant(
        &self,
        key_hash: &str,
        resource: &Resource,
        limits: RateLimits,
    ) -> AccessResult<Grant> {
        let mut tx = self.pool.begin().await?;

        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT enabled FROM credentials WHERE key_hash = $1 FOR UPDATE")
                .bind(key_hash)
                .fetch_optional(&mut *tx)
                .await?;
        match enabled {
            None => return Err(AccessError::InvalidCredential),
            Some(false) => return Err(AccessError::DisabledCredential),
            Some(true) => {}
        }

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM resources WHERE id = $1 FOR SHARE")
                .bind(resource.id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(AccessError::UnknownResource(resource.name.clone()));
        }

        sqlx::query(
            r"
            UPDATE credentials
            SET permission_bits = permission_bits | $2::BIGINT
            WHERE key_hash = $1
            ",
        )
        .bind(key_hash)
        .bind(mask_to_db(resource.permission_bit))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO grants
                (key_hash, resource_id, requests_per_minute, resource_quota_per_minute)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key_hash, resource_id) DO UPDATE
            SET requests_per_minute = EXCLUDED.requests_per_minute,
                resource_quota_per_minute = EXCLUDED.resource_quota_per_minute
            ",
        )
        .bind(key_hash)
        .bind(resource.id)
        .bind(limit_to_db(limits.requests_per_minute)?)
        .bind(limit_to_db(limits.resource_quota_per_minute)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Grant {
            key_hash: key_hash.to_string(),
            resource_id: resource.id,
            limits,
        })
    }

    async fn revoke(&self, key_hash: &str, resource: &Resource) -> AccessResult<()> {
        let result = sqlx::query(
            r"
            UPDATE credentials
            SET permission_bits = permission_bits & ~$2::BIGINT
            WHERE key_hash = $1
            ",
        )
        .bind(key_hash)
        .bind(mask_to_db(resource.permission_bit))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccessError::InvalidCredential);
        }
        Ok(())
    }

    async fn find_grant(&self, key_hash: &str, resource_id: Uuid) -> AccessResult<Option<Grant>> {
        let row = sqlx::query(
            r"
            SELECT key_hash, resource_id, requests_per_minute, resource_quota_per_minute
            FROM grants
            WHERE key_hash = $1 AND resource_id = $2
            ",
        )
        .bind(key_hash)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(grant_from_row).transpose()
    }

    async fn load_provisioned(
        &self,
        key_hash: &str,
    ) -> AccessResult<Option<ProvisionedCredential>> {
        // One snapshot for the bitmask and the grant rows
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r"
            SELECT key_hash, owner_id, enabled, permission_bits, created_at
            FROM credentials
            WHERE key_hash = $1
            ",
        )
        .bind(key_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let credential = credential_from_row(&row)?;

        let rows = sqlx::query(
            r"
            SELECT r.id, r.name, r.permission_bit, r.created_at,
                   g.key_hash, g.resource_id, g.requests_per_minute, g.resource_quota_per_minute
            FROM grants g
            JOIN resources r ON r.id = g.resource_id
            WHERE g.key_hash = $1
            ORDER BY r.name
            ",
        )
        .bind(key_hash)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let grants = rows
            .iter()
            .map(|row| Ok((resource_from_row(row)?, grant_from_row(row)?)))
            .collect::<AccessResult<Vec<_>>>()?;

        Ok(Some(ProvisionedCredential { credential, grants }))
    }
}
