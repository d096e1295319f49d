// Device database operations

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Device record in the database
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub org_id: i32,
    pub hostname: String,
    pub domain: Option<String>,
    pub os_version: Option<String>,
    pub agent_version: Option<String>,
    pub is_allowed: bool,
    pub auto_approve: bool,
    pub assigned_user_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub device_token_hash: Option<String>,
    pub token_created_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub allow_keep_until: bool,
    pub allow_exempt: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create device parameters
#[derive(Debug, Clone)]
pub struct CreateDeviceParams {
    pub org_id: i32,
    pub hostname: String,
    pub domain: Option<String>,
    pub os_version: Option<String>,
    pub assigned_user_id: Option<Uuid>,
}

const DEVICE_COLUMNS: &str = "id, org_id, hostname, domain, os_version, agent_version, \
     is_allowed, auto_approve, assigned_user_id, device_token_hash, token_created_at, \
     last_seen_at, last_heartbeat_at, allow_keep_until, allow_exempt, created_at, updated_at";

/// Creates a new device record
pub async fn create_device<'e>(
    executor: impl PgExecutor<'e>,
    params: CreateDeviceParams,
) -> Result<Device, ApiError> {
    let sql = format!(
        "INSERT INTO devices (id, org_id, hostname, domain, os_version, assigned_user_id)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {DEVICE_COLUMNS}"
    );
    sqlx::query_as::<_, Device>(&sql)
        .bind(Uuid::new_v4())
        .bind(params.org_id)
        .bind(&params.hostname)
        .bind(&params.domain)
        .bind(&params.os_version)
        .bind(params.assigned_user_id)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                ApiError::Conflict("hostname already exists in org".to_string())
            }
            other => other.into(),
        })
}

/// Gets a device by primary key, regardless of org (auth boundary only)
pub async fn get_device(pool: &PgPool, device_id: Uuid) -> Result<Option<Device>, ApiError> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1");
    let device = sqlx::query_as::<_, Device>(&sql)
        .bind(device_id)
        .fetch_optional(pool)
        .await?;
    Ok(device)
}

/// Gets a device by id within an org
pub async fn get_device_in_org(
    pool: &PgPool,
    org_id: i32,
    device_id: Uuid,
) -> Result<Option<Device>, ApiError> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1 AND org_id = $2");
    let device = sqlx::query_as::<_, Device>(&sql)
        .bind(device_id)
        .bind(org_id)
        .fetch_optional(pool)
        .await?;
    Ok(device)
}

/// Lists all devices of an org, oldest first
pub async fn list_devices(pool: &PgPool, org_id: i32) -> Result<Vec<Device>, ApiError> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE org_id = $1 ORDER BY created_at");
    let devices = sqlx::query_as::<_, Device>(&sql)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(devices)
}

/// Devices a user may act on: the one assigned to them plus allow-list links.
pub async fn list_devices_for_user(
    pool: &PgPool,
    org_id: i32,
    user_id: Uuid,
) -> Result<Vec<Device>, ApiError> {
    let sql = format!(
        "SELECT {DEVICE_COLUMNS} FROM devices
         WHERE org_id = $1
           AND (assigned_user_id = $2
                OR id IN (SELECT device_id FROM user_devices
                          WHERE user_id = $2 AND is_allowed))
         ORDER BY created_at"
    );
    let devices = sqlx::query_as::<_, Device>(&sql)
        .bind(org_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(devices)
}

/// Whether a user owns or is allow-listed for a device.
pub async fn user_can_access_device(
    pool: &PgPool,
    user_id: Uuid,
    device_id: Uuid,
) -> Result<bool, ApiError> {
    let allowed: Option<bool> = sqlx::query_scalar(
        "SELECT EXISTS(
             SELECT 1 FROM devices d
             WHERE d.id = $2
               AND (d.assigned_user_id = $1
                    OR EXISTS (SELECT 1 FROM user_devices ud
                               WHERE ud.user_id = $1 AND ud.device_id = $2 AND ud.is_allowed)))",
    )
    .bind(user_id)
    .bind(device_id)
    .fetch_one(pool)
    .await?;
    Ok(allowed.unwrap_or(false))
}

/// Writes back the mutable columns of a device row
pub async fn update_device<'e>(
    executor: impl PgExecutor<'e>,
    device: &Device,
) -> Result<Device, ApiError> {
    let sql = format!(
        "UPDATE devices
         SET hostname = $2, domain = $3, os_version = $4, is_allowed = $5,
             auto_approve = $6, assigned_user_id = $7, allow_keep_until = $8,
             allow_exempt = $9, updated_at = NOW()
         WHERE id = $1
         RETURNING {DEVICE_COLUMNS}"
    );
    sqlx::query_as::<_, Device>(&sql)
        .bind(device.id)
        .bind(&device.hostname)
        .bind(&device.domain)
        .bind(&device.os_version)
        .bind(device.is_allowed)
        .bind(device.auto_approve)
        .bind(device.assigned_user_id)
        .bind(device.allow_keep_until)
        .bind(device.allow_exempt)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                ApiError::Conflict("hostname already exists in org".to_string())
            }
            other => other.into(),
        })
}

/// Stores a freshly rotated device credential hash
pub async fn set_device_token_hash<'e>(
    executor: impl PgExecutor<'e>,
    device_id: Uuid,
    token_hash: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE devices
         SET device_token_hash = $2, token_created_at = NOW(), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(device_id)
    .bind(token_hash)
    .execute(executor)
    .await?;
    Ok(())
}

/// Heartbeat bookkeeping
pub async fn record_heartbeat(
    pool: &PgPool,
    device_id: Uuid,
    agent_version: Option<&str>,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE devices
         SET last_seen_at = NOW(), last_heartbeat_at = NOW(),
             agent_version = COALESCE($2, agent_version), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(device_id)
    .bind(agent_version)
    .execute(pool)
    .await?;
    Ok(())
}

/// Links a user to a device in the explicit allow list
pub async fn link_user_device<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    device_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO user_devices (user_id, device_id, is_allowed)
         VALUES ($1, $2, TRUE)
         ON CONFLICT (user_id, device_id) DO UPDATE SET is_allowed = TRUE",
    )
    .bind(user_id)
    .bind(device_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// User-device allow-list row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserDeviceLink {
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub is_allowed: bool,
    pub created_at: DateTime<Utc>,
}

/// Lists allow-list links for devices of an org, newest first
pub async fn list_user_devices(
    pool: &PgPool,
    org_id: i32,
) -> Result<Vec<UserDeviceLink>, ApiError> {
    let links = sqlx::query_as::<_, UserDeviceLink>(
        "SELECT ud.user_id, ud.device_id, ud.is_allowed, ud.created_at
         FROM user_devices ud
         JOIN devices d ON d.id = ud.device_id
         WHERE d.org_id = $1
         ORDER BY ud.created_at DESC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;
    Ok(links)
}
