// Device-reported installed certificate inventory.
//
// Reports are full snapshots: every reported thumbprint is upserted, and
// rows for this device whose thumbprint is absent from the snapshot are
// stamped `removed_at`.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Inventory row, composite-keyed by (org, device, thumbprint)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceInstalledCert {
    pub org_id: i32,
    pub device_id: Uuid,
    pub thumbprint: String,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub installed_via_agent: bool,
    pub cleanup_mode: Option<String>,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// One certificate as reported by the agent
#[derive(Debug, Clone, Deserialize)]
pub struct ReportedCert {
    pub thumbprint: String,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub installed_via_agent: bool,
    pub cleanup_mode: Option<String>,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
}

/// Upserts a reported certificate, reviving it if previously removed.
pub async fn upsert_reported<'e>(
    executor: impl PgExecutor<'e>,
    org_id: i32,
    device_id: Uuid,
    item: &ReportedCert,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO device_installed_certs
             (org_id, device_id, thumbprint, subject, issuer, serial, not_after,
              installed_via_agent, cleanup_mode, keep_until, keep_reason)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (org_id, device_id, thumbprint) DO UPDATE
         SET subject = EXCLUDED.subject, issuer = EXCLUDED.issuer,
             serial = EXCLUDED.serial, not_after = EXCLUDED.not_after,
             installed_via_agent = EXCLUDED.installed_via_agent,
             cleanup_mode = EXCLUDED.cleanup_mode, keep_until = EXCLUDED.keep_until,
             keep_reason = EXCLUDED.keep_reason, last_seen_at = NOW(), removed_at = NULL",
    )
    .bind(org_id)
    .bind(device_id)
    .bind(&item.thumbprint)
    .bind(&item.subject)
    .bind(&item.issuer)
    .bind(&item.serial)
    .bind(item.not_after)
    .bind(item.installed_via_agent)
    .bind(&item.cleanup_mode)
    .bind(item.keep_until)
    .bind(&item.keep_reason)
    .execute(executor)
    .await?;
    Ok(())
}

/// Marks device rows absent from the reported snapshot as removed.
/// Returns the number of rows newly stamped.
pub async fn mark_absent_removed<'e>(
    executor: impl PgExecutor<'e>,
    org_id: i32,
    device_id: Uuid,
    reported_thumbprints: &[String],
) -> Result<u64, ApiError> {
    let result = sqlx::query(
        "UPDATE device_installed_certs
         SET removed_at = NOW()
         WHERE org_id = $1 AND device_id = $2 AND removed_at IS NULL
           AND thumbprint != ALL($3)",
    )
    .bind(org_id)
    .bind(device_id)
    .bind(reported_thumbprints)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Inventory view with scope and removed filters.
pub async fn list_for_device(
    pool: &PgPool,
    org_id: i32,
    device_id: Uuid,
    agent_only: bool,
    include_removed: bool,
) -> Result<Vec<DeviceInstalledCert>, ApiError> {
    let mut sql = String::from(
        "SELECT org_id, device_id, thumbprint, subject, issuer, serial, not_after,
                installed_via_agent, cleanup_mode, keep_until, keep_reason,
                first_seen_at, last_seen_at, removed_at
         FROM device_installed_certs
         WHERE org_id = $1 AND device_id = $2",
    );
    if agent_only {
        sql.push_str(" AND installed_via_agent");
    }
    if !include_removed {
        sql.push_str(" AND removed_at IS NULL");
    }
    sql.push_str(" ORDER BY thumbprint");

    let rows = sqlx::query_as::<_, DeviceInstalledCert>(&sql)
        .bind(org_id)
        .bind(device_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
