// Certificate catalog database operations
//
// Reconciliation identity within an org: SHA-1 fingerprint first, then the
// .NET byte-reversed serial, then the name derived from the filename stem.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Certificate catalog row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Certificate {
    pub id: Uuid,
    pub org_id: i32,
    pub name: String,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial_number: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub sha1_fingerprint: Option<String>,
    pub source_path: Option<String>,
    pub parse_ok: bool,
    pub parse_error: Option<String>,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CERT_COLUMNS: &str = "id, org_id, name, subject, issuer, serial_number, not_before, \
     not_after, sha1_fingerprint, source_path, parse_ok, parse_error, last_ingested_at, \
     last_error_at, created_at, updated_at";

/// Metadata written by the ingestion pipeline
#[derive(Debug, Clone, Default)]
pub struct CertificateMetadata {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial_number: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub sha1_fingerprint: Option<String>,
}

pub async fn get_certificate(
    pool: &PgPool,
    org_id: i32,
    cert_id: Uuid,
) -> Result<Option<Certificate>, ApiError> {
    let sql = format!("SELECT {CERT_COLUMNS} FROM certificates WHERE id = $1 AND org_id = $2");
    let cert = sqlx::query_as::<_, Certificate>(&sql)
        .bind(cert_id)
        .bind(org_id)
        .fetch_optional(pool)
        .await?;
    Ok(cert)
}

pub async fn list_certificates(pool: &PgPool, org_id: i32) -> Result<Vec<Certificate>, ApiError> {
    let sql =
        format!("SELECT {CERT_COLUMNS} FROM certificates WHERE org_id = $1 ORDER BY created_at");
    let certs = sqlx::query_as::<_, Certificate>(&sql)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(certs)
}

/// Manual catalog registration (rows not originating from the drop zone)
pub async fn create_certificate<'e>(
    executor: impl PgExecutor<'e>,
    org_id: i32,
    name: &str,
    source_path: Option<&str>,
) -> Result<Certificate, ApiError> {
    let sql = format!(
        "INSERT INTO certificates (id, org_id, name, source_path)
         VALUES ($1, $2, $3, $4)
         RETURNING {CERT_COLUMNS}"
    );
    sqlx::query_as::<_, Certificate>(&sql)
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(name)
        .bind(source_path)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                ApiError::Conflict("certificate name already exists in org".to_string())
            }
            other => other.into(),
        })
}

/// Looks up a row by the reconciliation keys in priority order.
pub async fn find_for_reconciliation(
    pool: &PgPool,
    org_id: i32,
    sha1: Option<&str>,
    serial: Option<&str>,
    name: &str,
) -> Result<Option<Certificate>, ApiError> {
    if let Some(sha1) = sha1 {
        let sql = format!(
            "SELECT {CERT_COLUMNS} FROM certificates WHERE org_id = $1 AND sha1_fingerprint = $2"
        );
        if let Some(cert) = sqlx::query_as::<_, Certificate>(&sql)
            .bind(org_id)
            .bind(sha1)
            .fetch_optional(pool)
            .await?
        {
            return Ok(Some(cert));
        }
    }
    if let Some(serial) = serial {
        let sql = format!(
            "SELECT {CERT_COLUMNS} FROM certificates WHERE org_id = $1 AND serial_number = $2"
        );
        if let Some(cert) = sqlx::query_as::<_, Certificate>(&sql)
            .bind(org_id)
            .bind(serial)
            .fetch_optional(pool)
            .await?
        {
            return Ok(Some(cert));
        }
    }
    let sql = format!("SELECT {CERT_COLUMNS} FROM certificates WHERE org_id = $1 AND name = $2");
    let cert = sqlx::query_as::<_, Certificate>(&sql)
        .bind(org_id)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(cert)
}

/// Inserts a freshly parsed certificate
pub async fn insert_parsed<'e>(
    executor: impl PgExecutor<'e>,
    org_id: i32,
    name: &str,
    source_path: &str,
    meta: &CertificateMetadata,
) -> Result<Certificate, ApiError> {
    let sql = format!(
        "INSERT INTO certificates
             (id, org_id, name, subject, issuer, serial_number, not_before, not_after,
              sha1_fingerprint, source_path, parse_ok, parse_error, last_ingested_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, NULL, NOW())
         RETURNING {CERT_COLUMNS}"
    );
    let cert = sqlx::query_as::<_, Certificate>(&sql)
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(name)
        .bind(&meta.subject)
        .bind(&meta.issuer)
        .bind(&meta.serial_number)
        .bind(meta.not_before)
        .bind(meta.not_after)
        .bind(&meta.sha1_fingerprint)
        .bind(source_path)
        .fetch_one(executor)
        .await?;
    Ok(cert)
}

/// Refreshes an existing row after a successful parse
pub async fn update_parsed<'e>(
    executor: impl PgExecutor<'e>,
    cert_id: Uuid,
    name: &str,
    source_path: &str,
    meta: &CertificateMetadata,
) -> Result<Certificate, ApiError> {
    let sql = format!(
        "UPDATE certificates
         SET name = $2, subject = $3, issuer = $4, serial_number = $5, not_before = $6,
             not_after = $7, sha1_fingerprint = $8, source_path = $9, parse_ok = TRUE,
             parse_error = NULL, last_ingested_at = NOW(), last_error_at = NULL,
             updated_at = NOW()
         WHERE id = $1
         RETURNING {CERT_COLUMNS}"
    );
    let cert = sqlx::query_as::<_, Certificate>(&sql)
        .bind(cert_id)
        .bind(name)
        .bind(&meta.subject)
        .bind(&meta.issuer)
        .bind(&meta.serial_number)
        .bind(meta.not_before)
        .bind(meta.not_after)
        .bind(&meta.sha1_fingerprint)
        .bind(source_path)
        .fetch_one(executor)
        .await?;
    Ok(cert)
}

/// Marks a parse failure, preserving prior metadata
pub async fn mark_parse_failure<'e>(
    executor: impl PgExecutor<'e>,
    cert_id: Uuid,
    parse_error: &str,
    source_path: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE certificates
         SET parse_ok = FALSE, parse_error = $2, last_ingested_at = NOW(),
             last_error_at = NOW(), source_path = COALESCE(source_path, $3),
             updated_at = NOW()
         WHERE id = $1",
    )
    .bind(cert_id)
    .bind(parse_error)
    .bind(source_path)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn find_by_source_path(
    pool: &PgPool,
    org_id: i32,
    source_path: &str,
) -> Result<Option<Certificate>, ApiError> {
    let sql =
        format!("SELECT {CERT_COLUMNS} FROM certificates WHERE org_id = $1 AND source_path = $2");
    let cert = sqlx::query_as::<_, Certificate>(&sql)
        .bind(org_id)
        .bind(source_path)
        .fetch_optional(pool)
        .await?;
    Ok(cert)
}

/// Rows that still reference a source file (prune candidates)
pub async fn list_with_source_path(
    pool: &PgPool,
    org_id: i32,
) -> Result<Vec<Certificate>, ApiError> {
    let sql = format!(
        "SELECT {CERT_COLUMNS} FROM certificates
         WHERE org_id = $1 AND source_path IS NOT NULL"
    );
    let certs = sqlx::query_as::<_, Certificate>(&sql)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(certs)
}

pub async fn delete_certificate<'e>(
    executor: impl PgExecutor<'e>,
    cert_id: Uuid,
) -> Result<bool, ApiError> {
    let result = sqlx::query("DELETE FROM certificates WHERE id = $1")
        .bind(cert_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}
