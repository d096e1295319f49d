// Install-job database operations.
//
// Every lifecycle transition is a conditional UPDATE carrying a
// `WHERE status = <expected>` predicate; the database serializes concurrent
// writers so the state machine never relies on read-then-write.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

/// Install-job lifecycle states.
///
/// `Expired` is reserved: it is a legal terminal state but nothing currently
/// transitions into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Requested,
    Pending,
    InProgress,
    Done,
    Failed,
    Canceled,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Requested => "REQUESTED",
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        match value {
            "REQUESTED" => Some(JobStatus::Requested),
            "PENDING" => Some(JobStatus::Pending),
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "DONE" => Some(JobStatus::Done),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            "EXPIRED" => Some(JobStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled | JobStatus::Expired
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention policy attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupMode {
    Default,
    KeepUntil,
    Exempt,
}

impl CleanupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMode::Default => "DEFAULT",
            CleanupMode::KeepUntil => "KEEP_UNTIL",
            CleanupMode::Exempt => "EXEMPT",
        }
    }

    pub fn parse(value: &str) -> Option<CleanupMode> {
        match value {
            "DEFAULT" => Some(CleanupMode::Default),
            "KEEP_UNTIL" => Some(CleanupMode::KeepUntil),
            "EXEMPT" => Some(CleanupMode::Exempt),
            _ => None,
        }
    }
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install-job record in the database
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InstallJob {
    pub id: Uuid,
    pub org_id: i32,
    pub cert_id: Uuid,
    pub device_id: Uuid,
    pub requested_by_user_id: Uuid,
    pub status: String,
    pub approved_by_user_id: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub claimed_by_device_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub thumbprint: Option<String>,
    #[serde(skip_serializing)]
    pub payload_token_hash: Option<String>,
    pub payload_token_expires_at: Option<DateTime<Utc>>,
    pub payload_token_used_at: Option<DateTime<Utc>>,
    pub payload_token_device_id: Option<Uuid>,
    pub cleanup_mode: String,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
    pub keep_set_by_user_id: Option<Uuid>,
    pub keep_set_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallJob {
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status).unwrap_or(JobStatus::Failed)
    }

    pub fn cleanup_mode(&self) -> CleanupMode {
        CleanupMode::parse(&self.cleanup_mode).unwrap_or(CleanupMode::Default)
    }
}

/// Create job parameters
#[derive(Debug, Clone)]
pub struct CreateJobParams {
    pub org_id: i32,
    pub cert_id: Uuid,
    pub device_id: Uuid,
    pub requested_by_user_id: Uuid,
    pub status: JobStatus,
    pub approved_by_user_id: Option<Uuid>,
    pub cleanup_mode: CleanupMode,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
    pub keep_set_by_user_id: Option<Uuid>,
}

const JOB_COLUMNS: &str = "id, org_id, cert_id, device_id, requested_by_user_id, status, \
     approved_by_user_id, approved_at, claimed_by_device_id, claimed_at, started_at, \
     finished_at, error_code, error_message, thumbprint, payload_token_hash, \
     payload_token_expires_at, payload_token_used_at, payload_token_device_id, \
     cleanup_mode, keep_until, keep_reason, keep_set_by_user_id, keep_set_at, \
     created_at, updated_at";

/// Creates a new install job
pub async fn create_job<'e>(
    executor: impl PgExecutor<'e>,
    params: CreateJobParams,
) -> Result<InstallJob, ApiError> {
    let retention_stamped = params.cleanup_mode != CleanupMode::Default;
    let sql = format!(
        "INSERT INTO cert_install_jobs
             (id, org_id, cert_id, device_id, requested_by_user_id, status,
              approved_by_user_id, approved_at, cleanup_mode, keep_until, keep_reason,
              keep_set_by_user_id, keep_set_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7,
                 CASE WHEN $7::uuid IS NULL THEN NULL ELSE NOW() END,
                 $8, $9, $10, $11,
                 CASE WHEN $12 THEN NOW() ELSE NULL END)
         RETURNING {JOB_COLUMNS}"
    );
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(Uuid::new_v4())
        .bind(params.org_id)
        .bind(params.cert_id)
        .bind(params.device_id)
        .bind(params.requested_by_user_id)
        .bind(params.status.as_str())
        .bind(params.approved_by_user_id)
        .bind(params.cleanup_mode.as_str())
        .bind(params.keep_until)
        .bind(&params.keep_reason)
        .bind(params.keep_set_by_user_id)
        .bind(retention_stamped)
        .fetch_one(executor)
        .await?;
    Ok(job)
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM cert_install_jobs WHERE id = $1");
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

pub async fn get_job_in_org(
    pool: &PgPool,
    org_id: i32,
    job_id: Uuid,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM cert_install_jobs WHERE id = $1 AND org_id = $2");
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .bind(org_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// All jobs of an org, newest first
pub async fn list_for_org(pool: &PgPool, org_id: i32) -> Result<Vec<InstallJob>, ApiError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cert_install_jobs
         WHERE org_id = $1 ORDER BY created_at DESC"
    );
    let jobs = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

/// Jobs requested by a user, newest first
pub async fn list_for_requester(
    pool: &PgPool,
    org_id: i32,
    user_id: Uuid,
) -> Result<Vec<InstallJob>, ApiError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cert_install_jobs
         WHERE org_id = $1 AND requested_by_user_id = $2
         ORDER BY created_at DESC"
    );
    let jobs = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(org_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

/// Jobs targeting devices the user owns or is allow-listed for, newest first
pub async fn list_for_user_devices(
    pool: &PgPool,
    org_id: i32,
    user_id: Uuid,
) -> Result<Vec<InstallJob>, ApiError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cert_install_jobs j
         WHERE j.org_id = $1
           AND j.device_id IN (
               SELECT d.id FROM devices d
               WHERE d.org_id = $1
                 AND (d.assigned_user_id = $2
                      OR EXISTS (SELECT 1 FROM user_devices ud
                                 WHERE ud.user_id = $2 AND ud.device_id = d.id AND ud.is_allowed)))
         ORDER BY j.created_at DESC"
    );
    let jobs = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(org_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

/// Open jobs for a device (agent polling view), oldest first
pub async fn list_open_for_device(
    pool: &PgPool,
    org_id: i32,
    device_id: Uuid,
) -> Result<Vec<InstallJob>, ApiError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cert_install_jobs
         WHERE org_id = $1 AND device_id = $2 AND status IN ('PENDING', 'IN_PROGRESS')
         ORDER BY created_at"
    );
    let jobs = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(org_id)
        .bind(device_id)
        .fetch_all(pool)
        .await?;
    Ok(jobs)
}

/// REQUESTED -> PENDING (approve) or CANCELED (deny). Returns None when the
/// job is no longer in REQUESTED.
pub async fn resolve_requested<'e>(
    executor: impl PgExecutor<'e>,
    org_id: i32,
    job_id: Uuid,
    next: JobStatus,
    approver: Uuid,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!(
        "UPDATE cert_install_jobs
         SET status = $3, approved_by_user_id = $4, approved_at = NOW(), updated_at = NOW()
         WHERE id = $1 AND org_id = $2 AND status = 'REQUESTED'
         RETURNING {JOB_COLUMNS}"
    );
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .bind(org_id)
        .bind(next.as_str())
        .bind(approver)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

/// PENDING -> IN_PROGRESS: the claim critical section. Transitions only when
/// the row is still PENDING and assigned to the claiming device.
pub async fn claim_pending<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    device_id: Uuid,
    payload_token_hash: &str,
    payload_token_expires_at: DateTime<Utc>,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!(
        "UPDATE cert_install_jobs
         SET status = 'IN_PROGRESS', claimed_by_device_id = $2, claimed_at = NOW(),
             started_at = NOW(), payload_token_hash = $3, payload_token_expires_at = $4,
             payload_token_used_at = NULL, payload_token_device_id = $2, updated_at = NOW()
         WHERE id = $1 AND device_id = $2 AND status = 'PENDING'
         RETURNING {JOB_COLUMNS}"
    );
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .bind(device_id)
        .bind(payload_token_hash)
        .bind(payload_token_expires_at)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

/// Re-claim by the same device: mints a fresh payload token, invalidating any
/// prior one.
pub async fn refresh_payload_token<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    device_id: Uuid,
    payload_token_hash: &str,
    payload_token_expires_at: DateTime<Utc>,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!(
        "UPDATE cert_install_jobs
         SET payload_token_hash = $3, payload_token_expires_at = $4,
             payload_token_used_at = NULL, payload_token_device_id = $2, updated_at = NOW()
         WHERE id = $1 AND claimed_by_device_id = $2 AND status = 'IN_PROGRESS'
         RETURNING {JOB_COLUMNS}"
    );
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .bind(device_id)
        .bind(payload_token_hash)
        .bind(payload_token_expires_at)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

/// Locks the job row for the payload-lease check (`SELECT ... FOR UPDATE`).
pub async fn lock_job(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM cert_install_jobs WHERE id = $1 FOR UPDATE");
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .fetch_optional(conn)
        .await?;
    Ok(job)
}

/// Burns the payload token under the row lock taken by [`lock_job`].
pub async fn mark_payload_used(conn: &mut PgConnection, job_id: Uuid) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE cert_install_jobs
         SET payload_token_used_at = NOW(), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// IN_PROGRESS -> DONE/FAILED, conditional on the reporting device still
/// holding the claim.
pub async fn complete_job<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    device_id: Uuid,
    status: JobStatus,
    thumbprint: Option<&str>,
    error_code: Option<&str>,
    error_message: Option<&str>,
) -> Result<Option<InstallJob>, ApiError> {
    let sql = format!(
        "UPDATE cert_install_jobs
         SET status = $3, finished_at = NOW(), thumbprint = $4, error_code = $5,
             error_message = $6, updated_at = NOW()
         WHERE id = $1 AND device_id = $2 AND status = 'IN_PROGRESS'
         RETURNING {JOB_COLUMNS}"
    );
    let job = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(job_id)
        .bind(device_id)
        .bind(status.as_str())
        .bind(thumbprint)
        .bind(error_code)
        .bind(error_message)
        .fetch_optional(executor)
        .await?;
    Ok(job)
}

/// Stuck IN_PROGRESS jobs past the cutoff, locked for the reaper sweep.
pub async fn lock_reapable(
    conn: &mut PgConnection,
    org_id: i32,
    cutoff: DateTime<Utc>,
) -> Result<Vec<InstallJob>, ApiError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cert_install_jobs
         WHERE org_id = $1 AND status = 'IN_PROGRESS' AND started_at <= $2
         FOR UPDATE"
    );
    let jobs = sqlx::query_as::<_, InstallJob>(&sql)
        .bind(org_id)
        .bind(cutoff)
        .fetch_all(conn)
        .await?;
    Ok(jobs)
}

/// Times out a single job; conditional so a racing result report wins.
pub async fn fail_timed_out(conn: &mut PgConnection, job_id: Uuid) -> Result<bool, ApiError> {
    let result = sqlx::query(
        "UPDATE cert_install_jobs
         SET status = 'FAILED', finished_at = NOW(), error_code = 'TIMEOUT', updated_at = NOW()
         WHERE id = $1 AND status = 'IN_PROGRESS'",
    )
    .bind(job_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Requested,
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Expired,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(!JobStatus::Requested.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_cleanup_mode_roundtrip() {
        for mode in [CleanupMode::Default, CleanupMode::KeepUntil, CleanupMode::Exempt] {
            assert_eq!(CleanupMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(CleanupMode::parse("FOREVER"), None);
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            r#""IN_PROGRESS""#
        );
        assert_eq!(
            serde_json::to_string(&CleanupMode::KeepUntil).unwrap(),
            r#""KEEP_UNTIL""#
        );
    }
}
