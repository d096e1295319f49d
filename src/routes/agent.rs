// Agent protocol route handlers: device auth, heartbeat, job polling, the
// claim/payload/result cycle, and installed-cert reporting.
//
// Payload delivery is the sensitive path: the lease check runs under a row
// lock, the token is burned before any bytes leave the process, and every
// denial is audited with its reason.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::audit::{self, AuditAction, AuditEvent},
    db::certificates,
    db::devices::{self, Device},
    db::installed_certs::{self, ReportedCert},
    db::jobs::{self, InstallJob, JobStatus},
    error::ApiError,
    ingest::guess_password_from_path,
    middleware::auth::CurrentDevice,
    rate_limit::{
        agent_auth_key, agent_payload_key, AGENT_AUTH_LIMIT, AGENT_PAYLOAD_LIMIT, WINDOW_SECONDS,
    },
    security::{generate_token, hash_token, token_hashes_match},
    AppState,
};

/// Payload tokens live for two minutes from claim.
const PAYLOAD_TOKEN_TTL_SECONDS: i64 = 120;

#[derive(Debug, Deserialize)]
pub struct AgentAuthRequest {
    pub device_id: Uuid,
    pub device_token: String,
}

#[derive(Debug, Serialize)]
pub struct AgentAuthResponse {
    pub access_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    #[serde(flatten)]
    pub job: InstallJob,
    pub payload_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PayloadQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PayloadResponse {
    pub job_id: Uuid,
    pub cert_id: Uuid,
    pub pfx_base64: String,
    pub password: String,
    pub source_path: String,
    pub generated_at: DateTime<Utc>,
    pub cleanup_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub status: String,
    pub thumbprint: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InstalledCertsReport {
    pub device_id: Uuid,
    pub items: Vec<ReportedCert>,
}

#[derive(Debug, Serialize)]
pub struct InstalledCertsReportResponse {
    pub reported: usize,
    pub removed: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupEvent {
    #[serde(default)]
    pub removed_count: u64,
    #[serde(default)]
    pub thumbprints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Creates agent routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth", post(agent_auth))
        .route("/heartbeat", post(heartbeat))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id/claim", post(claim_job))
        .route("/jobs/:job_id/payload", get(job_payload))
        .route("/jobs/:job_id/result", post(job_result))
        .route("/installed-certs/report", post(report_installed_certs))
        .route("/cleanup", post(cleanup_event))
}

/// POST /agent/auth - exchange the device credential for a short-lived token
#[tracing::instrument(skip(state, req), fields(device_id = %req.device_id))]
async fn agent_auth(
    State(state): State<AppState>,
    Json(req): Json<AgentAuthRequest>,
) -> Result<Json<AgentAuthResponse>, ApiError> {
    let (allowed, _) = state
        .rate_limiter
        .check(&agent_auth_key(req.device_id), AGENT_AUTH_LIMIT, WINDOW_SECONDS)
        .await;
    if !allowed {
        return Err(ApiError::RateLimited("too many auth attempts".to_string()));
    }

    let device = devices::get_device(&state.db_pool, req.device_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid credentials".to_string()))?;

    if !device.is_allowed {
        return Err(ApiError::Forbidden("device blocked".to_string()));
    }
    let Some(stored_hash) = &device.device_token_hash else {
        return Err(ApiError::Forbidden(
            "device token not provisioned".to_string(),
        ));
    };

    if !token_hashes_match(&hash_token(&req.device_token), stored_hash) {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }

    let access_token = state
        .jwt
        .mint_device_token(device.id, state.settings.device_token_ttl_min)?;
    Ok(Json(AgentAuthResponse { access_token }))
}

/// POST /agent/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    devices::record_heartbeat(
        &state.db_pool,
        current_device.0.id,
        req.agent_version.as_deref(),
    )
    .await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// GET /agent/jobs - PENDING and IN_PROGRESS jobs for this device
async fn list_jobs(
    State(state): State<AppState>,
    current_device: CurrentDevice,
) -> Result<Json<Vec<InstallJob>>, ApiError> {
    let device = current_device.0;
    let jobs = jobs::list_open_for_device(&state.db_pool, device.org_id, device.id).await?;
    Ok(Json(jobs))
}

/// Looks up a job for this device's org, hiding cross-org rows.
async fn job_for_device(
    state: &AppState,
    device: &Device,
    job_id: Uuid,
) -> Result<InstallJob, ApiError> {
    jobs::get_job_in_org(&state.db_pool, device.org_id, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("job not found".to_string()))
}

/// POST /agent/jobs/{id}/claim
///
/// Atomically transitions PENDING -> IN_PROGRESS and mints the single-use
/// payload token. A re-claim by the holding device refreshes the token,
/// invalidating the previous one; anything else is a 409.
#[tracing::instrument(skip(state, current_device), fields(job_id = %job_id))]
async fn claim_job(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let device = current_device.0;

    let job = job_for_device(&state, &device, job_id).await?;
    if job.device_id != device.id {
        return Err(ApiError::Forbidden("job not assigned".to_string()));
    }

    let payload_token = generate_token();
    let token_hash = hash_token(&payload_token);
    let expires_at = Utc::now() + Duration::seconds(PAYLOAD_TOKEN_TTL_SECONDS);

    let mut tx = state.db_pool.begin().await?;
    let claimed =
        jobs::claim_pending(&mut *tx, job_id, device.id, &token_hash, expires_at).await?;
    let job = match claimed {
        Some(job) => job,
        None => {
            // Same-device re-claim refreshes the payload token.
            jobs::refresh_payload_token(&mut *tx, job_id, device.id, &token_hash, expires_at)
                .await?
                .ok_or_else(|| ApiError::Conflict("job not claimable".to_string()))?
        }
    };
    audit::log(
        &mut *tx,
        AuditEvent::new(device.org_id, AuditAction::InstallClaimed, "cert_install_job")
            .entity(job.id)
            .device(device.id)
            .meta(json!({
                "job_id": job.id.to_string(),
                "device_id": device.id.to_string(),
            })),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(ClaimResponse { job, payload_token }))
}

/// A payload-lease denial: audited reason plus the client-facing error.
struct PayloadDenial {
    reason: &'static str,
    error: ApiError,
}

fn lease_check(
    job: &InstallJob,
    device: &Device,
    presented_hash: &str,
    now: DateTime<Utc>,
) -> Result<(), PayloadDenial> {
    if job.status() != JobStatus::InProgress
        || job.claimed_by_device_id != Some(device.id)
    {
        return Err(PayloadDenial {
            reason: "job_not_in_progress",
            error: ApiError::Conflict("job not in progress".to_string()),
        });
    }
    let Some(stored_hash) = &job.payload_token_hash else {
        return Err(PayloadDenial {
            reason: "token_mismatch",
            error: ApiError::Forbidden("payload token mismatch".to_string()),
        });
    };
    if !token_hashes_match(presented_hash, stored_hash) {
        return Err(PayloadDenial {
            reason: "token_mismatch",
            error: ApiError::Forbidden("payload token mismatch".to_string()),
        });
    }
    if job.payload_token_device_id != Some(device.id) {
        return Err(PayloadDenial {
            reason: "device_mismatch",
            error: ApiError::Forbidden("payload token bound to another device".to_string()),
        });
    }
    match job.payload_token_expires_at {
        Some(expires_at) if now <= expires_at => {}
        _ => {
            return Err(PayloadDenial {
                reason: "token_expired",
                error: ApiError::Gone("payload token expired".to_string()),
            });
        }
    }
    if job.payload_token_used_at.is_some() {
        return Err(PayloadDenial {
            reason: "token_used",
            error: ApiError::Conflict("payload token already used".to_string()),
        });
    }
    Ok(())
}

async fn audit_payload_denied(
    state: &AppState,
    device: &Device,
    job_id: Uuid,
    reason: &str,
) -> Result<(), ApiError> {
    audit::log(
        &state.db_pool,
        AuditEvent::new(device.org_id, AuditAction::PayloadDenied, "cert_install_job")
            .entity(job_id)
            .device(device.id)
            .meta(json!({"reason": reason})),
    )
    .await
}

/// GET /agent/jobs/{id}/payload?token=...
///
/// Single-use lease: validated and burned under `SELECT ... FOR UPDATE`, then
/// the PKCS#12 bytes are read only after the transaction committed.
#[tracing::instrument(skip(state, current_device, query), fields(job_id = %job_id))]
async fn job_payload(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    Path(job_id): Path<Uuid>,
    Query(query): Query<PayloadQuery>,
) -> Result<Json<PayloadResponse>, ApiError> {
    let device = current_device.0;

    let (allowed, _) = state
        .rate_limiter
        .check(
            &agent_payload_key(device.id),
            AGENT_PAYLOAD_LIMIT,
            WINDOW_SECONDS,
        )
        .await;
    if !allowed {
        audit::log(
            &state.db_pool,
            AuditEvent::new(
                device.org_id,
                AuditAction::PayloadRateLimited,
                "cert_install_job",
            )
            .entity(job_id)
            .device(device.id),
        )
        .await?;
        return Err(ApiError::RateLimited(
            "too many payload attempts".to_string(),
        ));
    }

    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        audit_payload_denied(&state, &device, job_id, "missing_token").await?;
        return Err(ApiError::PreconditionRequired(
            "payload token required".to_string(),
        ));
    };
    let presented_hash = hash_token(&token);

    // Lease check-and-burn under a row lock.
    let mut tx = state.db_pool.begin().await?;
    let Some(job) = jobs::lock_job(&mut tx, job_id).await? else {
        return Err(ApiError::NotFound("job not found".to_string()));
    };
    if job.org_id != device.org_id {
        return Err(ApiError::NotFound("job not found".to_string()));
    }
    if job.device_id != device.id {
        drop(tx);
        audit_payload_denied(&state, &device, job_id, "device_mismatch").await?;
        return Err(ApiError::Forbidden("job not assigned".to_string()));
    }
    if let Err(denial) = lease_check(&job, &device, &presented_hash, Utc::now()) {
        drop(tx);
        // Denial audits commit even though the lease did not.
        audit_payload_denied(&state, &device, job_id, denial.reason).await?;
        return Err(denial.error);
    }
    jobs::mark_payload_used(&mut tx, job_id).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(device.org_id, AuditAction::PayloadIssued, "cert_install_job")
            .entity(job.id)
            .device(device.id)
            .meta(json!({"job_id": job.id.to_string()})),
    )
    .await?;
    tx.commit().await?;

    // The token is burned; now assemble the payload.
    let certificate = certificates::get_certificate(&state.db_pool, device.org_id, job.cert_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("certificate not found".to_string()))?;
    let source_path = certificate
        .source_path
        .clone()
        .ok_or_else(|| ApiError::NotFound("certificate source path missing".to_string()))?;
    let path = std::path::Path::new(&source_path);
    if !path.exists() {
        return Err(ApiError::NotFound("certificate file not found".to_string()));
    }
    let password = guess_password_from_path(path).ok_or_else(|| {
        ApiError::Unprocessable("certificate password not available in filename".to_string())
    })?;
    let raw_bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::Internal(format!("unable to read certificate: {e}")))?;

    Ok(Json(PayloadResponse {
        job_id: job.id,
        cert_id: certificate.id,
        pfx_base64: base64::engine::general_purpose::STANDARD.encode(&raw_bytes),
        password,
        source_path,
        generated_at: Utc::now(),
        cleanup_mode: job.cleanup_mode.clone(),
        keep_until: job.keep_until,
        keep_reason: job.keep_reason.clone(),
    }))
}

/// POST /agent/jobs/{id}/result
#[tracing::instrument(skip(state, current_device, req), fields(job_id = %job_id))]
async fn job_result(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    Path(job_id): Path<Uuid>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<InstallJob>, ApiError> {
    let device = current_device.0;

    let final_status = match req.status.as_str() {
        "DONE" => JobStatus::Done,
        "FAILED" => JobStatus::Failed,
        other => {
            return Err(ApiError::Unprocessable(format!(
                "status must be DONE or FAILED, got '{other}'"
            )))
        }
    };

    let job = job_for_device(&state, &device, job_id).await?;
    if job.device_id != device.id {
        return Err(ApiError::Forbidden("job not assigned".to_string()));
    }

    let thumbprint = (final_status == JobStatus::Done)
        .then_some(req.thumbprint.as_deref())
        .flatten();
    let error_code = (final_status == JobStatus::Failed)
        .then_some(req.error_code.as_deref())
        .flatten();
    let error_message = (final_status == JobStatus::Failed)
        .then_some(req.error_message.as_deref())
        .flatten();

    let mut tx = state.db_pool.begin().await?;
    let updated = jobs::complete_job(
        &mut *tx,
        job_id,
        device.id,
        final_status,
        thumbprint,
        error_code,
        error_message,
    )
    .await?;

    let Some(updated) = updated else {
        drop(tx);
        // Idempotent duplicate vs. an outright invalid report.
        let current = job_for_device(&state, &device, job_id).await?;
        let action = if current.status().is_terminal() {
            AuditAction::ResultDuplicate
        } else {
            AuditAction::ResultDenied
        };
        audit::log(
            &state.db_pool,
            AuditEvent::new(device.org_id, action, "cert_install_job")
                .entity(job_id)
                .device(device.id)
                .meta(json!({"reported_status": req.status})),
        )
        .await?;
        return Err(ApiError::Conflict("job not updatable".to_string()));
    };

    let action = if final_status == JobStatus::Done {
        AuditAction::InstallDone
    } else {
        AuditAction::InstallFailed
    };
    audit::log(
        &mut *tx,
        AuditEvent::new(device.org_id, action, "cert_install_job")
            .entity(updated.id)
            .device(device.id)
            .meta(json!({
                "job_id": updated.id.to_string(),
                "device_id": device.id.to_string(),
                "status": updated.status,
                "error_code": updated.error_code,
            })),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(updated))
}

/// POST /agent/installed-certs/report - full snapshot reconciliation
#[tracing::instrument(skip(state, current_device, req), fields(items = req.items.len()))]
async fn report_installed_certs(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    Json(req): Json<InstalledCertsReport>,
) -> Result<Json<InstalledCertsReportResponse>, ApiError> {
    let device = current_device.0;
    if req.device_id != device.id {
        return Err(ApiError::Forbidden(
            "report device does not match credentials".to_string(),
        ));
    }

    let thumbprints: Vec<String> = req.items.iter().map(|i| i.thumbprint.clone()).collect();

    let mut tx = state.db_pool.begin().await?;
    for item in &req.items {
        installed_certs::upsert_reported(&mut *tx, device.org_id, device.id, item).await?;
    }
    let removed =
        installed_certs::mark_absent_removed(&mut *tx, device.org_id, device.id, &thumbprints)
            .await?;
    tx.commit().await?;

    Ok(Json(InstalledCertsReportResponse {
        reported: req.items.len(),
        removed,
    }))
}

/// POST /agent/cleanup - audit-only report of local auto-removals
async fn cleanup_event(
    State(state): State<AppState>,
    current_device: CurrentDevice,
    body: Option<Json<CleanupEvent>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let device = current_device.0;
    let event = body.map(|Json(b)| b).unwrap_or_default();

    audit::log(
        &state.db_pool,
        AuditEvent::new(device.org_id, AuditAction::CertRemoved18h, "device")
            .entity(device.id)
            .device(device.id)
            .meta(json!({
                "removed_count": event.removed_count,
                "thumbprints": event.thumbprints,
            })),
    )
    .await?;

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_progress_job(device_id: Uuid, token_hash: &str) -> InstallJob {
        let now = Utc::now();
        InstallJob {
            id: Uuid::new_v4(),
            org_id: 1,
            cert_id: Uuid::new_v4(),
            device_id,
            requested_by_user_id: Uuid::new_v4(),
            status: "IN_PROGRESS".to_string(),
            approved_by_user_id: None,
            approved_at: None,
            claimed_by_device_id: Some(device_id),
            claimed_at: Some(now),
            started_at: Some(now),
            finished_at: None,
            error_code: None,
            error_message: None,
            thumbprint: None,
            payload_token_hash: Some(token_hash.to_string()),
            payload_token_expires_at: Some(now + Duration::seconds(120)),
            payload_token_used_at: None,
            payload_token_device_id: Some(device_id),
            cleanup_mode: "DEFAULT".to_string(),
            keep_until: None,
            keep_reason: None,
            keep_set_by_user_id: None,
            keep_set_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_device(id: Uuid) -> Device {
        let now = Utc::now();
        Device {
            id,
            org_id: 1,
            hostname: "host-01".to_string(),
            domain: None,
            os_version: None,
            agent_version: None,
            is_allowed: true,
            auto_approve: false,
            assigned_user_id: None,
            device_token_hash: None,
            token_created_at: None,
            last_seen_at: None,
            last_heartbeat_at: None,
            allow_keep_until: false,
            allow_exempt: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lease_accepts_valid_token() {
        let device_id = Uuid::new_v4();
        let hash = hash_token("payload-token");
        let job = in_progress_job(device_id, &hash);
        let device = test_device(device_id);

        assert!(lease_check(&job, &device, &hash, Utc::now()).is_ok());
    }

    #[test]
    fn test_lease_denies_wrong_token() {
        let device_id = Uuid::new_v4();
        let job = in_progress_job(device_id, &hash_token("right"));
        let device = test_device(device_id);

        let denial = lease_check(&job, &device, &hash_token("wrong"), Utc::now()).unwrap_err();
        assert_eq!(denial.reason, "token_mismatch");
        assert_eq!(
            denial.error.status_code(),
            axum::http::StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_lease_denies_used_token() {
        let device_id = Uuid::new_v4();
        let hash = hash_token("payload-token");
        let mut job = in_progress_job(device_id, &hash);
        job.payload_token_used_at = Some(Utc::now());
        let device = test_device(device_id);

        let denial = lease_check(&job, &device, &hash, Utc::now()).unwrap_err();
        assert_eq!(denial.reason, "token_used");
        assert_eq!(denial.error.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn test_lease_denies_expired_token() {
        let device_id = Uuid::new_v4();
        let hash = hash_token("payload-token");
        let mut job = in_progress_job(device_id, &hash);
        job.payload_token_expires_at = Some(Utc::now() - Duration::seconds(1));
        let device = test_device(device_id);

        let denial = lease_check(&job, &device, &hash, Utc::now()).unwrap_err();
        assert_eq!(denial.reason, "token_expired");
        assert_eq!(denial.error.status_code(), axum::http::StatusCode::GONE);
    }

    #[test]
    fn test_lease_denies_foreign_device_binding() {
        let device_id = Uuid::new_v4();
        let hash = hash_token("payload-token");
        let mut job = in_progress_job(device_id, &hash);
        job.payload_token_device_id = Some(Uuid::new_v4());
        let device = test_device(device_id);

        let denial = lease_check(&job, &device, &hash, Utc::now()).unwrap_err();
        assert_eq!(denial.reason, "device_mismatch");
    }

    #[test]
    fn test_lease_denies_non_in_progress_job() {
        let device_id = Uuid::new_v4();
        let hash = hash_token("payload-token");
        let mut job = in_progress_job(device_id, &hash);
        job.status = "PENDING".to_string();
        let device = test_device(device_id);

        let denial = lease_check(&job, &device, &hash, Utc::now()).unwrap_err();
        assert_eq!(denial.reason, "job_not_in_progress");
        assert_eq!(denial.error.status_code(), axum::http::StatusCode::CONFLICT);
    }
}
