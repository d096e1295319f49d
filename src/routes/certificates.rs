// Certificate catalog and install-request route handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::audit::{self, AuditAction, AuditEvent},
    db::certificates::{self, Certificate},
    db::devices,
    db::jobs::{self, CleanupMode, JobStatus},
    db::users::Role,
    error::ApiError,
    middleware::auth::CurrentUser,
    retention::{self, DeviceRetentionFlags},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateCertificateRequest {
    pub name: String,
    pub source_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub device_id: Uuid,
    #[serde(default = "default_cleanup_mode")]
    pub cleanup_mode: CleanupMode,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
}

fn default_cleanup_mode() -> CleanupMode {
    CleanupMode::Default
}

/// Creates certificate routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_certificate).get(list_certificates))
        .route("/:certificate_id/install", post(create_install_job))
}

/// POST /certificados - manual catalog registration
#[tracing::instrument(skip(state, current_user, req), fields(name = %req.name))]
async fn create_certificate(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(req): Json<CreateCertificateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let mut tx = state.db_pool.begin().await?;
    let certificate =
        certificates::create_certificate(&mut *tx, org_id, &req.name, req.source_path.as_deref())
            .await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::CertCreated, "certificate")
            .entity(certificate.id)
            .user(current_user.0.id)
            .meta(json!({"name": certificate.name})),
    )
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(certificate)))
}

/// GET /certificados
async fn list_certificates(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<Certificate>>, ApiError> {
    let certs = certificates::list_certificates(&state.db_pool, current_user.0.org_id).await?;
    Ok(Json(certs))
}

/// POST /certificados/{id}/install - request an install job
#[tracing::instrument(skip(state, current_user, req), fields(device_id = %req.device_id))]
async fn create_install_job(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(certificate_id): Path<Uuid>,
    Json(req): Json<InstallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = &current_user.0;
    let org_id = user.org_id;
    let role = user.role()?;

    let certificate = certificates::get_certificate(&state.db_pool, org_id, certificate_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("certificate not found".to_string()))?;

    let device = devices::get_device_in_org(&state.db_pool, org_id, req.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    // A blocked device never gets a new job assigned.
    if !device.is_allowed {
        return Err(ApiError::Forbidden("device blocked".to_string()));
    }

    if role == Role::View
        && !devices::user_can_access_device(&state.db_pool, user.id, device.id).await?
    {
        return Err(ApiError::Forbidden(
            "device not assigned to requester".to_string(),
        ));
    }

    let retention = retention::validate(
        role,
        req.cleanup_mode,
        req.keep_until,
        req.keep_reason,
        DeviceRetentionFlags {
            allow_keep_until: device.allow_keep_until,
            allow_exempt: device.allow_exempt,
        },
        Utc::now(),
        state.settings.retention_keep_until_max_hours,
    )?;

    // Auto-approval: elevated roles, per-user flag, or per-device flag.
    let approval_via = if role.is_admin_or_dev() {
        Some("role")
    } else if user.auto_approve_install_jobs {
        Some("flag")
    } else if device.auto_approve {
        Some("device")
    } else {
        None
    };
    let initial_status = if approval_via.is_some() {
        JobStatus::Pending
    } else {
        JobStatus::Requested
    };

    let retention_stamped = retention.cleanup_mode != CleanupMode::Default;

    let mut tx = state.db_pool.begin().await?;
    let job = jobs::create_job(
        &mut *tx,
        jobs::CreateJobParams {
            org_id,
            cert_id: certificate.id,
            device_id: device.id,
            requested_by_user_id: user.id,
            status: initial_status,
            approved_by_user_id: approval_via.map(|_| user.id),
            cleanup_mode: retention.cleanup_mode,
            keep_until: retention.keep_until,
            keep_reason: retention.keep_reason.clone(),
            keep_set_by_user_id: retention_stamped.then_some(user.id),
        },
    )
    .await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::InstallRequested, "cert_install_job")
            .entity(job.id)
            .user(user.id)
            .meta(json!({
                "cert_id": certificate.id.to_string(),
                "device_id": device.id.to_string(),
                "initial_status": initial_status,
                "requested_by_user_id": user.id.to_string(),
            })),
    )
    .await?;
    if let Some(via) = approval_via {
        audit::log(
            &mut *tx,
            AuditEvent::new(org_id, AuditAction::InstallApproved, "cert_install_job")
                .entity(job.id)
                .user(user.id)
                .meta(json!({"job_id": job.id.to_string(), "via": via})),
        )
        .await?;
    }
    if retention_stamped {
        audit::log(
            &mut *tx,
            AuditEvent::new(org_id, AuditAction::RetentionSet, "cert_install_job")
                .entity(job.id)
                .user(user.id)
                .meta(json!({
                    "cleanup_mode": retention.cleanup_mode,
                    "keep_until": retention.keep_until,
                    "keep_reason": retention.keep_reason,
                })),
        )
        .await?;
    }
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(job)))
}
