// Install-job listing, approval and export route handlers.

use axum::{
    extract::{Path, State},
    http::header,
    response::{AppendHeaders, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::audit::{self, AuditAction, AuditEvent},
    db::jobs::{self, InstallJob, JobStatus},
    error::ApiError,
    middleware::auth::CurrentUser,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub reason: Option<String>,
}

/// Creates install-job routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/mine", get(list_my_jobs))
        .route("/my-device", get(list_my_device_jobs))
        .route("/export", get(export_jobs))
        .route("/:job_id/approve", post(approve_job))
        .route("/:job_id/deny", post(deny_job))
}

/// GET /install-jobs - whole org, ADMIN/DEV
async fn list_jobs(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<InstallJob>>, ApiError> {
    current_user.require_admin_or_dev()?;
    let jobs = jobs::list_for_org(&state.db_pool, current_user.0.org_id).await?;
    Ok(Json(jobs))
}

/// GET /install-jobs/mine - requester's own jobs
async fn list_my_jobs(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<InstallJob>>, ApiError> {
    let jobs = jobs::list_for_requester(
        &state.db_pool,
        current_user.0.org_id,
        current_user.0.id,
    )
    .await?;
    Ok(Json(jobs))
}

/// GET /install-jobs/my-device - jobs targeting the caller's devices
async fn list_my_device_jobs(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<InstallJob>>, ApiError> {
    let jobs = jobs::list_for_user_devices(
        &state.db_pool,
        current_user.0.org_id,
        current_user.0.id,
    )
    .await?;
    Ok(Json(jobs))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn jobs_to_csv(jobs: &[InstallJob]) -> String {
    let mut out = String::from(
        "id,cert_id,device_id,requested_by_user_id,status,cleanup_mode,keep_until,\
         created_at,started_at,finished_at,error_code,thumbprint\n",
    );
    for job in jobs {
        let row = [
            job.id.to_string(),
            job.cert_id.to_string(),
            job.device_id.to_string(),
            job.requested_by_user_id.to_string(),
            job.status.clone(),
            job.cleanup_mode.clone(),
            job.keep_until.map(|t| t.to_rfc3339()).unwrap_or_default(),
            job.created_at.to_rfc3339(),
            job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            job.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            job.error_code.clone().unwrap_or_default(),
            job.thumbprint.clone().unwrap_or_default(),
        ];
        let line: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

/// GET /install-jobs/export - CSV download; org-wide for ADMIN/DEV, own jobs
/// for VIEW
async fn export_jobs(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let org_id = current_user.0.org_id;
    let jobs = if current_user.0.role()?.is_admin_or_dev() {
        jobs::list_for_org(&state.db_pool, org_id).await?
    } else {
        jobs::list_for_requester(&state.db_pool, org_id, current_user.0.id).await?
    };

    Ok((
        AppendHeaders([
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"install-jobs.csv\"".to_string(),
            ),
        ]),
        jobs_to_csv(&jobs),
    ))
}

async fn resolve_job(
    state: &AppState,
    current_user: &CurrentUser,
    job_id: Uuid,
    next: JobStatus,
    action: AuditAction,
    reason: Option<String>,
) -> Result<Json<InstallJob>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    // Existence check first so absent jobs are 404, not 400.
    jobs::get_job_in_org(&state.db_pool, org_id, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("job not found".to_string()))?;

    let mut tx = state.db_pool.begin().await?;
    let job = jobs::resolve_requested(&mut *tx, org_id, job_id, next, current_user.0.id)
        .await?
        .ok_or_else(|| ApiError::Validation("invalid status".to_string()))?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, action, "cert_install_job")
            .entity(job.id)
            .user(current_user.0.id)
            .meta(json!({"job_id": job.id.to_string(), "reason": reason})),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(job))
}

/// POST /install-jobs/{id}/approve - REQUESTED -> PENDING
async fn approve_job(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ResolveRequest>>,
) -> Result<Json<InstallJob>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    resolve_job(
        &state,
        &current_user,
        job_id,
        JobStatus::Pending,
        AuditAction::InstallApproved,
        reason,
    )
    .await
}

/// POST /install-jobs/{id}/deny - REQUESTED -> CANCELED
async fn deny_job(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ResolveRequest>>,
) -> Result<Json<InstallJob>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    resolve_job(
        &state,
        &current_user,
        job_id,
        JobStatus::Canceled,
        AuditAction::InstallDenied,
        reason,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_escaping() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
