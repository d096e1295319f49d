// Administrative route handlers: users, devices, allow-list links, the
// job reaper, and filesystem ingest.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::audit::{self, AuditAction, AuditEvent},
    db::auth_tokens,
    db::devices::{self, Device, UserDeviceLink},
    db::jobs,
    db::users::{self, Role, User},
    error::ApiError,
    ingest::{self, IngestOptions, IngestReport},
    middleware::auth::CurrentUser,
    security::{generate_token, hash_token, AUTH_TOKEN_PURPOSE_SET_PASSWORD},
    AppState,
};

const REAP_DEFAULT_THRESHOLD_MINUTES: i64 = 60;
const REAP_MIN_THRESHOLD_MINUTES: i64 = 1;
const REAP_MAX_THRESHOLD_MINUTES: i64 = 10_080;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub ad_username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role_global: Role,
    #[serde(default)]
    pub auto_approve_install_jobs: bool,
}

fn default_role() -> Role {
    Role::View
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    #[serde(flatten)]
    pub user: User,
    pub setup_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub ad_username: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role_global: Option<Role>,
    pub is_active: Option<bool>,
    pub auto_approve_install_jobs: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub hostname: String,
    pub domain: Option<String>,
    pub os_version: Option<String>,
    pub assigned_user_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateDeviceRequest {
    pub is_allowed: Option<bool>,
    pub auto_approve: Option<bool>,
    pub allow_keep_until: Option<bool>,
    pub allow_exempt: Option<bool>,
    // Double Option: absent = untouched, null = unassign, value = reassign.
    #[serde(default, deserialize_with = "present_field")]
    pub assigned_user_id: Option<Option<Uuid>>,
}

/// Wraps a present field (including an explicit null) in `Some`, so absent
/// and null can be told apart.
fn present_field<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Serialize)]
pub struct RotateTokenResponse {
    pub device_id: Uuid,
    pub device_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkUserDeviceRequest {
    pub user_id: Uuid,
    pub device_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ReapQuery {
    pub threshold_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReapResponse {
    pub reaped: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub prune_missing: bool,
    #[serde(default)]
    pub dedupe: bool,
}

/// Creates admin routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/:user_id", patch(update_user))
        .route("/devices", post(create_device).get(list_devices))
        .route("/devices/:device_id", patch(update_device))
        .route("/devices/:device_id/rotate-token", post(rotate_device_token))
        .route("/user-devices", post(link_user_device).get(list_user_devices))
        .route("/jobs/reap", post(reap_jobs))
        .route("/certificates/ingest-from-fs", post(ingest_from_fs))
}

async fn resolve_assigned_user(
    state: &AppState,
    org_id: i32,
    assigned_user_id: Option<Uuid>,
) -> Result<Option<Uuid>, ApiError> {
    let Some(user_id) = assigned_user_id else {
        return Ok(None);
    };
    let user = users::get_user(&state.db_pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("assigned user not found".to_string()))?;
    if user.org_id != org_id {
        return Err(ApiError::Forbidden("assigned user not in org".to_string()));
    }
    Ok(Some(user.id))
}

/// POST /admin/users - create an operator and issue a set-password token
#[tracing::instrument(skip(state, current_user, req), fields(ad_username = %req.ad_username))]
async fn create_user(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current_user.require_dev()?;
    let org_id = current_user.0.org_id;

    let setup_token = generate_token();
    let expires_at = Utc::now() + Duration::minutes(state.settings.set_password_token_ttl_min);

    let mut tx = state.db_pool.begin().await?;
    let user = users::create_user(
        &mut *tx,
        users::CreateUserParams {
            org_id,
            ad_username: req.ad_username,
            email: req.email,
            display_name: req.display_name,
            role_global: req.role_global,
            auto_approve_install_jobs: req.auto_approve_install_jobs,
        },
    )
    .await?;
    auth_tokens::create_token(
        &mut *tx,
        user.id,
        &hash_token(&setup_token),
        AUTH_TOKEN_PURPOSE_SET_PASSWORD,
        expires_at,
    )
    .await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::UserCreated, "user")
            .entity(user.id)
            .user(current_user.0.id)
            .meta(json!({"ad_username": user.ad_username})),
    )
    .await?;
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse { user, setup_token }),
    ))
}

/// GET /admin/users
async fn list_users(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<User>>, ApiError> {
    current_user.require_dev()?;
    let users = users::list_users(&state.db_pool, current_user.0.org_id).await?;
    Ok(Json(users))
}

/// PATCH /admin/users/{id} - role and active changes are DEV-only
async fn update_user(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    if req.role_global.is_some() || req.is_active.is_some() {
        current_user.require_dev()?;
    }

    let mut user = users::get_user_in_org(&state.db_pool, org_id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

    let mut changes = serde_json::Map::new();
    let mut apply = |field: &str, old: serde_json::Value, new: serde_json::Value| {
        if old != new {
            changes.insert(field.to_string(), json!([old, new]));
            true
        } else {
            false
        }
    };

    if let Some(value) = req.ad_username {
        if apply("ad_username", json!(user.ad_username), json!(value)) {
            user.ad_username = value;
        }
    }
    if let Some(value) = req.email {
        if apply("email", json!(user.email), json!(value)) {
            user.email = Some(value);
        }
    }
    if let Some(value) = req.display_name {
        if apply("display_name", json!(user.display_name), json!(value)) {
            user.display_name = Some(value);
        }
    }
    if let Some(value) = req.role_global {
        if apply("role_global", json!(user.role_global), json!(value)) {
            user.role_global = value.as_str().to_string();
        }
    }
    if let Some(value) = req.is_active {
        if apply("is_active", json!(user.is_active), json!(value)) {
            user.is_active = value;
        }
    }
    if let Some(value) = req.auto_approve_install_jobs {
        if apply(
            "auto_approve_install_jobs",
            json!(user.auto_approve_install_jobs),
            json!(value),
        ) {
            user.auto_approve_install_jobs = value;
        }
    }

    if changes.is_empty() {
        return Ok(Json(user));
    }

    let mut tx = state.db_pool.begin().await?;
    let user = users::update_user(&mut *tx, &user).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::UserUpdated, "user")
            .entity(user.id)
            .user(current_user.0.id)
            .meta(json!({"changes": changes})),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(user))
}

/// POST /admin/devices
#[tracing::instrument(skip(state, current_user, req), fields(hostname = %req.hostname))]
async fn create_device(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(req): Json<CreateDeviceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let assigned_user_id = resolve_assigned_user(&state, org_id, req.assigned_user_id).await?;

    let mut tx = state.db_pool.begin().await?;
    let device = devices::create_device(
        &mut *tx,
        devices::CreateDeviceParams {
            org_id,
            hostname: req.hostname,
            domain: req.domain,
            os_version: req.os_version,
            assigned_user_id,
        },
    )
    .await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::DeviceCreated, "device")
            .entity(device.id)
            .user(current_user.0.id)
            .meta(json!({"hostname": device.hostname})),
    )
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(device)))
}

/// GET /admin/devices - any authenticated operator
async fn list_devices(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<Device>>, ApiError> {
    let devices = devices::list_devices(&state.db_pool, current_user.0.org_id).await?;
    Ok(Json(devices))
}

/// PATCH /admin/devices/{id} - `auto_approve` is DEV-only
async fn update_device(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(device_id): Path<Uuid>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<Json<Device>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    if req.auto_approve.is_some() {
        current_user.require_dev()?;
    }

    let mut device = devices::get_device_in_org(&state.db_pool, org_id, device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    let mut changes = serde_json::Map::new();
    let mut apply = |field: &str, old: serde_json::Value, new: serde_json::Value| {
        if old != new {
            changes.insert(field.to_string(), json!([old, new]));
            true
        } else {
            false
        }
    };

    if let Some(value) = req.is_allowed {
        if apply("is_allowed", json!(device.is_allowed), json!(value)) {
            device.is_allowed = value;
        }
    }
    if let Some(value) = req.auto_approve {
        if apply("auto_approve", json!(device.auto_approve), json!(value)) {
            device.auto_approve = value;
        }
    }
    if let Some(value) = req.allow_keep_until {
        if apply("allow_keep_until", json!(device.allow_keep_until), json!(value)) {
            device.allow_keep_until = value;
        }
    }
    if let Some(value) = req.allow_exempt {
        if apply("allow_exempt", json!(device.allow_exempt), json!(value)) {
            device.allow_exempt = value;
        }
    }
    if let Some(assigned) = req.assigned_user_id {
        let assigned = resolve_assigned_user(&state, org_id, assigned).await?;
        if apply(
            "assigned_user_id",
            json!(device.assigned_user_id),
            json!(assigned),
        ) {
            device.assigned_user_id = assigned;
        }
    }

    if changes.is_empty() {
        return Ok(Json(device));
    }

    let mut tx = state.db_pool.begin().await?;
    let device = devices::update_device(&mut *tx, &device).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::DeviceUpdated, "device")
            .entity(device.id)
            .user(current_user.0.id)
            .meta(json!({"changes": changes})),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(device))
}

/// POST /admin/devices/{id}/rotate-token - returns the plaintext exactly once
async fn rotate_device_token(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(device_id): Path<Uuid>,
) -> Result<Json<RotateTokenResponse>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let device = devices::get_device_in_org(&state.db_pool, org_id, device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    let device_token = generate_token();

    let mut tx = state.db_pool.begin().await?;
    devices::set_device_token_hash(&mut *tx, device.id, &hash_token(&device_token)).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::DeviceTokenRotated, "device")
            .entity(device.id)
            .user(current_user.0.id)
            .meta(json!({"hostname": device.hostname})),
    )
    .await?;
    tx.commit().await?;

    Ok(Json(RotateTokenResponse {
        device_id: device.id,
        device_token,
    }))
}

/// POST /admin/user-devices - allow-list link
async fn link_user_device(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(req): Json<LinkUserDeviceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let user = users::get_user_in_org(&state.db_pool, org_id, req.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    let device = devices::get_device_in_org(&state.db_pool, org_id, req.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    let mut tx = state.db_pool.begin().await?;
    devices::link_user_device(&mut *tx, user.id, device.id).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(org_id, AuditAction::UserDeviceLinked, "user_device")
            .entity(format!("{}:{}", user.id, device.id))
            .user(current_user.0.id),
    )
    .await?;
    tx.commit().await?;

    Ok(StatusCode::CREATED)
}

/// GET /admin/user-devices
async fn list_user_devices(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<UserDeviceLink>>, ApiError> {
    current_user.require_admin_or_dev()?;
    let links = devices::list_user_devices(&state.db_pool, current_user.0.org_id).await?;
    Ok(Json(links))
}

/// POST /admin/jobs/reap - fail IN_PROGRESS jobs stuck past the threshold
#[tracing::instrument(skip(state, current_user))]
async fn reap_jobs(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<ReapQuery>,
) -> Result<Json<ReapResponse>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let threshold = query
        .threshold_minutes
        .unwrap_or(REAP_DEFAULT_THRESHOLD_MINUTES);
    if !(REAP_MIN_THRESHOLD_MINUTES..=REAP_MAX_THRESHOLD_MINUTES).contains(&threshold) {
        return Err(ApiError::Validation(format!(
            "threshold_minutes must be within [{REAP_MIN_THRESHOLD_MINUTES}, {REAP_MAX_THRESHOLD_MINUTES}]"
        )));
    }

    let cutoff = Utc::now() - Duration::minutes(threshold);

    let mut tx = state.db_pool.begin().await?;
    let stuck = jobs::lock_reapable(&mut tx, org_id, cutoff).await?;
    let mut reaped = 0;
    for job in &stuck {
        if jobs::fail_timed_out(&mut tx, job.id).await? {
            audit::log(
                &mut *tx,
                AuditEvent::new(org_id, AuditAction::JobReaped, "cert_install_job")
                    .entity(job.id)
                    .user(current_user.0.id)
                    .meta(json!({
                        "job_id": job.id.to_string(),
                        "device_id": job.device_id.to_string(),
                        "threshold_minutes": threshold,
                    })),
            )
            .await?;
            reaped += 1;
        }
    }
    tx.commit().await?;

    Ok(Json(ReapResponse { reaped }))
}

/// POST /admin/certificates/ingest-from-fs
#[tracing::instrument(skip(state, current_user, req))]
async fn ingest_from_fs(
    State(state): State<AppState>,
    current_user: CurrentUser,
    req: Option<Json<IngestRequest>>,
) -> Result<Json<IngestReport>, ApiError> {
    current_user.require_dev()?;
    let org_id = current_user.0.org_id;
    let req = req.map(|Json(r)| r).unwrap_or_default();

    let options = IngestOptions {
        dry_run: req.dry_run,
        limit: req.limit,
        prune_missing: req.prune_missing,
        dedupe: req.dedupe,
    };
    let report = ingest::ingest_from_fs(
        &state.db_pool,
        org_id,
        &state.settings.certs_root_path,
        &state.settings.openssl_path,
        &options,
    )
    .await?;

    if !options.dry_run {
        audit::log(
            &state.db_pool,
            AuditEvent::new(org_id, AuditAction::CertIngestFromFs, "certificate")
                .user(current_user.0.id)
                .meta(json!({
                    "inserted": report.inserted,
                    "updated": report.updated,
                    "failed": report.failed,
                    "total": report.total,
                    "pruned": report.pruned,
                    "deduped": report.deduped,
                    "limit": options.limit,
                })),
        )
        .await?;
    }

    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reap_threshold_bounds() {
        assert!((REAP_MIN_THRESHOLD_MINUTES..=REAP_MAX_THRESHOLD_MINUTES)
            .contains(&REAP_DEFAULT_THRESHOLD_MINUTES));
        assert!(!(REAP_MIN_THRESHOLD_MINUTES..=REAP_MAX_THRESHOLD_MINUTES).contains(&0));
        assert!(!(REAP_MIN_THRESHOLD_MINUTES..=REAP_MAX_THRESHOLD_MINUTES).contains(&10_081));
    }

    #[test]
    fn test_update_device_request_nested_option() {
        let unassign: UpdateDeviceRequest =
            serde_json::from_str(r#"{"assigned_user_id": null}"#).unwrap();
        assert_eq!(unassign.assigned_user_id, Some(None));

        let untouched: UpdateDeviceRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(untouched.assigned_user_id, None);

        let id = Uuid::new_v4();
        let assigned: UpdateDeviceRequest =
            serde_json::from_str(&format!(r#"{{"assigned_user_id": "{id}"}}"#)).unwrap();
        assert_eq!(assigned.assigned_user_id, Some(Some(id)));
    }
}
