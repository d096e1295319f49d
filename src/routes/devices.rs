// Operator-facing device views: owned devices and installed-cert inventory.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::devices::{self, Device},
    db::installed_certs::{self, DeviceInstalledCert},
    db::users::Role,
    error::ApiError,
    middleware::auth::CurrentUser,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct InstalledCertsQuery {
    pub scope: Option<String>,
    #[serde(default)]
    pub include_removed: bool,
}

/// Creates operator device routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/mine", get(list_my_devices))
        .route("/:device_id/installed-certs", get(list_installed_certs))
}

/// GET /devices/mine - assigned plus allow-listed devices
async fn list_my_devices(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Result<Json<Vec<Device>>, ApiError> {
    let devices = devices::list_devices_for_user(
        &state.db_pool,
        current_user.0.org_id,
        current_user.0.id,
    )
    .await?;
    Ok(Json(devices))
}

/// GET /devices/{id}/installed-certs?scope=all|agent&include_removed=
async fn list_installed_certs(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(device_id): Path<Uuid>,
    Query(query): Query<InstalledCertsQuery>,
) -> Result<Json<Vec<DeviceInstalledCert>>, ApiError> {
    let org_id = current_user.0.org_id;

    let device = devices::get_device_in_org(&state.db_pool, org_id, device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    if current_user.0.role()? == Role::View
        && !devices::user_can_access_device(&state.db_pool, current_user.0.id, device.id).await?
    {
        return Err(ApiError::Forbidden(
            "device not assigned to requester".to_string(),
        ));
    }

    let agent_only = match query.scope.as_deref() {
        None | Some("all") => false,
        Some("agent") => true,
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "unknown scope '{other}', expected all|agent"
            )))
        }
    };

    let certs = installed_certs::list_for_device(
        &state.db_pool,
        org_id,
        device.id,
        agent_only,
        query.include_removed,
    )
    .await?;
    Ok(Json(certs))
}
