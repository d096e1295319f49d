// Audit browsing route handlers.

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::{
    db::audit::{self, AuditEntry},
    error::ApiError,
    middleware::auth::CurrentUser,
    AppState,
};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub limit: Option<i64>,
}

/// Creates audit routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_audit))
}

/// GET /audit?limit=&action= - org-scoped, newest first
async fn list_audit(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = audit::list(
        &state.db_pool,
        current_user.0.org_id,
        query.action.as_deref(),
        limit,
    )
    .await?;
    Ok(Json(entries))
}
