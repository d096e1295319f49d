// CertHub control plane: orchestrates distribution and installation of
// PKCS#12 client certificates onto managed endpoints.

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mailer;
pub mod middleware;
pub mod queue;
pub mod rate_limit;
pub mod retention;
pub mod routes;
pub mod security;
pub mod watcher;
pub mod workers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::config::Settings;
use crate::error::ApiError;
use crate::mailer::Mailer;
use crate::queue::Queue;
use crate::rate_limit::RateLimiter;
use crate::security::JwtCodec;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt: JwtCodec,
    pub db_pool: sqlx::PgPool,
    pub rate_limiter: RateLimiter,
    pub queue: Queue,
    pub mailer: Mailer,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Create application router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let api_routes = Router::new()
        .nest("/api/v1/auth", routes::auth::routes())
        .nest("/api/v1/admin", routes::admin::routes())
        .nest("/api/v1/certificados", routes::certificates::routes())
        .nest("/api/v1/install-jobs", routes::install_jobs::routes())
        .nest("/api/v1/devices", routes::devices::routes())
        .nest("/api/v1/audit", routes::audit::routes())
        .nest("/api/v1/agent", routes::agent::routes())
        .route("/health", get(health_handler))
        .with_state(state);

    Router::new()
        .merge(api_routes)
        .layer(middleware_stack)
        .fallback(not_found_handler)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// 404 handler
async fn not_found_handler() -> impl IntoResponse {
    ApiError::NotFound("Endpoint not found".to_string()).into_response()
}
