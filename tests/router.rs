// Router-level tests: health, fallback, and the auth boundary.
//
// The pool is created lazily, so these exercise the HTTP surface without a
// running database; rejected requests never reach a query.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use certhub_control_plane::{
    config::Settings, create_router, mailer::Mailer, queue::Queue, rate_limit::RateLimiter,
    security::JwtCodec, AppState,
};
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn test_state() -> AppState {
    let settings = Arc::new(Settings::default());
    let db_pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost/certhub-test")
        .expect("lazy pool");
    AppState {
        jwt: JwtCodec::new(&settings.jwt_secret),
        settings,
        db_pool,
        rate_limiter: RateLimiter::disconnected(),
        queue: Queue::disconnected("certs-test"),
        mailer: Mailer::disabled(),
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = create_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = create_router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn agent_jobs_require_bearer_token() {
    let app = create_router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/agent/jobs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let app = create_router(test_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/install-jobs/mine")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn user_token_rejected_at_agent_endpoint() {
    let state = test_state();
    let token = state
        .jwt
        .mint_user_token(Uuid::new_v4(), "ADMIN", 30)
        .unwrap();
    let app = create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/agent/jobs")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn device_token_rejected_at_operator_endpoint() {
    let state = test_state();
    let token = state.jwt.mint_device_token(Uuid::new_v4(), 10).unwrap();
    let app = create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/install-jobs/mine")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn expired_bearer_token_is_unauthorized() {
    let state = test_state();
    let token = state
        .jwt
        .mint_user_token(Uuid::new_v4(), "VIEW", -5)
        .unwrap();
    let app = create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/install-jobs/mine")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error_code"], "ERR_AUTH");
    assert!(json["message"].as_str().unwrap().contains("TOKEN_EXPIRED"));
}
