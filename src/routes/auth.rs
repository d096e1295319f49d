// Authentication and password lifecycle route handlers.

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{
    db::audit::{self, AuditAction, AuditEvent},
    db::auth_tokens,
    db::sessions,
    db::users::{self, User},
    error::ApiError,
    middleware::auth::CurrentUser,
    routes::client_ip,
    security::{
        generate_token, hash_password, hash_token, verify_password,
        AUTH_TOKEN_PURPOSE_RESET_PASSWORD, AUTH_TOKEN_PURPOSE_SET_PASSWORD,
    },
    AppState,
};

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user: User,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordInitRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct TokenInitResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordConfirmRequest {
    pub token: String,
    pub new_password: String,
}

/// Creates authentication routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/password/set/init", post(password_set_init))
        .route("/password/set/confirm", post(password_set_confirm))
        .route("/password/reset/init", post(password_reset_init))
        .route("/password/reset/confirm", post(password_reset_confirm))
}

fn build_refresh_cookie(state: &AppState, token: &str, max_age_secs: i64) -> String {
    let settings = &state.settings;
    let mut cookie = format!("{REFRESH_COOKIE_NAME}={token}; Path=/; Max-Age={max_age_secs}");
    if settings.cookie_httponly {
        cookie.push_str("; HttpOnly");
    }
    if settings.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    match settings.cookie_samesite.to_ascii_lowercase().as_str() {
        "lax" => cookie.push_str("Lax"),
        "none" => cookie.push_str("None"),
        _ => cookie.push_str("Strict"),
    }
    cookie
}

fn refresh_token_from_request(headers: &HeaderMap, body: &Option<RefreshRequest>) -> Option<String> {
    let from_cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').map(str::trim).find_map(|pair| {
                pair.strip_prefix(REFRESH_COOKIE_NAME)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(str::to_string)
            })
        });
    from_cookie.or_else(|| body.as_ref().and_then(|b| b.refresh_token.clone()))
}

/// POST /auth/login
#[tracing::instrument(skip(state, req), fields(email = %req.email))]
async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ip = client_ip(&connect_info);
    let now = Utc::now();

    let Some(mut user) = users::find_by_email(&state.db_pool, &req.email).await? else {
        audit::log(
            &state.db_pool,
            AuditEvent::new(state.settings.default_org_id, AuditAction::LoginFailed, "user")
                .ip(ip)
                .meta(serde_json::json!({"reason": "user_not_found"})),
        )
        .await?;
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    };

    if !user.is_active {
        audit::log(
            &state.db_pool,
            AuditEvent::new(user.org_id, AuditAction::LoginFailed, "user")
                .entity(user.id)
                .user(user.id)
                .ip(ip)
                .meta(serde_json::json!({"reason": "inactive"})),
        )
        .await?;
        return Err(ApiError::Forbidden("inactive user".to_string()));
    }

    if user.locked_until.is_some_and(|until| until > now) {
        audit::log(
            &state.db_pool,
            AuditEvent::new(user.org_id, AuditAction::LoginLocked, "user")
                .entity(user.id)
                .user(user.id)
                .ip(ip),
        )
        .await?;
        return Err(ApiError::RateLimited("too many login attempts".to_string()));
    }

    let password_ok = user
        .password_hash
        .as_deref()
        .map(|hash| verify_password(&req.password, hash))
        .unwrap_or(false);

    if !password_ok {
        user.failed_login_attempts += 1;
        let locked = user.failed_login_attempts >= state.settings.lockout_max_attempts;
        if locked {
            user.locked_until = Some(now + Duration::minutes(state.settings.lockout_minutes));
        }

        let mut tx = state.db_pool.begin().await?;
        users::update_user(&mut *tx, &user).await?;
        audit::log(
            &mut *tx,
            AuditEvent::new(user.org_id, AuditAction::LoginFailed, "user")
                .entity(user.id)
                .user(user.id)
                .ip(ip.clone())
                .meta(serde_json::json!({"reason": "invalid_password"})),
        )
        .await?;
        if locked {
            audit::log(
                &mut *tx,
                AuditEvent::new(user.org_id, AuditAction::LoginLocked, "user")
                    .entity(user.id)
                    .user(user.id)
                    .ip(ip),
            )
            .await?;
        }
        tx.commit().await?;

        if locked {
            return Err(ApiError::RateLimited("too many login attempts".to_string()));
        }
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }

    user.failed_login_attempts = 0;
    user.locked_until = None;

    let access_token = state.jwt.mint_user_token(
        user.id,
        &user.role_global,
        state.settings.access_token_ttl_min,
    )?;
    let refresh_token = generate_token();
    let refresh_expires_at = now + Duration::days(state.settings.refresh_ttl_days);

    let mut tx = state.db_pool.begin().await?;
    let user = users::update_user(&mut *tx, &user).await?;
    sessions::create_session(
        &mut *tx,
        user.id,
        &hash_token(&refresh_token),
        ip.as_deref(),
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
        refresh_expires_at,
    )
    .await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(user.org_id, AuditAction::LoginSuccess, "user")
            .entity(user.id)
            .user(user.id)
            .ip(ip),
    )
    .await?;
    tx.commit().await?;

    let max_age = state.settings.refresh_ttl_days * 24 * 60 * 60;
    let cookie = build_refresh_cookie(&state, &refresh_token, max_age);
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(LoginResponse { access_token, user }),
    ))
}

/// POST /auth/refresh
async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let body = body.map(|Json(b)| b);
    let token = refresh_token_from_request(&headers, &body)
        .ok_or_else(|| ApiError::Unauthorized("missing refresh token".to_string()))?;

    let session = sessions::find_live_session(&state.db_pool, &hash_token(&token))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid refresh token".to_string()))?;

    let user = users::get_user(&state.db_pool, session.user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid refresh token".to_string()))?;

    let access_token = state.jwt.mint_user_token(
        user.id,
        &user.role_global,
        state.settings.access_token_ttl_min,
    )?;
    Ok(Json(RefreshResponse { access_token }))
}

/// POST /auth/logout
async fn logout(
    State(state): State<AppState>,
    current_user: CurrentUser,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = current_user.0;
    let body = body.map(|Json(b)| b);

    let mut tx = state.db_pool.begin().await?;
    if let Some(token) = refresh_token_from_request(&headers, &body) {
        sessions::revoke_session(&mut *tx, user.id, &hash_token(&token)).await?;
    }
    audit::log(
        &mut *tx,
        AuditEvent::new(user.org_id, AuditAction::Logout, "user")
            .entity(user.id)
            .user(user.id)
            .ip(client_ip(&connect_info)),
    )
    .await?;
    tx.commit().await?;

    let cookie = format!("{REFRESH_COOKIE_NAME}=; Path=/; Max-Age=0");
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(MessageResponse {
            message: "logout ok".to_string(),
        }),
    ))
}

/// GET /auth/me
async fn me(current_user: CurrentUser) -> Json<User> {
    Json(current_user.0)
}

/// POST /auth/password/set/init - issue a set-password token for a user
async fn password_set_init(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(req): Json<PasswordInitRequest>,
) -> Result<Json<TokenInitResponse>, ApiError> {
    current_user.require_admin_or_dev()?;
    let org_id = current_user.0.org_id;

    let user = users::find_by_email_in_org(&state.db_pool, org_id, &req.email)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

    let raw_token = generate_token();
    let expires_at =
        Utc::now() + Duration::minutes(state.settings.set_password_token_ttl_min);
    auth_tokens::create_token(
        &state.db_pool,
        user.id,
        &hash_token(&raw_token),
        AUTH_TOKEN_PURPOSE_SET_PASSWORD,
        expires_at,
    )
    .await?;

    if let Some(email) = &user.email {
        state.mailer.send_password_token(email, "set", &raw_token).await;
    }

    // The raw token is surfaced only in development.
    let token = state.settings.is_dev().then_some(raw_token);
    Ok(Json(TokenInitResponse {
        ok: true,
        expires_at: token.as_ref().map(|_| expires_at),
        token,
    }))
}

async fn confirm_password_token(
    state: &AppState,
    purpose: &str,
    success_action: AuditAction,
    req: PasswordConfirmRequest,
) -> Result<Json<MessageResponse>, ApiError> {
    let token = auth_tokens::find_live_token(&state.db_pool, &hash_token(&req.token), purpose)
        .await?
        .ok_or_else(|| ApiError::Validation("invalid token".to_string()))?;

    let mut user = users::get_user(&state.db_pool, token.user_id)
        .await?
        .ok_or_else(|| ApiError::Validation("invalid token".to_string()))?;

    user.password_hash = Some(hash_password(&req.new_password, state.settings.bcrypt_cost)?);
    if user.password_set_at.is_none() {
        user.password_set_at = Some(Utc::now());
    }
    user.failed_login_attempts = 0;
    user.locked_until = None;

    let mut tx = state.db_pool.begin().await?;
    users::update_user(&mut *tx, &user).await?;
    auth_tokens::consume_token(&mut tx, &token).await?;
    audit::log(
        &mut *tx,
        AuditEvent::new(user.org_id, success_action, "user")
            .entity(user.id)
            .user(user.id),
    )
    .await?;
    tx.commit().await?;

    let message = match success_action {
        AuditAction::PasswordReset => "password reset",
        _ => "password set",
    };
    Ok(Json(MessageResponse {
        message: message.to_string(),
    }))
}

/// POST /auth/password/set/confirm
async fn password_set_confirm(
    State(state): State<AppState>,
    Json(req): Json<PasswordConfirmRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    confirm_password_token(
        &state,
        AUTH_TOKEN_PURPOSE_SET_PASSWORD,
        AuditAction::PasswordSet,
        req,
    )
    .await
}

/// POST /auth/password/reset/init - always 200, enumeration-safe
async fn password_reset_init(
    State(state): State<AppState>,
    Json(req): Json<PasswordInitRequest>,
) -> Result<(StatusCode, Json<TokenInitResponse>), ApiError> {
    let raw_token = generate_token();
    let expires_at =
        Utc::now() + Duration::minutes(state.settings.reset_password_token_ttl_min);

    let mut issued = false;
    if let Some(user) = users::find_by_email(&state.db_pool, &req.email).await? {
        let mut tx = state.db_pool.begin().await?;
        auth_tokens::create_token(
            &mut *tx,
            user.id,
            &hash_token(&raw_token),
            AUTH_TOKEN_PURPOSE_RESET_PASSWORD,
            expires_at,
        )
        .await?;
        audit::log(
            &mut *tx,
            AuditEvent::new(user.org_id, AuditAction::PasswordResetRequested, "user")
                .entity(user.id),
        )
        .await?;
        tx.commit().await?;
        issued = true;

        if let Some(email) = &user.email {
            state.mailer.send_password_token(email, "reset", &raw_token).await;
        }
    }

    let token = (state.settings.is_dev() && issued).then_some(raw_token);
    Ok((
        StatusCode::OK,
        Json(TokenInitResponse {
            ok: true,
            expires_at: token.as_ref().map(|_| expires_at),
            token,
        }),
    ))
}

/// POST /auth/password/reset/confirm
async fn password_reset_confirm(
    State(state): State<AppState>,
    Json(req): Json<PasswordConfirmRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    confirm_password_token(
        &state,
        AUTH_TOKEN_PURPOSE_RESET_PASSWORD,
        AuditAction::PasswordReset,
        req,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_prefers_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "session=abc; refresh_token=from-cookie".parse().unwrap(),
        );
        let body = Some(RefreshRequest {
            refresh_token: Some("from-body".to_string()),
        });
        assert_eq!(
            refresh_token_from_request(&headers, &body).as_deref(),
            Some("from-cookie")
        );
    }

    #[test]
    fn test_refresh_token_falls_back_to_body() {
        let headers = HeaderMap::new();
        let body = Some(RefreshRequest {
            refresh_token: Some("from-body".to_string()),
        });
        assert_eq!(
            refresh_token_from_request(&headers, &body).as_deref(),
            Some("from-body")
        );
        assert_eq!(refresh_token_from_request(&headers, &None), None);
    }
}
