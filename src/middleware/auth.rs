// Bearer-token authentication extractors.
//
// The actor (operator user or device agent) is materialized once at the auth
// boundary and passed to handlers as a typed value. User tokens are rejected
// at agent endpoints and vice versa.

use crate::db::devices::{self, Device};
use crate::db::users::{self, Role, User};
use crate::error::ApiError;
use crate::AppState;
use axum::http::request::Parts;

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    let auth_header = parts
        .headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid Authorization header format".to_string()))
}

/// Authenticated operator, extracted from a user access token.
pub struct CurrentUser(pub User);

impl CurrentUser {
    /// Role guard; 403 when the actor's role is not in `allowed`.
    pub fn require_role(&self, allowed: &[Role]) -> Result<Role, ApiError> {
        let role = self.0.role()?;
        if allowed.contains(&role) {
            Ok(role)
        } else {
            Err(ApiError::Forbidden("forbidden".to_string()))
        }
    }

    pub fn require_admin_or_dev(&self) -> Result<Role, ApiError> {
        self.require_role(&[Role::Dev, Role::Admin])
    }

    pub fn require_dev(&self) -> Result<Role, ApiError> {
        self.require_role(&[Role::Dev])
    }
}

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.jwt.validate(token)?;

        if claims.is_device() {
            // A device token must fail any endpoint requiring a user role.
            return Err(ApiError::Forbidden(
                "device token not accepted here".to_string(),
            ));
        }

        let user_id = claims.subject_id()?;
        let user = users::get_user(&state.db_pool, user_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("invalid user".to_string()))?;

        if !user.is_active {
            return Err(ApiError::Forbidden("inactive user".to_string()));
        }
        // Reject tokens whose persisted role is no longer recognized.
        user.role()?;

        Ok(CurrentUser(user))
    }
}

/// Authenticated device agent, extracted from a device access token.
pub struct CurrentDevice(pub Device);

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for CurrentDevice {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.jwt.validate(token)?;

        if !claims.is_device() {
            return Err(ApiError::Forbidden(
                "user token not accepted at agent endpoints".to_string(),
            ));
        }

        let device_id = claims.subject_id()?;
        let device = devices::get_device(&state.db_pool, device_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("invalid device".to_string()))?;

        if !device.is_allowed {
            return Err(ApiError::Forbidden("device blocked".to_string()));
        }

        Ok(CurrentDevice(device))
    }
}
