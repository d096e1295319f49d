// Single-purpose auth tokens (set-password, reset-password)

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Opaque token row; only the SHA-256 of the token is stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuthToken {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub purpose: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub async fn create_token<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    token_hash: &str,
    purpose: &str,
    expires_at: DateTime<Utc>,
) -> Result<AuthToken, ApiError> {
    let token = sqlx::query_as::<_, AuthToken>(
        "INSERT INTO auth_tokens (id, user_id, token_hash, purpose, expires_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id, user_id, token_hash, purpose, expires_at, used_at, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(token_hash)
    .bind(purpose)
    .bind(expires_at)
    .fetch_one(executor)
    .await?;
    Ok(token)
}

/// Finds a live (unused, unexpired) token by hash and purpose.
pub async fn find_live_token(
    pool: &PgPool,
    token_hash: &str,
    purpose: &str,
) -> Result<Option<AuthToken>, ApiError> {
    let token = sqlx::query_as::<_, AuthToken>(
        "SELECT id, user_id, token_hash, purpose, expires_at, used_at, created_at
         FROM auth_tokens
         WHERE token_hash = $1 AND purpose = $2 AND used_at IS NULL AND expires_at >= NOW()",
    )
    .bind(token_hash)
    .bind(purpose)
    .fetch_optional(pool)
    .await?;
    Ok(token)
}

/// Consumes a token and invalidates every other outstanding token of the same
/// purpose for the user.
pub async fn consume_token(
    conn: &mut sqlx::PgConnection,
    token: &AuthToken,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE auth_tokens SET used_at = NOW() WHERE id = $1")
        .bind(token.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "UPDATE auth_tokens SET used_at = NOW()
         WHERE user_id = $1 AND purpose = $2 AND used_at IS NULL AND id != $3",
    )
    .bind(token.user_id)
    .bind(&token.purpose)
    .bind(token.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
