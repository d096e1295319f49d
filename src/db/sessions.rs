// Refresh-token session database operations

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Refresh session row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub refresh_token_hash: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub async fn create_session<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    refresh_token_hash: &str,
    ip: Option<&str>,
    user_agent: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<UserSession, ApiError> {
    let session = sqlx::query_as::<_, UserSession>(
        "INSERT INTO user_sessions (id, user_id, refresh_token_hash, ip, user_agent, expires_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, user_id, refresh_token_hash, ip, user_agent, expires_at, revoked_at, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(refresh_token_hash)
    .bind(ip)
    .bind(user_agent)
    .bind(expires_at)
    .fetch_one(executor)
    .await?;
    Ok(session)
}

/// Finds a live (unrevoked, unexpired) session by refresh-token hash.
pub async fn find_live_session(
    pool: &PgPool,
    refresh_token_hash: &str,
) -> Result<Option<UserSession>, ApiError> {
    let session = sqlx::query_as::<_, UserSession>(
        "SELECT id, user_id, refresh_token_hash, ip, user_agent, expires_at, revoked_at, created_at
         FROM user_sessions
         WHERE refresh_token_hash = $1 AND revoked_at IS NULL AND expires_at >= NOW()",
    )
    .bind(refresh_token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(session)
}

/// Revokes the session matching a refresh token for a specific user.
pub async fn revoke_session<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    refresh_token_hash: &str,
) -> Result<bool, ApiError> {
    let result = sqlx::query(
        "UPDATE user_sessions SET revoked_at = NOW()
         WHERE user_id = $1 AND refresh_token_hash = $2 AND revoked_at IS NULL",
    )
    .bind(user_id)
    .bind(refresh_token_hash)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
