// User database operations

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Global operator role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Dev,
    Admin,
    View,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Dev => "DEV",
            Role::Admin => "ADMIN",
            Role::View => "VIEW",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "DEV" => Some(Role::Dev),
            "ADMIN" => Some(Role::Admin),
            "VIEW" => Some(Role::View),
            _ => None,
        }
    }

    /// DEV and ADMIN hold elevated operator privileges.
    pub fn is_admin_or_dev(&self) -> bool {
        matches!(self, Role::Dev | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User record in the database
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub org_id: i32,
    pub ad_username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub role_global: String,
    pub auto_approve_install_jobs: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub password_set_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub failed_login_attempts: i32,
    #[serde(skip_serializing)]
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> Result<Role, ApiError> {
        Role::parse(&self.role_global)
            .ok_or_else(|| ApiError::Forbidden("invalid role".to_string()))
    }
}

/// Create user parameters
#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub org_id: i32,
    pub ad_username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role_global: Role,
    pub auto_approve_install_jobs: bool,
}

const USER_COLUMNS: &str = "id, org_id, ad_username, email, display_name, is_active, \
     role_global, auto_approve_install_jobs, password_hash, password_set_at, \
     failed_login_attempts, locked_until, created_at, updated_at";

/// Creates a new user record
pub async fn create_user<'e>(
    executor: impl PgExecutor<'e>,
    params: CreateUserParams,
) -> Result<User, ApiError> {
    let sql = format!(
        "INSERT INTO users (id, org_id, ad_username, email, display_name, role_global, auto_approve_install_jobs)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {USER_COLUMNS}"
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(Uuid::new_v4())
        .bind(params.org_id)
        .bind(&params.ad_username)
        .bind(&params.email)
        .bind(&params.display_name)
        .bind(params.role_global.as_str())
        .bind(params.auto_approve_install_jobs)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                ApiError::Conflict("username already exists in org".to_string())
            }
            other => other.into(),
        })
}

/// Gets a user by primary key, regardless of org (auth boundary only)
pub async fn get_user(pool: &PgPool, user_id: Uuid) -> Result<Option<User>, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Gets a user by id within an org
pub async fn get_user_in_org(
    pool: &PgPool,
    org_id: i32,
    user_id: Uuid,
) -> Result<Option<User>, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND org_id = $2");
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Finds a user by email, case-insensitive (login path, cross-org)
pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)");
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Finds a user by email within an org
pub async fn find_by_email_in_org(
    pool: &PgPool,
    org_id: i32,
    email: &str,
) -> Result<Option<User>, ApiError> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1) AND org_id = $2"
    );
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(email)
        .bind(org_id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Lists all users of an org, oldest first
pub async fn list_users(pool: &PgPool, org_id: i32) -> Result<Vec<User>, ApiError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE org_id = $1 ORDER BY created_at");
    let users = sqlx::query_as::<_, User>(&sql)
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(users)
}

/// Writes back the mutable columns of a user row
pub async fn update_user<'e>(executor: impl PgExecutor<'e>, user: &User) -> Result<User, ApiError> {
    let sql = format!(
        "UPDATE users
         SET ad_username = $2, email = $3, display_name = $4, is_active = $5,
             role_global = $6, auto_approve_install_jobs = $7, password_hash = $8,
             password_set_at = $9, failed_login_attempts = $10, locked_until = $11,
             updated_at = NOW()
         WHERE id = $1
         RETURNING {USER_COLUMNS}"
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(user.id)
        .bind(&user.ad_username)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.is_active)
        .bind(&user.role_global)
        .bind(user.auto_approve_install_jobs)
        .bind(&user.password_hash)
        .bind(user.password_set_at)
        .bind(user.failed_login_attempts)
        .bind(user.locked_until)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                ApiError::Conflict("username already exists in org".to_string())
            }
            other => other.into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_roundtrip() {
        for role in [Role::Dev, Role::Admin, Role::View] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("ROOT"), None);
    }

    #[test]
    fn test_role_privileges() {
        assert!(Role::Dev.is_admin_or_dev());
        assert!(Role::Admin.is_admin_or_dev());
        assert!(!Role::View.is_admin_or_dev());
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Dev).unwrap(), r#""DEV""#);
        let parsed: Role = serde_json::from_str(r#""VIEW""#).unwrap();
        assert_eq!(parsed, Role::View);
    }
}
