// Audit log database operations (append-only).
//
// Writes take any executor so a caller inside a transaction gets
// all-or-nothing semantics: if the state change rolls back, so does its
// audit row.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Stable audit action identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    UserCreated,
    UserUpdated,
    DeviceCreated,
    DeviceUpdated,
    DeviceTokenRotated,
    UserDeviceLinked,
    CertCreated,
    CertIngestFromFs,
    InstallRequested,
    InstallApproved,
    InstallDenied,
    InstallClaimed,
    InstallDone,
    InstallFailed,
    JobReaped,
    ResultDuplicate,
    ResultDenied,
    RetentionSet,
    PayloadIssued,
    PayloadDenied,
    PayloadRateLimited,
    CertRemoved18h,
    LoginSuccess,
    LoginFailed,
    LoginLocked,
    Logout,
    PasswordSet,
    PasswordReset,
    PasswordResetRequested,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserCreated => "USER_CREATED",
            AuditAction::UserUpdated => "USER_UPDATED",
            AuditAction::DeviceCreated => "DEVICE_CREATED",
            AuditAction::DeviceUpdated => "DEVICE_UPDATED",
            AuditAction::DeviceTokenRotated => "DEVICE_TOKEN_ROTATED",
            AuditAction::UserDeviceLinked => "USER_DEVICE_LINKED",
            AuditAction::CertCreated => "CERT_CREATED",
            AuditAction::CertIngestFromFs => "CERT_INGEST_FROM_FS",
            AuditAction::InstallRequested => "INSTALL_REQUESTED",
            AuditAction::InstallApproved => "INSTALL_APPROVED",
            AuditAction::InstallDenied => "INSTALL_DENIED",
            AuditAction::InstallClaimed => "INSTALL_CLAIMED",
            AuditAction::InstallDone => "INSTALL_DONE",
            AuditAction::InstallFailed => "INSTALL_FAILED",
            AuditAction::JobReaped => "JOB_REAPED",
            AuditAction::ResultDuplicate => "RESULT_DUPLICATE",
            AuditAction::ResultDenied => "RESULT_DENIED",
            AuditAction::RetentionSet => "RETENTION_SET",
            AuditAction::PayloadIssued => "PAYLOAD_ISSUED",
            AuditAction::PayloadDenied => "PAYLOAD_DENIED",
            AuditAction::PayloadRateLimited => "PAYLOAD_RATE_LIMITED",
            AuditAction::CertRemoved18h => "CERT_REMOVED_18H",
            AuditAction::LoginSuccess => "LOGIN_SUCCESS",
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::LoginLocked => "LOGIN_LOCKED",
            AuditAction::Logout => "LOGOUT",
            AuditAction::PasswordSet => "PASSWORD_SET",
            AuditAction::PasswordReset => "PASSWORD_RESET",
            AuditAction::PasswordResetRequested => "PASSWORD_RESET_REQUESTED",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub org_id: i32,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub actor_user_id: Option<Uuid>,
    pub actor_device_id: Option<Uuid>,
    pub ip: Option<String>,
    pub meta: Option<JsonValue>,
    pub timestamp: DateTime<Utc>,
}

/// Parameters for an audit write
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub org_id: i32,
    pub action: AuditAction,
    pub entity_type: &'static str,
    pub entity_id: Option<String>,
    pub actor_user_id: Option<Uuid>,
    pub actor_device_id: Option<Uuid>,
    pub ip: Option<String>,
    pub meta: Option<JsonValue>,
}

impl AuditEvent {
    pub fn new(org_id: i32, action: AuditAction, entity_type: &'static str) -> Self {
        AuditEvent {
            org_id,
            action,
            entity_type,
            entity_id: None,
            actor_user_id: None,
            actor_device_id: None,
            ip: None,
            meta: None,
        }
    }

    pub fn entity(mut self, entity_id: impl ToString) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    pub fn device(mut self, device_id: Uuid) -> Self {
        self.actor_device_id = Some(device_id);
        self
    }

    pub fn ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    pub fn meta(mut self, meta: JsonValue) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Appends an audit event within the caller's transaction (or autocommit when
/// handed a pool).
pub async fn log<'e>(executor: impl PgExecutor<'e>, event: AuditEvent) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO audit_logs
             (id, org_id, action, entity_type, entity_id, actor_user_id, actor_device_id, ip, meta)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(Uuid::new_v4())
    .bind(event.org_id)
    .bind(event.action.as_str())
    .bind(event.entity_type)
    .bind(&event.entity_id)
    .bind(event.actor_user_id)
    .bind(event.actor_device_id)
    .bind(&event.ip)
    .bind(&event.meta)
    .execute(executor)
    .await?;
    Ok(())
}

/// Browses org audit entries, newest first, optionally filtered by action.
pub async fn list(
    pool: &PgPool,
    org_id: i32,
    action: Option<&str>,
    limit: i64,
) -> Result<Vec<AuditEntry>, ApiError> {
    let entries = if let Some(action) = action {
        sqlx::query_as::<_, AuditEntry>(
            "SELECT id, org_id, action, entity_type, entity_id, actor_user_id,
                    actor_device_id, ip, meta, timestamp
             FROM audit_logs
             WHERE org_id = $1 AND action = $2
             ORDER BY timestamp DESC
             LIMIT $3",
        )
        .bind(org_id)
        .bind(action)
        .bind(limit)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, AuditEntry>(
            "SELECT id, org_id, action, entity_type, entity_id, actor_user_id,
                    actor_device_id, ip, meta, timestamp
             FROM audit_logs
             WHERE org_id = $1
             ORDER BY timestamp DESC
             LIMIT $2",
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(pool)
        .await?
    };
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_identifiers() {
        assert_eq!(AuditAction::InstallClaimed.as_str(), "INSTALL_CLAIMED");
        assert_eq!(AuditAction::PayloadRateLimited.as_str(), "PAYLOAD_RATE_LIMITED");
        assert_eq!(AuditAction::CertRemoved18h.as_str(), "CERT_REMOVED_18H");
        assert_eq!(
            AuditAction::PasswordResetRequested.as_str(),
            "PASSWORD_RESET_REQUESTED"
        );
    }

    #[test]
    fn test_event_builder() {
        let id = Uuid::new_v4();
        let event = AuditEvent::new(1, AuditAction::InstallRequested, "cert_install_job")
            .entity(id)
            .user(id)
            .meta(serde_json::json!({"device_id": id.to_string()}));
        assert_eq!(event.entity_id, Some(id.to_string()));
        assert_eq!(event.actor_user_id, Some(id));
        assert!(event.meta.is_some());
    }
}
