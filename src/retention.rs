// Retention policy evaluation for install requests.
//
// Validates the (cleanup_mode, keep_until, keep_reason) triple against the
// requester's role and the target device's retention flags. The accepted
// triple travels with the job and is handed to the agent in the payload.

use crate::db::jobs::CleanupMode;
use crate::db::users::Role;
use crate::error::ApiError;
use chrono::{DateTime, Duration, Utc};

/// Device retention capabilities relevant to validation.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRetentionFlags {
    pub allow_keep_until: bool,
    pub allow_exempt: bool,
}

/// The validated retention triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retention {
    pub cleanup_mode: CleanupMode,
    pub keep_until: Option<DateTime<Utc>>,
    pub keep_reason: Option<String>,
}

/// Validates a requested retention policy.
pub fn validate(
    role: Role,
    cleanup_mode: CleanupMode,
    keep_until: Option<DateTime<Utc>>,
    keep_reason: Option<String>,
    device: DeviceRetentionFlags,
    now: DateTime<Utc>,
    keep_until_max_hours: i64,
) -> Result<Retention, ApiError> {
    match cleanup_mode {
        CleanupMode::Default => Ok(Retention {
            cleanup_mode,
            keep_until: None,
            keep_reason: None,
        }),
        CleanupMode::KeepUntil => {
            let keep_until = keep_until
                .ok_or_else(|| ApiError::Validation("keep_until is required".to_string()))?;
            if keep_until <= now {
                return Err(ApiError::Validation(
                    "keep_until must be in the future".to_string(),
                ));
            }
            if role == Role::View && keep_until > now + Duration::hours(keep_until_max_hours) {
                return Err(ApiError::Validation(format!(
                    "keep_until exceeds the maximum horizon of {keep_until_max_hours}h"
                )));
            }
            if !device.allow_keep_until {
                return Err(ApiError::Forbidden(
                    "device does not allow KEEP_UNTIL retention".to_string(),
                ));
            }
            Ok(Retention {
                cleanup_mode,
                keep_until: Some(keep_until),
                keep_reason,
            })
        }
        CleanupMode::Exempt => {
            if !role.is_admin_or_dev() {
                return Err(ApiError::Forbidden(
                    "EXEMPT retention requires ADMIN or DEV".to_string(),
                ));
            }
            let keep_reason = keep_reason
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| ApiError::Validation("keep_reason is required".to_string()))?;
            if !device.allow_exempt {
                return Err(ApiError::Forbidden(
                    "device does not allow EXEMPT retention".to_string(),
                ));
            }
            Ok(Retention {
                cleanup_mode,
                keep_until: None,
                keep_reason: Some(keep_reason),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    const MAX_HOURS: i64 = 24;

    fn permissive_device() -> DeviceRetentionFlags {
        DeviceRetentionFlags {
            allow_keep_until: true,
            allow_exempt: true,
        }
    }

    #[test]
    fn test_default_forces_nulls() {
        let now = Utc::now();
        let retention = validate(
            Role::View,
            CleanupMode::Default,
            Some(now + Duration::hours(1)),
            Some("ignored".to_string()),
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap();
        assert_eq!(retention.cleanup_mode, CleanupMode::Default);
        assert!(retention.keep_until.is_none());
        assert!(retention.keep_reason.is_none());
    }

    #[test]
    fn test_keep_until_requires_future_timestamp() {
        let now = Utc::now();
        let err = validate(
            Role::Admin,
            CleanupMode::KeepUntil,
            Some(now - Duration::hours(1)),
            None,
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = validate(
            Role::Admin,
            CleanupMode::KeepUntil,
            None,
            None,
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_view_keep_until_bounded_by_horizon() {
        let now = Utc::now();
        let err = validate(
            Role::View,
            CleanupMode::KeepUntil,
            Some(now + Duration::hours(48)),
            None,
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let ok = validate(
            Role::View,
            CleanupMode::KeepUntil,
            Some(now + Duration::hours(2)),
            None,
            permissive_device(),
            now,
            MAX_HOURS,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_admin_keep_until_not_bounded_by_horizon() {
        let now = Utc::now();
        let ok = validate(
            Role::Admin,
            CleanupMode::KeepUntil,
            Some(now + Duration::hours(480)),
            None,
            permissive_device(),
            now,
            MAX_HOURS,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_keep_until_requires_device_flag() {
        let now = Utc::now();
        let err = validate(
            Role::Admin,
            CleanupMode::KeepUntil,
            Some(now + Duration::hours(2)),
            None,
            DeviceRetentionFlags {
                allow_keep_until: false,
                allow_exempt: true,
            },
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_exempt_forbidden_for_view() {
        let now = Utc::now();
        let err = validate(
            Role::View,
            CleanupMode::Exempt,
            None,
            Some("year-end closing".to_string()),
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_exempt_requires_reason_and_device_flag() {
        let now = Utc::now();
        let err = validate(
            Role::Admin,
            CleanupMode::Exempt,
            None,
            Some("   ".to_string()),
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = validate(
            Role::Admin,
            CleanupMode::Exempt,
            None,
            Some("audit hold".to_string()),
            DeviceRetentionFlags {
                allow_keep_until: true,
                allow_exempt: false,
            },
            now,
            MAX_HOURS,
        )
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let retention = validate(
            Role::Dev,
            CleanupMode::Exempt,
            None,
            Some("audit hold".to_string()),
            permissive_device(),
            now,
            MAX_HOURS,
        )
        .unwrap();
        assert_eq!(retention.keep_reason.as_deref(), Some("audit hold"));
        assert!(retention.keep_until.is_none());
    }
}
