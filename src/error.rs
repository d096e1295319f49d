// Error types for the CertHub control plane API.
// Implements the unified error model shared by operator and agent surfaces.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
}

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Precondition required: {0}")]
    PreconditionRequired(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Dependency unavailable: {0}")]
    Dependency(String),
}

impl ApiError {
    /// Returns the stable error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ERR_VALIDATION",
            ApiError::Unauthorized(_) => "ERR_AUTH",
            ApiError::Forbidden(_) => "ERR_AUTHZ",
            ApiError::NotFound(_) => "ERR_NOT_FOUND",
            ApiError::Conflict(_) => "ERR_CONFLICT",
            ApiError::Gone(_) => "ERR_GONE",
            ApiError::Unprocessable(_) => "ERR_UNPROCESSABLE",
            ApiError::PreconditionRequired(_) => "ERR_PRECONDITION",
            ApiError::RateLimited(_) => "ERR_RATE_LIMITED",
            ApiError::Internal(_) => "ERR_INTERNAL",
            ApiError::Dependency(_) => "ERR_DEPENDENCY",
        }
    }

    /// Maps error to the appropriate HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PreconditionRequired(_) => StatusCode::PRECONDITION_REQUIRED,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_response = ErrorResponse {
            error_code: self.error_code().to_string(),
            message: self.to_string(),
        };

        match &self {
            ApiError::Internal(_) | ApiError::Dependency(_) => {
                tracing::error!(error = ?self, "API error occurred");
            }
            _ => {
                tracing::warn!(error = ?self, "API error occurred");
            }
        }

        (self.status_code(), Json(error_response)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("row not found".to_string()),
            other => ApiError::Dependency(format!("Database error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::Validation("test".into()).error_code(), "ERR_VALIDATION");
        assert_eq!(ApiError::Unauthorized("test".into()).error_code(), "ERR_AUTH");
        assert_eq!(ApiError::Forbidden("test".into()).error_code(), "ERR_AUTHZ");
        assert_eq!(ApiError::NotFound("test".into()).error_code(), "ERR_NOT_FOUND");
        assert_eq!(ApiError::Conflict("test".into()).error_code(), "ERR_CONFLICT");
        assert_eq!(ApiError::Gone("test".into()).error_code(), "ERR_GONE");
        assert_eq!(ApiError::RateLimited("test".into()).error_code(), "ERR_RATE_LIMITED");
        assert_eq!(ApiError::Internal("test".into()).error_code(), "ERR_INTERNAL");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Validation("t".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized("t".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("t".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("t".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("t".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Gone("t".into()).status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::PreconditionRequired("t".into()).status_code(),
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(
            ApiError::RateLimited("t".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Unprocessable("t".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_error_response_format() {
        let err = ApiError::Conflict("job not claimable".to_string());
        let response = ErrorResponse {
            error_code: err.error_code().to_string(),
            message: err.to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ERR_CONFLICT"));
        assert!(json.contains("job not claimable"));
    }
}
