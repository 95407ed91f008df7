//! Application error taxonomy.
//!
//! Errors map onto the HTTP envelope at exactly one place (`IntoResponse`);
//! handlers return `Result<_, AppError>` and never build error bodies by hand.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    /// Per-field validation failures, surfaced as `{field: message}`.
    #[error("validation failed")]
    ValidationFields(Vec<(String, String)>),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Idempotency or uniqueness conflict.
    #[error("{0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("credential for {0} requires re-authorization")]
    CredentialExpired(String),

    /// DB constraint the caller cannot resolve.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::ValidationFields(_) => "VALIDATION_ERROR",
            AppError::Authentication(_) => "AUTHENTICATION_ERROR",
            AppError::Authorization(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::CredentialExpired(_) => "CREDENTIAL_EXPIRED",
            AppError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::ValidationFields(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable(_) | AppError::CredentialExpired(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::IntegrityViolation(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(e: crate::db::DbError) -> Self {
        match e {
            crate::db::DbError::NotFound => AppError::NotFound("record".to_string()),
            crate::db::DbError::Conflict(msg) => AppError::Conflict(msg),
            crate::db::DbError::Serialization => {
                AppError::Internal("serialization retry budget exhausted".to_string())
            }
            crate::db::DbError::Transient(msg) => AppError::Internal(msg),
        }
    }
}

impl From<crate::retry::ClassifiedError> for AppError {
    fn from(e: crate::retry::ClassifiedError) -> Self {
        use crate::retry::ErrorCategory;
        match e.category {
            ErrorCategory::RateLimit => AppError::RateLimited {
                retry_after_secs: e.retry_after_secs,
            },
            ErrorCategory::ServerError | ErrorCategory::Network => {
                AppError::UpstreamUnavailable(e.message)
            }
            ErrorCategory::Authentication => AppError::Authentication(e.message),
            ErrorCategory::Authorization => AppError::Authorization(e.message),
            ErrorCategory::Validation => AppError::Validation(e.message),
            ErrorCategory::NotFound => AppError::NotFound(e.message),
            ErrorCategory::Unknown => AppError::Internal(e.message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::ValidationFields(fields) => {
                let details: serde_json::Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(f, m)| (f.clone(), json!(m)))
                    .collect();
                json!({
                    "success": false,
                    "error": { "code": self.code(), "message": self.to_string(), "fields": details }
                })
            }
            _ => json!({
                "success": false,
                "error": { "code": self.code(), "message": self.to_string() }
            }),
        };

        // Stack traces never ship; 5xx details stay in the logs.
        if status.is_server_error() {
            tracing::error!(code = self.code(), "request failed: {}", self);
        }

        let mut resp = (status, Json(body)).into_response();
        if let AppError::RateLimited {
            retry_after_secs: Some(secs),
        } = self
        {
            if let Ok(v) = header::HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Authentication("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Authorization("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("signup".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("dup".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::RateLimited {
                retry_after_secs: None
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retry_after_header() {
        let resp = AppError::RateLimited {
            retry_after_secs: Some(30),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }
}
