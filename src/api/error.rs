//! HTTP error taxonomy.
//!
//! Each category carries a fixed status and recovery policy. Crawl statuses
//! (`blocked` / `manual_needed` / `error`) never surface here; they live on
//! the Company record.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid input; never retried, surfaced verbatim.
    #[error("{message}")]
    BadRequest {
        message: String,
        issues: Option<serde_json::Value>,
    },

    #[error("unauthorized")]
    Unauthorized,

    /// Entitlement gate failed (e.g. competitor cap).
    #[error("{0}")]
    Forbidden(String),

    #[error("resource not found")]
    NotFound,

    #[error("conflict: {reason}")]
    Conflict {
        reason: String,
        body: Option<serde_json::Value>,
    },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: i64 },

    /// Store or lock layer fault; the next timer tick retries.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            issues: None,
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        ApiError::Conflict {
            reason: reason.into(),
            body: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest { message, issues } => {
                let mut body = serde_json::json!({
                    "error": "bad_request",
                    "message": message,
                });
                if let Some(issues) = issues {
                    body["issues"] = issues;
                }
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Missing or invalid credentials",
                })),
            )
                .into_response(),
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "forbidden",
                    "message": message,
                })),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                    "message": "Resource not found",
                })),
            )
                .into_response(),
            ApiError::Conflict { reason, body } => {
                let mut payload = serde_json::json!({
                    "error": "conflict",
                    "reason": reason,
                });
                if let Some(serde_json::Value::Object(extra)) = body {
                    if let serde_json::Value::Object(target) = &mut payload {
                        for (key, value) in extra {
                            target.insert(key, value);
                        }
                    }
                }
                (StatusCode::CONFLICT, Json(payload)).into_response()
            }
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "message": "Too many requests. Please slow down.",
                    "retry_after_seconds": retry_after_secs,
                })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal",
                        "message": "Internal server error",
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::bad_request("nope").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden("cap".to_string()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::conflict("already_active").into_response().status(),
            StatusCode::CONFLICT
        );
        let limited = ApiError::RateLimited {
            retry_after_secs: 30,
        }
        .into_response();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers().get("Retry-After").unwrap(), "30");
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom"))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
