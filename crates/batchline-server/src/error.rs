//! Error taxonomy for the HTTP surface.
//!
//! Every failure a handler can produce maps onto one of these kinds, and the
//! kind alone decides the status code. Authentication failures are opaque by
//! contract: callers never learn whether the user or the password was wrong.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller-correctable request problems: bad JSON, out-of-range
    /// parameters, empty prompt, unknown fields.
    #[error("{0}")]
    Validation(String),

    /// Any authentication failure. Deliberately carries no detail.
    #[error("invalid credentials")]
    Auth,

    #[error("task not found: {0}")]
    NotFound(String),

    /// Queue at capacity; `retry_after` is surfaced as a `Retry-After`
    /// header in seconds.
    #[error("queue full")]
    QueueFull { retry_after: u64 },

    /// Upstream engine unreachable and fallback disabled.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Invariant violations and other bugs. Logged with detail, reported
    /// without it.
    #[error("internal error")]
    Internal(String),
}

/// Wire shape for error bodies.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Auth => "UNAUTHORIZED",
            Self::NotFound(_) => "TASK_NOT_FOUND",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal error");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: self.code().to_string(),
            request_id: None,
        };
        let mut response = (self.status(), Json(body)).into_response();

        match &self {
            Self::Auth => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::QueueFull { retry_after } => {
                if let Ok(val) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, val);
                }
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(ApiError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotFound("t".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::QueueFull { retry_after: 1 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Upstream("down".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::Internal("bug".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn auth_error_is_opaque() {
        assert_eq!(ApiError::Auth.to_string(), "invalid credentials");
    }

    #[tokio::test]
    async fn queue_full_sets_retry_after() {
        let response = ApiError::QueueFull { retry_after: 7 }.into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[tokio::test]
    async fn unauthorized_sets_www_authenticate() {
        let response = ApiError::Auth.into_response();
        assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    }
}
