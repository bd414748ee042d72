//! Error types for the webhook boundary and the upstream collaborators.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Terminal rejection of an inbound webhook call.  None of these leave any
/// trace in the relay stores.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(
        "too many requests: last accepted request {:.1}s ago, retry in {:.1}s",
        .elapsed.as_secs_f64(),
        .retry_after.as_secs_f64()
    )]
    TooManyRequests {
        elapsed: Duration,
        retry_after: Duration,
    },
    #[error("{0}")]
    Internal(String),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebhookError::Forbidden(_) => StatusCode::FORBIDDEN,
            WebhookError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WebhookError::BadRequest(_) => "bad_request",
            WebhookError::Forbidden(_) => "forbidden",
            WebhookError::TooManyRequests { .. } => "rate_limited",
            WebhookError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Internal details stay in the logs.
            WebhookError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model stream failed: {0}")]
    Stream(String),
    #[error("model returned an empty answer")]
    EmptyResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("callback request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("callback returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_error_reports_elapsed_and_retry() {
        let err = WebhookError::TooManyRequests {
            elapsed: Duration::from_millis(200),
            retry_after: Duration::from_millis(800),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let text = err.to_string();
        assert!(text.contains("0.2s ago"), "{text}");
        assert!(text.contains("retry in 0.8s"), "{text}");
    }

    #[test]
    fn statuses_map_to_http_codes() {
        assert_eq!(
            WebhookError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            WebhookError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
