//! Webhook errors and their HTTP mapping.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use axum::Json;
use engine::{DispatchError, RetryPolicy};
use serde_json::json;
use thiserror::Error;

/// Why a webhook delivery was not accepted.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The `X-Hub-Signature-256` header is missing.
    #[error("missing signature header")]
    MissingSignature,

    /// The signature does not match the body.
    #[error("invalid signature")]
    InvalidSignature,

    /// The `X-GitHub-Event` header is missing.
    #[error("missing event header")]
    MissingEventType,

    /// The body is not JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Too many deliveries for one installation within the window.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Until the oldest counted delivery leaves the window.
        retry_after: Duration,
    },

    /// The engine rejected or failed the event.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl WebhookError {
    /// HTTP status for this error.
    ///
    /// Status-write failures answer 503 when re-delivery may succeed and 502
    /// otherwise, so GitHub's delivery log shows which ones are worth
    /// redelivering.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::MissingEventType
            | Self::InvalidPayload(_)
            | Self::Dispatch(DispatchError::MalformedEvent { .. }) => StatusCode::BAD_REQUEST,
            Self::Dispatch(err @ DispatchError::StatusWrite { .. }) => {
                if err.retry_policy().is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Dispatch(err) => err.retry_policy(),
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: Some(*retry_after),
            },
            _ => RetryPolicy::NonRetryable,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Remote failure details stay in the logs.
        let message = match &self {
            Self::Dispatch(DispatchError::StatusWrite { .. }) => {
                "commit status write failed".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let Some(after) = self.retry_policy().retry_after() {
            if let Ok(value) = HeaderValue::from_str(&after.as_secs().to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
