//! GitHub adapter errors and their mapping onto the engine's port errors.

use std::time::Duration;

use engine::{ConfigReadError, StatusWriteError};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;

/// Header GitHub uses to report the remaining primary rate limit.
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// A failed GitHub API interaction.
#[derive(Debug, Error)]
pub enum GithubError {
    /// The request exceeded the client timeout.
    #[error("request to GitHub timed out")]
    Timeout,

    /// Primary or secondary rate limit hit.
    #[error("GitHub rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// GitHub answered with a non-success status.
    #[error("GitHub returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Credentials were rejected or could not be produced.
    #[error("GitHub authentication failed: {message}")]
    Authentication { message: String },

    /// Connection-level failure.
    #[error("GitHub request failed: {message}")]
    Transport { message: String },

    /// A response body could not be decoded.
    #[error("unexpected GitHub response: {message}")]
    InvalidResponse { message: String },
}

impl GithubError {
    /// Classifies a non-success response.
    pub(crate) fn from_response(status: StatusCode, headers: &HeaderMap, body: String) -> Self {
        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN
                && headers
                    .get(RATE_LIMIT_REMAINING)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.trim() == "0"));

        if rate_limited {
            return Self::RateLimited {
                retry_after: retry_after(headers),
            };
        }
        if status == StatusCode::UNAUTHORIZED {
            return Self::Authentication { message: body };
        }
        Self::Api {
            status: status.as_u16(),
            message: body,
        }
    }
}

impl From<reqwest::Error> for GithubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse {
                message: err.to_string(),
            }
        } else {
            Self::Transport {
                message: err.to_string(),
            }
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl From<GithubError> for StatusWriteError {
    fn from(err: GithubError) -> Self {
        match err {
            GithubError::Timeout => StatusWriteError::Timeout,
            GithubError::RateLimited { retry_after } => {
                StatusWriteError::RateLimited { retry_after }
            }
            GithubError::Api { status, message } => StatusWriteError::Rejected { status, message },
            GithubError::Authentication { message } => StatusWriteError::Authentication { message },
            GithubError::Transport { message } | GithubError::InvalidResponse { message } => {
                StatusWriteError::Transport { message }
            }
        }
    }
}

impl From<GithubError> for ConfigReadError {
    fn from(err: GithubError) -> Self {
        ConfigReadError::Unavailable {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_429_is_rate_limited_with_retry_after() {
        let err = GithubError::from_response(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "30")]),
            String::new(),
        );
        assert!(matches!(
            err,
            GithubError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(30)
        ));
    }

    #[test]
    fn test_403_with_exhausted_quota_is_rate_limited() {
        let err = GithubError::from_response(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "0")]),
            String::new(),
        );
        assert!(matches!(err, GithubError::RateLimited { retry_after: None }));
    }

    #[test]
    fn test_plain_403_is_an_api_error() {
        let err = GithubError::from_response(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "4999")]),
            "Resource not accessible by integration".into(),
        );
        assert!(matches!(err, GithubError::Api { status: 403, .. }));
        assert_eq!(
            StatusWriteError::from(err).retry_policy(),
            engine::RetryPolicy::NonRetryable
        );
    }

    #[test]
    fn test_server_errors_map_to_retryable_rejections() {
        let err =
            GithubError::from_response(StatusCode::BAD_GATEWAY, &HeaderMap::new(), String::new());
        assert!(StatusWriteError::from(err).retry_policy().is_retryable());
    }
}
