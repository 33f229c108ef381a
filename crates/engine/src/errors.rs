//! Error and retry-policy types for the WipGuard engine.
//!
//! [`DispatchError`] covers the conditions that end a dispatch without the
//! intended effect. Port-level errors ([`StatusWriteError`],
//! [`ConfigReadError`]) are produced by infrastructure adapters and classified
//! here so the engine can decide what to do without knowing about HTTP.
//!
//! [`RetryPolicy`] is a cross-cutting concern: the engine itself never retries,
//! but it reports whether re-delivering the same event could succeed so the
//! hosting transport can answer GitHub appropriately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is worth retrying by re-delivery and, if so,
/// after what delay.
///
/// ## Rules
///
/// - `Retryable` errors: request timeouts, rate limiting, GitHub 5xx.
/// - `NonRetryable` errors: missing permissions, unknown repository or commit,
///   validation failures, malformed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Re-delivering the event may succeed.
    Retryable {
        /// Minimum back-off before the next attempt, derived from
        /// `Retry-After` when GitHub supplies it.
        after: Option<Duration>,
    },
    /// Re-delivering the same event will fail the same way.
    NonRetryable,
}

impl RetryPolicy {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }

    /// The requested back-off, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RetryPolicy::Retryable { after } => *after,
            RetryPolicy::NonRetryable => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Failure to create a commit status through the REST collaborator.
///
/// Every variant is a remote failure: the engine rolls the status record back
/// and surfaces the error, it never retries in-process.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum StatusWriteError {
    /// The request did not complete within the client's timeout.
    #[error("status write timed out")]
    Timeout,

    /// GitHub throttled the request (secondary or primary rate limit).
    #[error("status write rate limited")]
    RateLimited {
        /// Delay GitHub asked for, if it said.
        retry_after: Option<Duration>,
    },

    /// GitHub answered with a non-success status code.
    #[error("status write rejected with HTTP {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The installation token could not be obtained.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Description of the authentication failure.
        message: String,
    },

    /// Connection-level failure (DNS, TLS, reset).
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
}

impl StatusWriteError {
    /// Classifies this failure for the hosting transport.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StatusWriteError::Timeout | StatusWriteError::Transport { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            StatusWriteError::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            StatusWriteError::Rejected { status, .. } if *status >= 500 => {
                RetryPolicy::Retryable { after: None }
            }
            StatusWriteError::Rejected { .. } | StatusWriteError::Authentication { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

/// Failure to read a repository's WIP configuration.
///
/// The dispatcher never fails an event because of this error; it falls back
/// to the default signal set and logs a warning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigReadError {
    /// The file exists but could not be parsed.
    #[error("invalid repository configuration: {message}")]
    Invalid {
        /// Parser message.
        message: String,
    },

    /// The file could not be fetched (network, permissions, timeout).
    #[error("repository configuration unavailable: {message}")]
    Unavailable {
        /// Description of the fetch failure.
        message: String,
    },
}

/// A title pattern in the repository configuration that cannot be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern is empty (or `//`) and would match every title.
    #[error("empty title pattern")]
    Empty,

    /// A `/…/` pattern is not a valid regular expression.
    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidRegex {
        /// The offending pattern as written.
        pattern: String,
        /// Compiler message.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

/// Errors that end a dispatch without its intended effect.
///
/// Neither variant is fatal to the process and neither touches state owned by
/// another pull request or installation.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload lacks a field the handler for `event` requires.
    ///
    /// Dropped with a diagnostic; re-delivery cannot fix it.
    #[error("malformed '{event}' event: {reason}")]
    MalformedEvent {
        /// Event type the payload was delivered as.
        event: String,
        /// What was missing or unparseable.
        reason: String,
    },

    /// The commit-status write failed after the ledger recorded the intent;
    /// the intent has been rolled back so re-delivery re-attempts the write.
    #[error("commit status write failed: {source}")]
    StatusWrite {
        /// The port's classification of the failure.
        #[source]
        source: StatusWriteError,
    },
}

impl DispatchError {
    /// Classifies this error for the hosting transport.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            DispatchError::MalformedEvent { .. } => RetryPolicy::NonRetryable,
            DispatchError::StatusWrite { source } => source.retry_policy(),
        }
    }
}
