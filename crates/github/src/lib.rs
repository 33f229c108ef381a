//! WipGuard GitHub infrastructure adapter.
//!
//! Implements the engine's [`engine::CommitStatusWriter`] and
//! [`engine::RepositoryConfigSource`] ports over the GitHub REST API with
//! `reqwest`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! Authentication, rate-limit classification and HTTP details are handled
//! here; the [`engine`] crate never sees them.
//!
//! ## Failure mapping
//!
//! | GitHub answer | [`engine::StatusWriteError`] | Retry |
//! |---------------|------------------------------|-------|
//! | client timeout | `Timeout` | yes |
//! | 429, or 403 with `x-ratelimit-remaining: 0` | `RateLimited` (with `Retry-After`) | yes |
//! | 5xx | `Rejected` | yes |
//! | 401 | `Authentication` | no |
//! | other 4xx | `Rejected` | no |
//!
//! The client never retries; re-delivery of the webhook is the retry path.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{AppTokenSource, StaticToken, TokenSource};
pub use client::{http_client, parse_config, GithubClient, GithubClientConfig, CONFIG_PATH};
pub use error::GithubError;

/// Public GitHub API root.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

pub(crate) const GITHUB_ACCEPT: &str = "application/vnd.github+json";
pub(crate) const USER_AGENT: &str = concat!("wipguard/", env!("CARGO_PKG_VERSION"));
