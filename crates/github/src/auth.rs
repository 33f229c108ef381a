//! Credentials for GitHub API calls.
//!
//! Two [`TokenSource`]s:
//!
//! - [`StaticToken`]: one personal or fine-grained token used for every
//!   installation. Suits single-installation deployments.
//! - [`AppTokenSource`]: GitHub App authentication. Signs an RS256 JWT with the
//!   app's private key, exchanges it for an installation access token, and
//!   caches that token until five minutes before it expires.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine::InstallationId;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::GithubError;
use crate::{GITHUB_ACCEPT, USER_AGENT};

/// Tokens are refreshed this long before GitHub expires them.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Supplies the bearer token for calls made on behalf of an installation.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn installation_token(&self, installation: InstallationId) -> Result<String, GithubError>;
}

/// A fixed token used for every installation.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn installation_token(
        &self,
        _installation: InstallationId,
    ) -> Result<String, GithubError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let margin =
            chrono::Duration::from_std(REFRESH_MARGIN).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at - margin > now
    }
}

/// GitHub App installation tokens, cached per installation.
pub struct AppTokenSource {
    app_id: u64,
    key: EncodingKey,
    http: reqwest::Client,
    api_base: String,
    cache: RwLock<HashMap<InstallationId, CachedToken>>,
}

impl std::fmt::Debug for AppTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppTokenSource")
            .field("app_id", &self.app_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl AppTokenSource {
    /// Builds a token source from the app id and its PEM private key.
    ///
    /// # Errors
    ///
    /// [`GithubError::Authentication`] if the key is not a valid RSA PEM.
    pub fn new(
        app_id: u64,
        private_key_pem: &str,
        http: reqwest::Client,
        api_base: impl Into<String>,
    ) -> Result<Self, GithubError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).map_err(|e| {
            GithubError::Authentication {
                message: format!("invalid GitHub App private key: {e}"),
            }
        })?;
        Ok(Self {
            app_id,
            key,
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Signs the app JWT. Issued a minute in the past to absorb clock skew.
    fn app_jwt(&self) -> Result<String, GithubError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iss: self.app_id.to_string(),
            iat: now - 60,
            exp: now + 600,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key).map_err(|e| {
            GithubError::Authentication {
                message: format!("failed to sign app JWT: {e}"),
            }
        })
    }

    async fn exchange(&self, installation: InstallationId) -> Result<CachedToken, GithubError> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation
        );
        info!(%installation, "requesting installation access token");

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.app_jwt()?)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(match GithubError::from_response(status, &headers, body) {
                GithubError::Api { status, message } if status == 401 || status == 404 => {
                    GithubError::Authentication { message }
                }
                other => other,
            });
        }

        let body: InstallationTokenResponse = response.json().await?;
        Ok(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for AppTokenSource {
    async fn installation_token(
        &self,
        installation: InstallationId,
    ) -> Result<String, GithubError> {
        if let Some(cached) = self.cache.read().await.get(&installation) {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.exchange(installation).await?;
        debug!(%installation, expires_at = %fresh.expires_at, "caching installation token");
        let token = fresh.token.clone();
        self.cache.write().await.insert(installation, fresh);
        Ok(token)
    }
}
