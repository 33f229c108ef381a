//! REST client implementing the engine's ports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::{
    CommitStatusWriter, ConfigReadError, InstallationId, RepositoryConfig, RepositoryConfigSource,
    RepositoryName, StatusWriteError, StatusWriteRequest,
};
use reqwest::header::{ACCEPT, USER_AGENT as USER_AGENT_HEADER};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::auth::TokenSource;
use crate::error::GithubError;
use crate::{DEFAULT_API_URL, GITHUB_ACCEPT, USER_AGENT};

/// Path of the per-repository configuration file.
pub const CONFIG_PATH: &str = ".github/wip.yml";

const RAW_ACCEPT: &str = "application/vnd.github.raw+json";

/// Settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    /// API root, e.g. `https://api.github.com` or a GHES `/api/v3` URL.
    pub api_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Link attached to every status written.
    pub target_url: Option<String>,
}

impl Default for GithubClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(10),
            target_url: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateStatusBody<'a> {
    state: &'a str,
    description: &'a str,
    context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
}

/// GitHub REST client used as both the commit-status writer and the
/// repository config source.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    target_url: Option<String>,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_url", &self.api_url)
            .field("target_url", &self.target_url)
            .finish_non_exhaustive()
    }
}

/// Builds the shared HTTP client with the configured timeout.
///
/// # Errors
///
/// [`GithubError::Transport`] if the TLS backend cannot be initialised.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, GithubError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| GithubError::Transport {
            message: e.to_string(),
        })
}

impl GithubClient {
    pub fn new(
        config: GithubClientConfig,
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            target_url: config.target_url,
            tokens,
        }
    }

    fn repo_url(&self, repository: &RepositoryName, tail: &str) -> Result<String, GithubError> {
        let (owner, repo) = repository.split().ok_or_else(|| GithubError::Api {
            status: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            message: format!("'{repository}' is not an owner/repo name"),
        })?;
        Ok(format!("{}/repos/{owner}/{repo}/{tail}", self.api_url))
    }

    /// `POST /repos/{owner}/{repo}/statuses/{sha}`.
    #[instrument(
        skip(self, request),
        fields(repository = %request.repository, sha = request.sha.short())
    )]
    pub async fn create_status(&self, request: &StatusWriteRequest) -> Result<(), GithubError> {
        let url = self.repo_url(&request.repository, &format!("statuses/{}", request.sha))?;
        let token = self.tokens.installation_token(request.installation).await?;
        let body = CreateStatusBody {
            state: request.state.as_str(),
            description: &request.description,
            context: request.context.as_str(),
            target_url: self.target_url.as_deref(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(%status, state = body.state, "status created");
            return Ok(());
        }
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        Err(GithubError::from_response(status, &headers, text))
    }

    /// Fetches `.github/wip.yml` from the default branch. `Ok(None)` when the
    /// file does not exist.
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn fetch_config(
        &self,
        installation: InstallationId,
        repository: &RepositoryName,
    ) -> Result<Option<String>, GithubError> {
        let url = self.repo_url(repository, &format!("contents/{CONFIG_PATH}"))?;
        let token = self.tokens.installation_token(installation).await?;

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header(ACCEPT, RAW_ACCEPT)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("no repository config");
            return Ok(None);
        }
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(GithubError::from_response(status, &headers, text));
        }
        Ok(Some(response.text().await?))
    }
}

/// Parses the YAML config file. An empty file means all defaults.
pub fn parse_config(source: &str) -> Result<RepositoryConfig, ConfigReadError> {
    if source.trim().is_empty() {
        return Ok(RepositoryConfig::default());
    }
    serde_yaml::from_str(source).map_err(|e| ConfigReadError::Invalid {
        message: e.to_string(),
    })
}

#[async_trait]
impl CommitStatusWriter for GithubClient {
    async fn create_or_update_commit_status(
        &self,
        request: &StatusWriteRequest,
    ) -> Result<(), StatusWriteError> {
        self.create_status(request).await.map_err(StatusWriteError::from)
    }
}

#[async_trait]
impl RepositoryConfigSource for GithubClient {
    async fn read_config(
        &self,
        installation: InstallationId,
        repository: &RepositoryName,
    ) -> Result<Option<RepositoryConfig>, ConfigReadError> {
        match self.fetch_config(installation, repository).await? {
            Some(source) => parse_config(&source).map(Some),
            None => Ok(None),
        }
    }
}
