//! Command-line and environment configuration.
//!
//! Every `serve` flag has an environment fallback so the binary can run
//! unchanged in a container. [`ServeArgs::into_config`] validates the raw
//! arguments into a [`ServiceConfig`] before anything binds a socket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use engine::{EngineSettings, StatusContext, UnknownInstallationPolicy};
use github::{GithubClientConfig, DEFAULT_API_URL};
use listener::RateLimitConfig;

#[derive(Debug, Parser)]
#[command(
    name = "wipguard",
    version,
    about = "Marks work-in-progress pull requests with a commit status"
)]
pub struct Cli {
    /// Log output format.
    #[arg(
        long,
        env = "WIPGUARD_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the webhook server.
    Serve(ServeArgs),
    /// Ask a running server for an installation's entitlement.
    Entitlement(EntitlementArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Secret used to verify webhook signatures.
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: String,

    /// GitHub App id.
    #[arg(long, env = "GITHUB_APP_ID")]
    pub app_id: Option<u64>,

    /// GitHub App private key (PEM). Literal `\n` sequences are accepted.
    #[arg(
        long,
        env = "GITHUB_PRIVATE_KEY",
        hide_env_values = true,
        conflicts_with = "private_key_path"
    )]
    pub private_key: Option<String>,

    /// Path to the GitHub App private key.
    #[arg(long, env = "GITHUB_PRIVATE_KEY_PATH")]
    pub private_key_path: Option<PathBuf>,

    /// Personal or fine-grained token, instead of app credentials.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// GitHub API root.
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Timeout for each GitHub request, in seconds.
    #[arg(long, env = "WIPGUARD_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// How long a written status suppresses identical rewrites, in seconds.
    #[arg(long, env = "WIPGUARD_STATUS_TTL_SECS", default_value_t = 3600)]
    pub status_ttl_secs: u64,

    /// Entitlement of installations without a marketplace record: deny, public or all.
    #[arg(long, env = "WIPGUARD_UNKNOWN_INSTALLATIONS", default_value = "deny")]
    pub unknown_installations: UnknownInstallationPolicy,

    /// Link attached to every status.
    #[arg(long, env = "WIPGUARD_TARGET_URL")]
    pub target_url: Option<String>,

    /// Deliveries accepted per installation within one window; 0 disables the limit.
    #[arg(long, env = "WIPGUARD_RATE_LIMIT", default_value_t = 120)]
    pub rate_limit: u32,

    /// Length of the delivery rate-limit window, in seconds.
    #[arg(long, env = "WIPGUARD_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct EntitlementArgs {
    /// Installation id to look up.
    pub installation: u64,

    /// Base URL of the running server.
    #[arg(long, env = "WIPGUARD_SERVER_URL", default_value = "http://127.0.0.1:3000")]
    pub server: String,
}

/// How the GitHub adapter authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    App { app_id: u64, private_key: String },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App { app_id, .. } => f
                .debug_struct("App")
                .field("app_id", app_id)
                .finish_non_exhaustive(),
            Self::Token(_) => f.write_str("Token(***)"),
        }
    }
}

/// Validated `serve` configuration.
#[derive(Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub webhook_secret: String,
    pub credentials: Credentials,
    pub github: GithubClientConfig,
    pub engine: EngineSettings,
    pub rate_limit: Option<RateLimitConfig>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("github", &self.github)
            .field("engine", &self.engine)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServiceConfig> {
        if self.webhook_secret.trim().is_empty() {
            bail!("webhook secret must not be empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request timeout must be at least one second");
        }
        if self.status_ttl_secs == 0 {
            bail!("status TTL must be at least one second");
        }

        if self.rate_limit > 0 && self.rate_limit_window_secs == 0 {
            bail!("rate-limit window must be at least one second");
        }
        let rate_limit = (self.rate_limit > 0).then(|| RateLimitConfig {
            max_deliveries: self.rate_limit,
            window: Duration::from_secs(self.rate_limit_window_secs),
            ..RateLimitConfig::default()
        });

        let private_key = match (self.private_key, &self.private_key_path) {
            (Some(inline), _) => Some(inline.replace("\\n", "\n")),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path).with_context(|| {
                    format!("failed to read private key from {}", path.display())
                })?,
            ),
            (None, None) => None,
        };

        let credentials = match (self.app_id, private_key, self.token) {
            (Some(app_id), Some(private_key), _) => Credentials::App { app_id, private_key },
            (Some(_), None, _) => bail!("GitHub App id given without a private key"),
            (None, Some(_), _) => bail!("GitHub App private key given without an app id"),
            (None, None, Some(token)) if !token.trim().is_empty() => Credentials::Token(token),
            (None, None, _) => {
                bail!("no GitHub credentials: set --app-id with --private-key[-path], or --token")
            }
        };

        Ok(ServiceConfig {
            port: self.port,
            webhook_secret: self.webhook_secret,
            credentials,
            github: GithubClientConfig {
                api_url: self.api_url,
                timeout: Duration::from_secs(self.request_timeout_secs),
                target_url: self.target_url.filter(|url| !url.trim().is_empty()),
            },
            engine: EngineSettings {
                status_ttl: Duration::from_secs(self.status_ttl_secs),
                unknown_installations: self.unknown_installations,
                default_status_context: StatusContext::default(),
            },
            rate_limit,
        })
    }
}
