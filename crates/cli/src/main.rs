//! WipGuard CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: flags with environment fallbacks, validated
//!    before anything starts.
//! 2. **Wire observability**: `tracing-subscriber` with a text or JSON layer
//!    and an optional OpenTelemetry OTLP exporter. All spans and events from
//!    every crate in the workspace flow through this subscriber.
//! 3. **Construct infrastructure**: the GitHub REST client (app or token
//!    credentials) injected into the engine's `EventDispatcher`.
//! 4. **Serve**: bind the webhook listener (rate-limited per installation),
//!    prune expired status records on an interval, and shut down cleanly on
//!    Ctrl-C.
//!
//! `wipguard entitlement <id>` queries a running server instead.

mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use engine::EventDispatcher;
use github::{http_client, AppTokenSource, GithubClient, StaticToken, TokenSource};
use listener::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{Cli, Command, Credentials, EntitlementArgs, ServeArgs};

/// Upper bound on the interval between ledger prunes.
const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = telemetry::init(cli.log_format)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Entitlement(args) => query_entitlement(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config().context("invalid configuration")?;
    info!(
        port = config.port,
        api_url = %config.github.api_url,
        unknown_installations = ?config.engine.unknown_installations,
        "starting wipguard"
    );

    let http = http_client(config.github.timeout).context("failed to build HTTP client")?;
    let tokens: Arc<dyn TokenSource> = match &config.credentials {
        Credentials::App { app_id, private_key } => Arc::new(
            AppTokenSource::new(*app_id, private_key, http.clone(), config.github.api_url.clone())
                .context("invalid GitHub App credentials")?,
        ),
        Credentials::Token(token) => Arc::new(StaticToken::new(token.clone())),
    };
    let github = Arc::new(GithubClient::new(config.github.clone(), http, tokens));

    let dispatcher = Arc::new(EventDispatcher::new(
        config.engine.clone(),
        github.clone(),
        github,
    ));

    let prune_every = config.engine.status_ttl.min(MAX_PRUNE_INTERVAL);
    let pruner = tokio::spawn(prune_loop(dispatcher.clone(), prune_every));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    let mut state = AppState::new(dispatcher, config.webhook_secret.as_bytes());
    if let Some(limit) = config.rate_limit.clone() {
        state = state.with_rate_limit(limit);
    }

    let served = listener::serve(listener, state, shutdown_signal()).await;
    pruner.abort();
    served.context("webhook server failed")?;
    info!("wipguard stopped");
    Ok(())
}

async fn prune_loop(dispatcher: Arc<EventDispatcher>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        dispatcher.prune_expired();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutdown requested");
}

async fn query_entitlement(args: EntitlementArgs) -> Result<()> {
    let url = format!(
        "{}/installations/{}/entitlement",
        args.server.trim_end_matches('/'),
        args.installation
    );
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("server answered {status} for {url}");
    }
    let body: serde_json::Value = response
        .json()
        .await
        .context("server returned an invalid entitlement response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
