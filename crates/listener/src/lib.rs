//! WipGuard webhook receiver.
//!
//! Binds an HTTP server, verifies the HMAC-SHA256 signature of every GitHub
//! webhook delivery, and hands the event to [`engine::EventDispatcher`].
//!
//! ## Routes
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /webhook` | GitHub webhook deliveries |
//! | `GET /health` | Liveness probe |
//! | `GET /installations/{id}/entitlement` | Read-only entitlement query |
//!
//! Deliveries are counted per installation by an optional [`RateLimiter`];
//! over the limit the listener answers `429` without dispatching.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport details and status-code mapping live here.
//! The [`engine`] crate sees only an event type string and a JSON payload.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use engine::{DispatchOutcome, EntitlementRecord, EventDispatcher, InstallationId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod rate_limit;
pub mod signature;

pub use error::WebhookError;
pub use rate_limit::{RateKey, RateLimitConfig, RateLimiter};
pub use signature::{verify_signature, SIGNATURE_HEADER};

/// Header naming the webhook event (`pull_request`, `installation`, ...).
pub const EVENT_HEADER: &str = "x-github-event";

/// Header carrying GitHub's unique delivery id.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<EventDispatcher>,
    pub webhook_secret: Arc<[u8]>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<EventDispatcher>, webhook_secret: impl AsRef<[u8]>) -> Self {
        Self {
            dispatcher,
            webhook_secret: Arc::from(webhook_secret.as_ref()),
            rate_limiter: None,
        }
    }

    /// Limits deliveries per installation.
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiter::new(config)));
        self
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/installations/{id}/entitlement", get(entitlement))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves [`router`] on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening for webhooks");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DispatchOutcome>, WebhookError> {
    let signature = header(&headers, SIGNATURE_HEADER).ok_or(WebhookError::MissingSignature)?;
    verify_signature(&state.webhook_secret, &body, signature)?;

    let event = header(&headers, EVENT_HEADER).ok_or(WebhookError::MissingEventType)?;
    let payload: Value =
        serde_json::from_slice(&body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    let event_type = match payload.get("action").and_then(Value::as_str) {
        Some(action) => format!("{event}.{action}"),
        None => event.to_string(),
    };
    info!(
        delivery = header(&headers, DELIVERY_HEADER).unwrap_or("-"),
        %event_type,
        "event received"
    );

    if let Some(limiter) = &state.rate_limiter {
        limiter.check(RateKey::of(&payload))?;
    }

    let outcome = state.dispatcher.dispatch(&event_type, &payload).await?;
    Ok(Json(outcome))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "wipguard"
    }))
}

/// Body of `GET /installations/{id}/entitlement`.
#[derive(Debug, Serialize)]
pub struct EntitlementView {
    pub installation: InstallationId,
    pub entitled: bool,
    pub record: Option<EntitlementRecord>,
}

async fn entitlement(State(state): State<AppState>, Path(id): Path<u64>) -> Json<EntitlementView> {
    let installation = InstallationId::new(id);
    Json(EntitlementView {
        installation,
        entitled: state.dispatcher.is_entitled(installation),
        record: state.dispatcher.entitlement(installation),
    })
}

#[cfg(test)]
mod tests;
