use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use engine::{
    CommitStatusWriter, EngineSettings, EventDispatcher, NoRepositoryConfig, StatusWriteError,
    StatusWriteRequest, UnknownInstallationPolicy,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::signature::sign;

const SECRET: &[u8] = b"test-secret";

#[derive(Default)]
struct ScriptedWriter {
    failure: Mutex<Option<StatusWriteError>>,
    writes: Mutex<Vec<StatusWriteRequest>>,
}

#[async_trait]
impl CommitStatusWriter for ScriptedWriter {
    async fn create_or_update_commit_status(
        &self,
        request: &StatusWriteRequest,
    ) -> Result<(), StatusWriteError> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        self.writes.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn state(policy: UnknownInstallationPolicy) -> (AppState, Arc<ScriptedWriter>) {
    let writer = Arc::new(ScriptedWriter::default());
    let settings = EngineSettings {
        unknown_installations: policy,
        ..EngineSettings::default()
    };
    let dispatcher = EventDispatcher::new(settings, writer.clone(), Arc::new(NoRepositoryConfig));
    (AppState::new(Arc::new(dispatcher), SECRET), writer)
}

fn app(policy: UnknownInstallationPolicy) -> (Router, Arc<ScriptedWriter>) {
    let (state, writer) = state(policy);
    (router(state), writer)
}

fn pull_request_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "action": "opened",
        "installation": { "id": 9 },
        "repository": { "full_name": "octo/app", "private": false },
        "pull_request": {
            "number": 1,
            "title": "WIP: thing",
            "labels": [],
            "head": { "sha": "cccccccccccccccccccccccccccccccccccccccc" }
        }
    }))
    .unwrap()
}

fn delivery(event: &str, body: Vec<u8>) -> Request<Body> {
    Request::post("/webhook")
        .header(SIGNATURE_HEADER, sign(SECRET, &body))
        .header(EVENT_HEADER, event)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app(UnknownInstallationPolicy::Deny);
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "status": "healthy", "service": "wipguard" })
    );
}

#[tokio::test]
async fn test_signed_pull_request_is_dispatched() {
    let (app, writer) = app(UnknownInstallationPolicy::All);
    let response = app
        .oneshot(delivery("pull_request", pull_request_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "status-written");
    assert_eq!(body["request"]["state"], "pending");
    assert_eq!(writer.writes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_signature_is_unauthorized() {
    let (app, writer) = app(UnknownInstallationPolicy::All);
    let request = Request::post("/webhook")
        .header(EVENT_HEADER, "pull_request")
        .body(Body::from(pull_request_body()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(writer.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_signature_is_unauthorized() {
    let (app, _) = app(UnknownInstallationPolicy::All);
    let body = pull_request_body();
    let request = Request::post("/webhook")
        .header(SIGNATURE_HEADER, sign(b"other-secret", &body))
        .header(EVENT_HEADER, "pull_request")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_event_header_is_bad_request() {
    let (app, _) = app(UnknownInstallationPolicy::All);
    let body = pull_request_body();
    let request = Request::post("/webhook")
        .header(SIGNATURE_HEADER, sign(SECRET, &body))
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_event_is_bad_request() {
    let (app, _) = app(UnknownInstallationPolicy::All);
    let body = serde_json::to_vec(&json!({ "action": "opened" })).unwrap();
    let response = app.oneshot(delivery("pull_request", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsupported_event_is_ignored() {
    let (app, _) = app(UnknownInstallationPolicy::All);
    let body = serde_json::to_vec(&json!({ "zen": "Keep it logically awesome." })).unwrap();
    let response = app.oneshot(delivery("ping", body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "outcome": "ignored", "event": "ping" })
    );
}

#[tokio::test]
async fn test_retryable_write_failure_is_service_unavailable() {
    let (app, writer) = app(UnknownInstallationPolicy::All);
    *writer.failure.lock().unwrap() = Some(StatusWriteError::RateLimited {
        retry_after: Some(Duration::from_secs(60)),
    });

    let response = app
        .oneshot(delivery("pull_request", pull_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("retry-after").unwrap(), "60");
}

#[tokio::test]
async fn test_permanent_write_failure_is_bad_gateway() {
    let (app, writer) = app(UnknownInstallationPolicy::All);
    *writer.failure.lock().unwrap() = Some(StatusWriteError::Rejected {
        status: 422,
        message: "No commit found".into(),
    });

    let response = app
        .oneshot(delivery("pull_request", pull_request_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_deliveries_over_rate_limit_are_rejected() {
    let (state, writer) = state(UnknownInstallationPolicy::All);
    let app = router(state.with_rate_limit(RateLimitConfig {
        max_deliveries: 1,
        window: Duration::from_secs(60),
        ..RateLimitConfig::default()
    }));

    let first = app
        .clone()
        .oneshot(delivery("pull_request", pull_request_body()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(delivery("pull_request", pull_request_body()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers().get("retry-after").unwrap(), "60");
    assert_eq!(writer.writes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_entitlement_route_reflects_marketplace_events() {
    let (app, _) = app(UnknownInstallationPolicy::Deny);
    let purchase = serde_json::to_vec(&json!({
        "action": "purchased",
        "installation": { "id": 9 },
        "marketplace_purchase": {
            "account": { "id": 3 },
            "plan": { "id": 1, "name": "Pro", "price_model": "FLAT_RATE" }
        }
    }))
    .unwrap();

    let response = app
        .clone()
        .oneshot(delivery("marketplace_purchase", purchase))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/installations/9/entitlement")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["installation"], 9);
    assert_eq!(body["entitled"], true);
    assert_eq!(body["record"]["status"], "active");
}

#[tokio::test]
async fn test_unknown_installation_entitlement() {
    let (app, _) = app(UnknownInstallationPolicy::Deny);
    let response = app
        .oneshot(
            Request::get("/installations/77/entitlement")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await,
        json!({ "installation": 77, "entitled": false, "record": null })
    );
}
