//! End-to-end dispatcher scenarios against in-memory ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::{
    Clock, CommitState, CommitStatusWriter, ConfigReadError, DispatchError, DispatchOutcome,
    EngineSettings, EventDispatcher, InstallationId, MatchedSignal, NotEntitledReason,
    RepositoryConfig, RepositoryConfigSource, RepositoryName, RetryPolicy, StatusWriteError,
    StatusWriteRequest, Timestamp, UnknownInstallationPolicy,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::Notify;

const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const INSTALLATION: u64 = 100;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeWriter {
    writes: Mutex<Vec<StatusWriteRequest>>,
    fail_next: Mutex<Option<StatusWriteError>>,
    delay: Mutex<Option<Duration>>,
    /// Parks the next call until notified.
    hold_next: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeWriter {
    fn fail_next(&self, error: StatusWriteError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    fn writes(&self) -> Vec<StatusWriteRequest> {
        self.writes.lock().unwrap().clone()
    }

    fn hold_next(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.hold_next.lock().unwrap() = Some(release.clone());
        release
    }
}

#[async_trait]
impl CommitStatusWriter for FakeWriter {
    async fn create_or_update_commit_status(
        &self,
        request: &StatusWriteRequest,
    ) -> Result<(), StatusWriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hold = self.hold_next.lock().unwrap().take();
        if let Some(release) = hold {
            release.notified().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let failure = self.fail_next.lock().unwrap().take();
        if let Some(error) = failure {
            return Err(error);
        }
        self.writes.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeConfigs {
    configs: Mutex<HashMap<String, RepositoryConfig>>,
}

impl FakeConfigs {
    fn set(&self, repository: &str, config: RepositoryConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(repository.to_string(), config);
    }
}

#[async_trait]
impl RepositoryConfigSource for FakeConfigs {
    async fn read_config(
        &self,
        _installation: InstallationId,
        repository: &RepositoryName,
    ) -> Result<Option<RepositoryConfig>, ConfigReadError> {
        Ok(self.configs.lock().unwrap().get(repository.as_str()).cloned())
    }
}

struct ManualClock(Mutex<Timestamp>);

impl ManualClock {
    fn new() -> Self {
        Self(Mutex::new(Timestamp::now()))
    }

    fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now = now.plus(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.0.lock().unwrap()
    }
}

struct Harness {
    dispatcher: Arc<EventDispatcher>,
    writer: Arc<FakeWriter>,
    configs: Arc<FakeConfigs>,
    clock: Arc<ManualClock>,
}

fn harness(policy: UnknownInstallationPolicy) -> Harness {
    let writer = Arc::new(FakeWriter::default());
    let configs = Arc::new(FakeConfigs::default());
    let clock = Arc::new(ManualClock::new());
    let settings = EngineSettings {
        status_ttl: Duration::from_secs(3600),
        unknown_installations: policy,
        ..EngineSettings::default()
    };
    let dispatcher = EventDispatcher::new(settings, writer.clone(), configs.clone())
        .with_clock(clock.clone());
    Harness {
        dispatcher: Arc::new(dispatcher),
        writer,
        configs,
        clock,
    }
}

/// A harness whose installation has an active paid plan.
async fn entitled_harness() -> Harness {
    let h = harness(UnknownInstallationPolicy::Deny);
    h.dispatcher
        .dispatch("marketplace_purchase.purchased", &purchase("purchased", "FLAT_RATE"))
        .await
        .unwrap();
    h
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn pull_request(action: &str, title: &str, labels: &[&str], sha: &str) -> Value {
    let labels: Vec<Value> = labels.iter().map(|name| json!({ "name": name })).collect();
    json!({
        "action": action,
        "installation": { "id": INSTALLATION },
        "repository": { "full_name": "octo/app", "private": false },
        "pull_request": {
            "number": 12,
            "title": title,
            "labels": labels,
            "head": { "sha": sha }
        }
    })
}

fn purchase(action: &str, price_model: &str) -> Value {
    json!({
        "action": action,
        "installation": { "id": INSTALLATION },
        "marketplace_purchase": {
            "account": { "id": 7, "login": "octo", "type": "Organization" },
            "plan": { "id": 1, "name": "Team", "price_model": price_model }
        }
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_wip_title_writes_pending_status() {
    let h = entitled_harness().await;

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "Add login [WIP]", &[], SHA_A))
        .await
        .unwrap();

    let DispatchOutcome::StatusWritten { verdict, request } = outcome else {
        panic!("expected a status write, got {outcome:?}");
    };
    assert!(verdict.is_wip);
    // "wip" is listed before "[wip]" and matches inside the brackets.
    assert_eq!(
        verdict.matched,
        MatchedSignal::TitlePattern {
            pattern: "wip".into()
        }
    );
    assert_eq!(request.state, CommitState::Pending);
    assert_eq!(request.description, "Work in progress");
    assert_eq!(request.context.as_str(), "WIP");
    assert_eq!(request.sha.as_str(), SHA_A);
    assert_eq!(h.writer.writes().len(), 1);
}

#[tokio::test]
async fn test_wip_label_keeps_pending_without_rewrite() {
    let h = entitled_harness().await;
    h.dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "Add login [WIP]", &[], SHA_A))
        .await
        .unwrap();

    let outcome = h
        .dispatcher
        .dispatch("pull_request.edited", &pull_request("edited", "Add login", &["wip"], SHA_A))
        .await
        .unwrap();

    let DispatchOutcome::StatusUnchanged { verdict } = outcome else {
        panic!("expected no write, got {outcome:?}");
    };
    assert_eq!(verdict.matched, MatchedSignal::Label { name: "wip".into() });
    assert_eq!(h.writer.writes().len(), 1);
}

#[tokio::test]
async fn test_removing_last_signal_writes_success() {
    let h = entitled_harness().await;
    h.dispatcher
        .dispatch("pull_request.labeled", &pull_request("labeled", "Add login", &["wip"], SHA_A))
        .await
        .unwrap();

    h.dispatcher
        .dispatch("pull_request.unlabeled", &pull_request("unlabeled", "Add login", &[], SHA_A))
        .await
        .unwrap();

    let states: Vec<CommitState> = h.writer.writes().iter().map(|w| w.state).collect();
    assert_eq!(states, vec![CommitState::Pending, CommitState::Success]);
    assert_eq!(h.writer.writes()[1].description, "Ready for review");
}

#[tokio::test]
async fn test_new_head_sha_rewrites_success() {
    let h = entitled_harness().await;
    h.dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "Add login", &[], SHA_A))
        .await
        .unwrap();

    h.dispatcher
        .dispatch("pull_request.synchronize", &pull_request("synchronize", "Add login", &[], SHA_B))
        .await
        .unwrap();

    let writes = h.writer.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].sha.as_str(), SHA_B);
    assert_eq!(writes[1].state, CommitState::Success);
    assert!(h
        .dispatcher
        .ledger()
        .record(&writes[0].repository, &writes[0].sha, h.clock.now())
        .is_none());
}

#[tokio::test]
async fn test_cancelled_plan_blocks_writes_until_repurchase() {
    let h = entitled_harness().await;
    h.dispatcher
        .dispatch("marketplace_purchase.cancelled", &purchase("cancelled", "FLAT_RATE"))
        .await
        .unwrap();

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "WIP login", &[], SHA_A))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::NotEntitled {
            installation: InstallationId::new(INSTALLATION),
            reason: NotEntitledReason::Suspended,
        }
    );
    assert!(h.writer.writes().is_empty());

    h.dispatcher
        .dispatch("marketplace_purchase.changed", &purchase("changed", "FLAT_RATE"))
        .await
        .unwrap();
    h.dispatcher
        .dispatch("pull_request.edited", &pull_request("edited", "WIP login", &[], SHA_A))
        .await
        .unwrap();
    assert_eq!(h.writer.writes().len(), 1);
}

#[tokio::test]
async fn test_unknown_installation_is_dropped_by_default() {
    let h = harness(UnknownInstallationPolicy::Deny);

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "WIP", &[], SHA_A))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DispatchOutcome::NotEntitled {
            reason: NotEntitledReason::Unknown,
            ..
        }
    ));
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_free_plan_skips_private_repositories() {
    let h = harness(UnknownInstallationPolicy::Deny);
    h.dispatcher
        .dispatch("marketplace_purchase.purchased", &purchase("purchased", "FREE"))
        .await
        .unwrap();

    let mut payload = pull_request("opened", "WIP", &[], SHA_A);
    payload["repository"]["private"] = json!(true);
    let outcome = h.dispatcher.dispatch("pull_request.opened", &payload).await.unwrap();

    assert!(matches!(
        outcome,
        DispatchOutcome::NotEntitled {
            reason: NotEntitledReason::PlanExceeded,
            ..
        }
    ));
}

#[tokio::test]
async fn test_redelivery_after_failed_write_reissues_request() {
    let h = entitled_harness().await;
    let payload = pull_request("opened", "WIP: login", &[], SHA_A);
    h.writer.fail_next(StatusWriteError::Rejected {
        status: 502,
        message: "bad gateway".into(),
    });

    let err = h
        .dispatcher
        .dispatch("pull_request.opened", &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::StatusWrite { .. }));
    assert_eq!(err.retry_policy(), RetryPolicy::Retryable { after: None });

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &payload)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::StatusWritten { .. }));
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.writer.writes().len(), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_writes_once() {
    let h = entitled_harness().await;
    let payload = pull_request("opened", "WIP: login", &[], SHA_A);

    for _ in 0..3 {
        h.dispatcher
            .dispatch("pull_request.opened", &payload)
            .await
            .unwrap();
    }

    assert_eq!(h.writer.writes().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_deliveries_write_once() {
    let h = entitled_harness().await;
    *h.writer.delay.lock().unwrap() = Some(Duration::from_millis(20));
    let payload = Arc::new(pull_request("opened", "WIP: login", &[], SHA_A));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = h.dispatcher.clone();
            let payload = payload.clone();
            tokio::spawn(async move { dispatcher.dispatch("pull_request.opened", &payload).await })
        })
        .collect();

    let mut written = 0;
    for task in tasks {
        if let DispatchOutcome::StatusWritten { .. } = task.await.unwrap().unwrap() {
            written += 1;
        }
    }

    assert_eq!(written, 1);
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_events_for_one_commit_land_in_arrival_order() {
    let h = entitled_harness().await;
    let release = h.writer.hold_next();

    let first = {
        let dispatcher = h.dispatcher.clone();
        let payload = pull_request("opened", "WIP login", &[], SHA_A);
        tokio::spawn(async move { dispatcher.dispatch("pull_request.opened", &payload).await })
    };
    while h.writer.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let second = {
        let dispatcher = h.dispatcher.clone();
        let payload = pull_request("edited", "login", &[], SHA_A);
        tokio::spawn(async move { dispatcher.dispatch("pull_request.edited", &payload).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The ready event waits behind the pending write instead of racing it.
    assert_eq!(h.writer.calls.load(Ordering::SeqCst), 1);
    assert!(!second.is_finished());

    release.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let states: Vec<_> = h.writer.writes().iter().map(|w| w.state).collect();
    assert_eq!(states, vec![CommitState::Pending, CommitState::Success]);
    assert_eq!(h.writer.max_in_flight.load(Ordering::SeqCst), 1);

    let third = h
        .dispatcher
        .dispatch("pull_request.edited", &pull_request("edited", "login", &[], SHA_A))
        .await
        .unwrap();
    assert!(matches!(third, DispatchOutcome::StatusUnchanged { .. }));
    assert_eq!(h.writer.writes().last().map(|w| w.state), Some(CommitState::Success));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_write_lets_waiting_event_decide_from_prior_record() {
    let h = entitled_harness().await;
    let release = h.writer.hold_next();
    h.writer.fail_next(StatusWriteError::Timeout);

    let first = {
        let dispatcher = h.dispatcher.clone();
        let payload = pull_request("opened", "WIP login", &[], SHA_A);
        tokio::spawn(async move { dispatcher.dispatch("pull_request.opened", &payload).await })
    };
    while h.writer.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    let second = {
        let dispatcher = h.dispatcher.clone();
        let payload = pull_request("edited", "login", &[], SHA_A);
        tokio::spawn(async move { dispatcher.dispatch("pull_request.edited", &payload).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    release.notify_one();
    assert!(first.await.unwrap().is_err());
    let outcome = second.await.unwrap().unwrap();

    assert!(matches!(outcome, DispatchOutcome::StatusWritten { .. }));
    let states: Vec<_> = h.writer.writes().iter().map(|w| w.state).collect();
    assert_eq!(states, vec![CommitState::Success]);
}

#[tokio::test]
async fn test_expired_record_forces_rewrite() {
    let h = entitled_harness().await;
    let payload = pull_request("opened", "WIP: login", &[], SHA_A);

    h.dispatcher.dispatch("pull_request.opened", &payload).await.unwrap();
    h.clock.advance(Duration::from_secs(3601));
    h.dispatcher.dispatch("pull_request.edited", &payload).await.unwrap();

    assert_eq!(h.writer.writes().len(), 2);
}

#[tokio::test]
async fn test_prune_expired_evicts_old_records() {
    let h = entitled_harness().await;
    h.dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "WIP", &[], SHA_A))
        .await
        .unwrap();
    assert_eq!(h.dispatcher.ledger().len(), 1);

    assert_eq!(h.dispatcher.prune_expired(), 0);
    h.clock.advance(Duration::from_secs(7200));
    assert_eq!(h.dispatcher.prune_expired(), 1);
    assert!(h.dispatcher.ledger().is_empty());
}

#[tokio::test]
async fn test_repository_config_drives_context_and_labels() {
    let h = entitled_harness().await;
    h.configs.set(
        "octo/app",
        RepositoryConfig {
            title_patterns: Some(vec![]),
            wip_labels: Some(vec!["Blocked".into()]),
            status_context: Some("ci/wip".into()),
            title_match: None,
        },
    );

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "WIP: login", &["blocked"], SHA_A))
        .await
        .unwrap();

    let DispatchOutcome::StatusWritten { verdict, request } = outcome else {
        panic!("expected a status write, got {outcome:?}");
    };
    assert_eq!(verdict.matched, MatchedSignal::Label { name: "blocked".into() });
    assert_eq!(request.context.as_str(), "ci/wip");
}

#[tokio::test]
async fn test_invalid_title_pattern_falls_back_to_defaults() {
    let h = entitled_harness().await;
    h.configs.set(
        "octo/app",
        RepositoryConfig {
            title_patterns: Some(vec!["/([/".into()]),
            ..RepositoryConfig::default()
        },
    );

    let outcome = h
        .dispatcher
        .dispatch("pull_request.opened", &pull_request("opened", "WIP: login", &[], SHA_A))
        .await
        .unwrap();

    let DispatchOutcome::StatusWritten { verdict, .. } = outcome else {
        panic!("expected a status write, got {outcome:?}");
    };
    assert_eq!(
        verdict.matched,
        MatchedSignal::TitlePattern {
            pattern: "wip".into()
        }
    );
}

#[tokio::test]
async fn test_purchase_before_installation_is_applied_on_install() {
    let h = harness(UnknownInstallationPolicy::Deny);
    let mut purchase = purchase("purchased", "FLAT_RATE");
    purchase.as_object_mut().unwrap().remove("installation");

    h.dispatcher
        .dispatch("marketplace_purchase.purchased", &purchase)
        .await
        .unwrap();
    assert!(!h.dispatcher.is_entitled(InstallationId::new(INSTALLATION)));

    h.dispatcher
        .dispatch(
            "installation.created",
            &json!({
                "action": "created",
                "installation": { "id": INSTALLATION, "account": { "id": 7 } }
            }),
        )
        .await
        .unwrap();
    assert!(h.dispatcher.is_entitled(InstallationId::new(INSTALLATION)));

    h.dispatcher
        .dispatch(
            "installation.deleted",
            &json!({ "action": "deleted", "installation": { "id": INSTALLATION } }),
        )
        .await
        .unwrap();
    assert!(h.dispatcher.entitlement(InstallationId::new(INSTALLATION)).is_none());
}

#[tokio::test]
async fn test_malformed_pull_request_is_rejected() {
    let h = entitled_harness().await;
    let mut payload = pull_request("opened", "WIP", &[], SHA_A);
    payload["pull_request"].as_object_mut().unwrap().remove("head");

    let err = h
        .dispatcher
        .dispatch("pull_request.opened", &payload)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::MalformedEvent { .. }));
    assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    assert!(h.writer.writes().is_empty());
}
