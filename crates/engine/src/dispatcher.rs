//! Event dispatcher.
//!
//! [`EventDispatcher::dispatch`] is the single entry point for webhook
//! events. It routes each event type through the table in [`crate::events`]
//! and drives the pull-request pipeline:
//!
//! ```text
//! payload ─► snapshot ─► entitlement gate ─► repository config
//!         ─► signal extractor ─► write lane ─► ledger claim ─► status write
//!         ─► commit | rollback
//! ```
//!
//! Marketplace and installation events only update the entitlement gate.
//! Unsupported event types are ignored, never errors.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{EngineSettings, RepositoryConfig};
use crate::entitlement::{
    Authorization, EntitlementChange, EntitlementGate, EntitlementRecord, NotEntitledReason,
};
use crate::events::{self, EventRoute};
use crate::ports::{Clock, CommitStatusWriter, RepositoryConfigSource, SystemClock};
use crate::reconcile::{StatusLedger, StatusWriteRequest};
use crate::signal::{evaluate, SignalConfig, WipVerdict};
use crate::{DispatchError, DispatchId, InstallationId, PullRequestSnapshot, StatusContext};

/// What a successful dispatch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DispatchOutcome {
    /// No handler for this event type or action.
    Ignored { event: String },
    /// The installation may not act on the repository; nothing was written.
    NotEntitled {
        installation: InstallationId,
        reason: NotEntitledReason,
    },
    /// The head commit already carries the desired status.
    StatusUnchanged { verdict: WipVerdict },
    /// A commit status was written.
    StatusWritten {
        verdict: WipVerdict,
        request: StatusWriteRequest,
    },
    /// An entitlement event was applied.
    EntitlementUpdated { change: EntitlementChange },
}

/// Routes webhook events to the engine's components.
///
/// Shared across request handlers behind an [`Arc`]; all mutable state lives
/// in the ledger and the gate, each guarded by its own lock.
pub struct EventDispatcher {
    settings: EngineSettings,
    ledger: StatusLedger,
    gate: EntitlementGate,
    writer: Arc<dyn CommitStatusWriter>,
    configs: Arc<dyn RepositoryConfigSource>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("settings", &self.settings)
            .field("ledger", &self.ledger)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new(
        settings: EngineSettings,
        writer: Arc<dyn CommitStatusWriter>,
        configs: Arc<dyn RepositoryConfigSource>,
    ) -> Self {
        Self {
            ledger: StatusLedger::new(settings.status_ttl),
            gate: EntitlementGate::new(settings.unknown_installations),
            settings,
            writer,
            configs,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the wall clock, for tests that drive TTL expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handles one webhook event.
    ///
    /// `event_type` is `"<event>.<action>"`, or the bare event name when the
    /// action should be read from the payload.
    pub async fn dispatch(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let dispatch_id = DispatchId::new_random();
        let span = info_span!("dispatch", %dispatch_id, event = %event_type);

        async {
            let result = self.route(event_type, payload).await;
            match &result {
                Ok(outcome) => debug!(?outcome, "dispatch finished"),
                Err(err @ DispatchError::MalformedEvent { .. }) => {
                    warn!(error = %err, "dropping malformed event");
                }
                Err(err @ DispatchError::StatusWrite { .. }) => {
                    error!(error = %err, retry = ?err.retry_policy(), "status write failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn route(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(route) = events::route(event_type) else {
            debug!("no handler for event type");
            return Ok(DispatchOutcome::Ignored {
                event: event_type.to_string(),
            });
        };

        match route {
            EventRoute::PullRequest => self.handle_pull_request(event_type, payload).await,
            EventRoute::MarketplacePurchase(action) => {
                let purchase = events::parse_marketplace_purchase(event_type, action, payload)?;
                let change = self.gate.apply_marketplace(&purchase, self.clock.now());
                Ok(DispatchOutcome::EntitlementUpdated { change })
            }
            EventRoute::Installation => {
                let action = events::action_of(event_type, payload).ok_or_else(|| {
                    DispatchError::MalformedEvent {
                        event: event_type.to_string(),
                        reason: "missing action".to_string(),
                    }
                })?;
                let change = events::parse_installation(event_type, action, payload)?;
                let change = self.gate.apply_installation(&change, self.clock.now());
                Ok(DispatchOutcome::EntitlementUpdated { change })
            }
            EventRoute::InstallationRepositories => {
                let change = events::parse_installation_repositories(event_type, payload)?;
                let change = self
                    .gate
                    .apply_installation_repositories(&change, self.clock.now());
                Ok(DispatchOutcome::EntitlementUpdated { change })
            }
        }
    }

    async fn handle_pull_request(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let snapshot = events::parse_pull_request(event_type, payload)?;

        if let Authorization::NotEntitled(reason) =
            self.gate.authorize(snapshot.installation, snapshot.private)
        {
            debug!(
                installation = %snapshot.installation,
                repository = %snapshot.repository,
                ?reason,
                "installation not entitled; dropping event"
            );
            return Ok(DispatchOutcome::NotEntitled {
                installation: snapshot.installation,
                reason,
            });
        }

        let (signals, context) = self.load_config(&snapshot).await;
        let verdict = evaluate(&snapshot, &signals);

        // Held until the claim settles; a later event for this commit
        // re-decides against whatever the earlier write left behind.
        let _lane = self.ledger.lane(&snapshot).await;
        let Some(claim) = self
            .ledger
            .claim(&snapshot, &verdict, &context, self.clock.now())
        else {
            debug!(
                repository = %snapshot.repository,
                sha = snapshot.head_sha.short(),
                is_wip = verdict.is_wip,
                "status already current"
            );
            return Ok(DispatchOutcome::StatusUnchanged { verdict });
        };

        match self.writer.create_or_update_commit_status(&claim.request).await {
            Ok(()) => {
                self.ledger.commit(&claim);
                info!(
                    repository = %claim.request.repository,
                    pull_request = %claim.request.pull_request,
                    sha = claim.request.sha.short(),
                    state = %claim.request.state,
                    "commit status written"
                );
                Ok(DispatchOutcome::StatusWritten {
                    verdict,
                    request: claim.request,
                })
            }
            Err(source) => {
                let restored = self.ledger.rollback(&claim);
                debug!(restored, "status intent rolled back");
                Err(DispatchError::StatusWrite { source })
            }
        }
    }

    /// Reads and compiles the repository's configuration. Unreadable or
    /// invalid configuration degrades to defaults.
    async fn load_config(&self, snapshot: &PullRequestSnapshot) -> (SignalConfig, StatusContext) {
        let config = match self
            .configs
            .read_config(snapshot.installation, &snapshot.repository)
            .await
        {
            Ok(config) => config.unwrap_or_default(),
            Err(err) => {
                warn!(
                    repository = %snapshot.repository,
                    error = %err,
                    "repository config unreadable; using defaults"
                );
                RepositoryConfig::default()
            }
        };

        let (signals, issues) = SignalConfig::from_repository(&config);
        for issue in &issues {
            warn!(
                repository = %snapshot.repository,
                error = %issue,
                "invalid title pattern; using default title patterns"
            );
        }
        let context = config.status_context_or(&self.settings.default_status_context);
        (signals, context)
    }

    /// Whether `installation` may use the bot on its public repositories.
    pub fn is_entitled(&self, installation: InstallationId) -> bool {
        self.gate.is_entitled(installation)
    }

    /// See [`EntitlementGate::authorize`].
    pub fn authorize(
        &self,
        installation: InstallationId,
        repository_private: bool,
    ) -> Authorization {
        self.gate.authorize(installation, repository_private)
    }

    pub fn entitlement(&self, installation: InstallationId) -> Option<EntitlementRecord> {
        self.gate.entitlement(installation)
    }

    pub fn entitlements(&self) -> Vec<EntitlementRecord> {
        self.gate.entitlements()
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    /// Evicts expired status records. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let evicted = self.ledger.prune_expired(self.clock.now());
        if evicted > 0 {
            debug!(evicted, "pruned expired status records");
        }
        evicted
    }
}
