//! Webhook event types and payload parsing.
//!
//! An event type is a `"<event>.<action>"` string such as
//! `"pull_request.labeled"`. [`route`] maps it through the dispatch table to an
//! [`EventRoute`]; the `parse_*` functions turn the JSON payload into the
//! domain values the engine works with. Only the fields the engine needs are
//! read; a required field that is missing produces
//! [`DispatchError::MalformedEvent`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entitlement::{MarketplacePlan, RepositorySelection};
use crate::{
    AccountId, CommitSha, DispatchError, InstallationId, PullRequestNumber, PullRequestSnapshot,
    RepositoryName,
};

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

/// Which handler an event type is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    /// A pull request change that can affect the WIP verdict.
    PullRequest,
    /// A marketplace plan change: `purchased`, `changed` or `cancelled`.
    MarketplacePurchase(MarketplaceAction),
    /// Installation lifecycle.
    Installation,
    /// Repositories added to or removed from an installation.
    InstallationRepositories,
}

/// Marketplace actions the entitlement gate reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketplaceAction {
    /// A plan was bought.
    Purchased,
    /// A plan was upgraded or downgraded.
    Changed,
    /// A plan was cancelled.
    Cancelled,
}

/// Event types with an exact route. `installation` and
/// `installation_repositories` are routed for every action (see [`route`]).
const ROUTES: &[(&str, EventRoute)] = &[
    ("pull_request.opened", EventRoute::PullRequest),
    ("pull_request.edited", EventRoute::PullRequest),
    ("pull_request.labeled", EventRoute::PullRequest),
    ("pull_request.unlabeled", EventRoute::PullRequest),
    ("pull_request.synchronize", EventRoute::PullRequest),
    (
        "marketplace_purchase.purchased",
        EventRoute::MarketplacePurchase(MarketplaceAction::Purchased),
    ),
    (
        "marketplace_purchase.changed",
        EventRoute::MarketplacePurchase(MarketplaceAction::Changed),
    ),
    (
        "marketplace_purchase.cancelled",
        EventRoute::MarketplacePurchase(MarketplaceAction::Cancelled),
    ),
    ("installation", EventRoute::Installation),
    ("installation_repositories", EventRoute::InstallationRepositories),
];

/// Looks up the handler for `event_type`.
///
/// The full `"<event>.<action>"` string is tried first, then the bare event
/// name. Returns `None` for anything the engine does not handle.
pub fn route(event_type: &str) -> Option<EventRoute> {
    let lookup = |key: &str| {
        ROUTES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, route)| *route)
    };
    lookup(event_type).or_else(|| {
        let (name, _action) = event_type.split_once('.')?;
        lookup(name)
    })
}

/// The action part of `event_type`, falling back to the payload's `action`.
pub fn action_of<'a>(event_type: &'a str, payload: &'a Value) -> Option<&'a str> {
    event_type
        .split_once('.')
        .map(|(_, action)| action)
        .or_else(|| payload.get("action").and_then(Value::as_str))
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// A parsed `marketplace_purchase` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplacePurchase {
    /// What happened to the plan.
    pub action: MarketplaceAction,
    /// The purchasing account.
    pub account: AccountId,
    /// The installation, when the payload names one.
    pub installation: Option<InstallationId>,
    /// The plan after the change.
    pub plan: Option<MarketplacePlan>,
}

/// Installation lifecycle actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationAction {
    /// The app was installed.
    Created,
    /// The app was uninstalled.
    Deleted,
    /// The account owner suspended the installation.
    Suspend,
    /// The account owner lifted the suspension.
    Unsuspend,
    /// Any other action; the gate ignores it.
    Other(String),
}

impl InstallationAction {
    fn parse(action: &str) -> Self {
        match action {
            "created" => Self::Created,
            "deleted" => Self::Deleted,
            "suspend" => Self::Suspend,
            "unsuspend" => Self::Unsuspend,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A parsed `installation` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationChange {
    /// Lifecycle action.
    pub action: InstallationAction,
    /// The installation.
    pub installation: InstallationId,
    /// The account the app is installed on.
    pub account: Option<AccountId>,
    /// Repositories the installation covers.
    pub repositories: RepositorySelection,
}

/// A parsed `installation_repositories` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoriesChange {
    /// The installation.
    pub installation: InstallationId,
    /// The account the app is installed on.
    pub account: Option<AccountId>,
    /// `true` when the installation now covers every repository.
    pub all_repositories: bool,
    /// Repositories added to the selection.
    pub added: Vec<RepositoryName>,
    /// Repositories removed from the selection.
    pub removed: Vec<RepositoryName>,
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InstallationRef {
    id: u64,
    #[serde(default)]
    account: Option<AccountRef>,
    #[serde(default)]
    repository_selection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: String,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct RepositoryNameRef {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct LabelRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HeadRef {
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    number: Option<u64>,
    title: Option<String>,
    #[serde(default)]
    labels: Vec<LabelRef>,
    head: Option<HeadRef>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    installation: Option<InstallationRef>,
    repository: Option<RepositoryRef>,
    pull_request: Option<PullRequestBody>,
}

#[derive(Debug, Deserialize)]
struct PlanRef {
    id: u64,
    name: String,
    #[serde(default)]
    price_model: String,
}

#[derive(Debug, Deserialize)]
struct MarketplacePurchaseBody {
    account: Option<AccountRef>,
    plan: Option<PlanRef>,
}

#[derive(Debug, Deserialize)]
struct MarketplacePayload {
    marketplace_purchase: Option<MarketplacePurchaseBody>,
    installation: Option<InstallationRef>,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    installation: Option<InstallationRef>,
    #[serde(default)]
    repositories: Option<Vec<RepositoryNameRef>>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositoriesPayload {
    installation: Option<InstallationRef>,
    repository_selection: Option<String>,
    #[serde(default)]
    repositories_added: Vec<RepositoryNameRef>,
    #[serde(default)]
    repositories_removed: Vec<RepositoryNameRef>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn malformed(event: &str, reason: impl Into<String>) -> DispatchError {
    DispatchError::MalformedEvent {
        event: event.to_string(),
        reason: reason.into(),
    }
}

fn deserialize<'a, T: Deserialize<'a>>(
    event: &str,
    payload: &'a Value,
) -> Result<T, DispatchError> {
    T::deserialize(payload).map_err(|e| malformed(event, e.to_string()))
}

fn require<T>(event: &str, value: Option<T>, field: &str) -> Result<T, DispatchError> {
    value.ok_or_else(|| malformed(event, format!("missing {field}")))
}

fn repository_names(refs: Vec<RepositoryNameRef>) -> Vec<RepositoryName> {
    refs.into_iter()
        .filter_map(|r| RepositoryName::new(r.full_name))
        .collect()
}

/// Builds a [`PullRequestSnapshot`] from a `pull_request` payload.
pub fn parse_pull_request(
    event: &str,
    payload: &Value,
) -> Result<PullRequestSnapshot, DispatchError> {
    let body: PullRequestPayload = deserialize(event, payload)?;

    let installation = require(event, body.installation, "installation")?;
    let repository = require(event, body.repository, "repository")?;
    let pull_request = require(event, body.pull_request, "pull_request")?;

    let repository_name = require(
        event,
        RepositoryName::new(repository.full_name),
        "repository.full_name",
    )?;
    let number = require(event, pull_request.number, "pull_request.number")?;
    let title = require(event, pull_request.title, "pull_request.title")?;
    let head_sha = require(
        event,
        pull_request
            .head
            .and_then(|head| head.sha)
            .and_then(CommitSha::new),
        "pull_request.head.sha",
    )?;

    Ok(PullRequestSnapshot {
        installation: InstallationId::new(installation.id),
        repository: repository_name,
        private: repository.private,
        number: PullRequestNumber::new(number),
        head_sha,
        title,
        labels: Vec::new(),
    }
    .with_labels(pull_request.labels.into_iter().map(|l| l.name)))
}

/// Parses a `marketplace_purchase` payload.
pub fn parse_marketplace_purchase(
    event: &str,
    action: MarketplaceAction,
    payload: &Value,
) -> Result<MarketplacePurchase, DispatchError> {
    let body: MarketplacePayload = deserialize(event, payload)?;
    let purchase = require(event, body.marketplace_purchase, "marketplace_purchase")?;
    let account = require(event, purchase.account, "marketplace_purchase.account")?;

    Ok(MarketplacePurchase {
        action,
        account: AccountId::new(account.id),
        installation: body.installation.map(|i| InstallationId::new(i.id)),
        plan: purchase.plan.map(|plan| MarketplacePlan {
            id: plan.id,
            name: plan.name,
            price_model: plan.price_model,
        }),
    })
}

/// Parses an `installation` payload. `action` is the event's action.
pub fn parse_installation(
    event: &str,
    action: &str,
    payload: &Value,
) -> Result<InstallationChange, DispatchError> {
    let body: InstallationPayload = deserialize(event, payload)?;
    let installation = require(event, body.installation, "installation")?;

    let repositories = match (installation.repository_selection.as_deref(), body.repositories) {
        (Some("selected"), Some(repos)) => {
            RepositorySelection::Selected(repository_names(repos).into_iter().collect())
        }
        (Some("selected"), None) => RepositorySelection::Selected(BTreeSet::new()),
        _ => RepositorySelection::All,
    };

    Ok(InstallationChange {
        action: InstallationAction::parse(action),
        installation: InstallationId::new(installation.id),
        account: installation.account.map(|a| AccountId::new(a.id)),
        repositories,
    })
}

/// Parses an `installation_repositories` payload.
pub fn parse_installation_repositories(
    event: &str,
    payload: &Value,
) -> Result<RepositoriesChange, DispatchError> {
    let body: InstallationRepositoriesPayload = deserialize(event, payload)?;
    let installation = require(event, body.installation, "installation")?;
    let selection = body
        .repository_selection
        .or(installation.repository_selection)
        .unwrap_or_else(|| "selected".to_string());

    Ok(RepositoriesChange {
        installation: InstallationId::new(installation.id),
        account: installation.account.map(|a| AccountId::new(a.id)),
        all_repositories: selection == "all",
        added: repository_names(body.repositories_added),
        removed: repository_names(body.repositories_removed),
    })
}
