//! Entitlement gate.
//!
//! Tracks which installations may use the bot. The store is fed by
//! marketplace and installation events and queried before any repository
//! config is read or any status is written.
//!
//! Marketplace events name the purchasing *account*; installations are
//! learned from `installation` events. The gate keeps an account index to
//! route purchases to installations, and holds purchases for accounts that
//! have not installed the app yet until the installation arrives.
//!
//! Reads vastly outnumber writes, so the store sits behind a [`RwLock`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::UnknownInstallationPolicy;
use crate::events::{
    InstallationAction, InstallationChange, MarketplaceAction, MarketplacePurchase,
    RepositoriesChange,
};
use crate::{AccountId, InstallationId, RepositoryName, Timestamp};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Billing status of an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// A plan is in force.
    Active,
    /// The plan was cancelled.
    Suspended,
    /// No marketplace event has been seen for this installation.
    Unknown,
}

/// A marketplace listing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplacePlan {
    /// Marketplace plan id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// `FREE`, `FLAT_RATE` or `PER_UNIT`.
    pub price_model: String,
}

impl MarketplacePlan {
    /// Free plans cover public repositories only.
    pub fn is_free(&self) -> bool {
        self.price_model.eq_ignore_ascii_case("FREE")
    }
}

/// Repositories an installation covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "selection", content = "repositories", rename_all = "snake_case")]
pub enum RepositorySelection {
    /// Every repository of the account.
    #[default]
    All,
    /// Only the listed repositories.
    Selected(BTreeSet<RepositoryName>),
}

impl RepositorySelection {
    fn apply(&mut self, change: &RepositoriesChange) {
        if change.all_repositories {
            *self = Self::All;
            return;
        }
        let mut selected = match std::mem::take(self) {
            Self::Selected(repos) => repos,
            Self::All => BTreeSet::new(),
        };
        selected.extend(change.added.iter().cloned());
        for removed in &change.removed {
            selected.remove(removed);
        }
        *self = Self::Selected(selected);
    }
}

/// Everything the gate knows about one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub installation: InstallationId,
    pub account: Option<AccountId>,
    pub status: EntitlementStatus,
    pub plan: Option<MarketplacePlan>,
    pub repositories: RepositorySelection,
    /// Set while the account owner has suspended the installation.
    pub owner_suspended: bool,
    pub updated_at: Timestamp,
}

impl EntitlementRecord {
    fn unknown(installation: InstallationId, now: Timestamp) -> Self {
        Self {
            installation,
            account: None,
            status: EntitlementStatus::Unknown,
            plan: None,
            repositories: RepositorySelection::All,
            owner_suspended: false,
            updated_at: now,
        }
    }
}

/// Why an installation may not use the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotEntitledReason {
    /// The marketplace plan was cancelled.
    Suspended,
    /// No entitlement is known and policy denies unknown installations.
    Unknown,
    /// The plan does not cover private repositories.
    PlanExceeded,
    /// The account owner suspended the installation.
    OwnerSuspended,
}

/// Result of [`EntitlementGate::authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authorization", content = "reason", rename_all = "kebab-case")]
pub enum Authorization {
    Entitled,
    NotEntitled(NotEntitledReason),
}

impl Authorization {
    pub fn is_entitled(self) -> bool {
        matches!(self, Self::Entitled)
    }
}

/// What an entitlement event did to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum EntitlementChange {
    /// The installation's record was created or replaced.
    Updated { record: EntitlementRecord },
    /// The installation's record was deleted.
    Removed { installation: InstallationId },
    /// The purchase was held until the account installs the app.
    Deferred { account: AccountId },
    /// The event carried nothing the gate tracks.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingPurchase {
    status: EntitlementStatus,
    plan: Option<MarketplacePlan>,
}

#[derive(Debug, Default)]
struct GateState {
    records: HashMap<InstallationId, EntitlementRecord>,
    accounts: HashMap<AccountId, InstallationId>,
    pending: HashMap<AccountId, PendingPurchase>,
}

impl GateState {
    fn entry(&mut self, installation: InstallationId, now: Timestamp) -> &mut EntitlementRecord {
        self.records
            .entry(installation)
            .or_insert_with(|| EntitlementRecord::unknown(installation, now))
    }

    fn link_account(&mut self, installation: InstallationId, account: AccountId, now: Timestamp) {
        self.accounts.insert(account, installation);
        let pending = self.pending.remove(&account);
        let record = self.entry(installation, now);
        record.account = Some(account);
        if let Some(purchase) = pending {
            debug!(%installation, %account, "applying held marketplace purchase");
            record.status = purchase.status;
            record.plan = purchase.plan;
        }
    }

    fn remove(&mut self, installation: InstallationId) -> Option<EntitlementRecord> {
        let record = self.records.remove(&installation)?;
        self.accounts.retain(|_, linked| *linked != installation);
        Some(record)
    }
}

/// In-memory entitlement store.
#[derive(Debug)]
pub struct EntitlementGate {
    policy: UnknownInstallationPolicy,
    state: RwLock<GateState>,
}

impl Default for EntitlementGate {
    fn default() -> Self {
        Self::new(UnknownInstallationPolicy::default())
    }
}

impl EntitlementGate {
    pub fn new(policy: UnknownInstallationPolicy) -> Self {
        Self {
            policy,
            state: RwLock::new(GateState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GateState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GateState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `installation` may use the bot on at least its public
    /// repositories.
    pub fn is_entitled(&self, installation: InstallationId) -> bool {
        self.authorize(installation, false).is_entitled()
    }

    /// Decides whether `installation` may act on a repository.
    ///
    /// Owner suspension wins over everything; then the billing status and,
    /// for active free plans, the repository's visibility. Installations
    /// with no record or an `Unknown` status follow the configured policy.
    pub fn authorize(
        &self,
        installation: InstallationId,
        repository_private: bool,
    ) -> Authorization {
        let state = self.read();
        let Some(record) = state.records.get(&installation) else {
            return self.unknown(repository_private);
        };

        if record.owner_suspended {
            return Authorization::NotEntitled(NotEntitledReason::OwnerSuspended);
        }
        match record.status {
            EntitlementStatus::Active => {
                let free = record.plan.as_ref().is_some_and(MarketplacePlan::is_free);
                if repository_private && free {
                    Authorization::NotEntitled(NotEntitledReason::PlanExceeded)
                } else {
                    Authorization::Entitled
                }
            }
            EntitlementStatus::Suspended => {
                Authorization::NotEntitled(NotEntitledReason::Suspended)
            }
            EntitlementStatus::Unknown => self.unknown(repository_private),
        }
    }

    fn unknown(&self, repository_private: bool) -> Authorization {
        match self.policy {
            UnknownInstallationPolicy::All => Authorization::Entitled,
            UnknownInstallationPolicy::Public if !repository_private => Authorization::Entitled,
            UnknownInstallationPolicy::Public | UnknownInstallationPolicy::Deny => {
                Authorization::NotEntitled(NotEntitledReason::Unknown)
            }
        }
    }

    /// Sets the billing status and plan of `installation`, keeping what is
    /// known about its account and repositories.
    pub fn record_entitlement(
        &self,
        installation: InstallationId,
        status: EntitlementStatus,
        plan: Option<MarketplacePlan>,
        now: Timestamp,
    ) -> EntitlementRecord {
        let mut state = self.write();
        let record = state.entry(installation, now);
        record.status = status;
        record.plan = plan;
        record.updated_at = now;
        record.clone()
    }

    /// Forgets `installation` entirely. Returns the removed record.
    pub fn revoke(&self, installation: InstallationId) -> Option<EntitlementRecord> {
        self.write().remove(installation)
    }

    /// Applies a `marketplace_purchase` event.
    pub fn apply_marketplace(
        &self,
        purchase: &MarketplacePurchase,
        now: Timestamp,
    ) -> EntitlementChange {
        let status = match purchase.action {
            MarketplaceAction::Purchased | MarketplaceAction::Changed => EntitlementStatus::Active,
            MarketplaceAction::Cancelled => EntitlementStatus::Suspended,
        };

        let mut state = self.write();
        let installation = purchase
            .installation
            .or_else(|| state.accounts.get(&purchase.account).copied());

        let Some(installation) = installation else {
            info!(
                account = %purchase.account,
                ?status,
                "holding marketplace purchase until the account installs the app"
            );
            state.pending.insert(
                purchase.account,
                PendingPurchase {
                    status,
                    plan: purchase.plan.clone(),
                },
            );
            return EntitlementChange::Deferred {
                account: purchase.account,
            };
        };

        state.accounts.insert(purchase.account, installation);
        let record = state.entry(installation, now);
        record.account = Some(purchase.account);
        record.status = status;
        record.plan = purchase.plan.clone();
        record.updated_at = now;
        info!(%installation, ?status, "entitlement updated from marketplace");
        EntitlementChange::Updated {
            record: record.clone(),
        }
    }

    /// Applies an `installation` event.
    pub fn apply_installation(
        &self,
        change: &InstallationChange,
        now: Timestamp,
    ) -> EntitlementChange {
        let installation = change.installation;
        let mut state = self.write();

        match &change.action {
            InstallationAction::Created => {
                if let Some(account) = change.account {
                    state.link_account(installation, account, now);
                }
                let record = state.entry(installation, now);
                record.repositories = change.repositories.clone();
                record.updated_at = now;
                EntitlementChange::Updated {
                    record: record.clone(),
                }
            }
            InstallationAction::Deleted => match state.remove(installation) {
                Some(_) => EntitlementChange::Removed { installation },
                None => EntitlementChange::Unchanged,
            },
            InstallationAction::Suspend | InstallationAction::Unsuspend => {
                let record = state.entry(installation, now);
                record.owner_suspended = change.action == InstallationAction::Suspend;
                record.updated_at = now;
                EntitlementChange::Updated {
                    record: record.clone(),
                }
            }
            InstallationAction::Other(action) => {
                debug!(%installation, %action, "installation action has no entitlement effect");
                EntitlementChange::Unchanged
            }
        }
    }

    /// Applies an `installation_repositories` event.
    pub fn apply_installation_repositories(
        &self,
        change: &RepositoriesChange,
        now: Timestamp,
    ) -> EntitlementChange {
        let mut state = self.write();
        if let Some(account) = change.account {
            state.link_account(change.installation, account, now);
        }
        let record = state.entry(change.installation, now);
        record.repositories.apply(change);
        record.updated_at = now;
        EntitlementChange::Updated {
            record: record.clone(),
        }
    }

    /// The record for `installation`, if any.
    pub fn entitlement(&self, installation: InstallationId) -> Option<EntitlementRecord> {
        self.read().records.get(&installation).cloned()
    }

    /// Every record, ordered by installation id.
    pub fn entitlements(&self) -> Vec<EntitlementRecord> {
        let mut records: Vec<_> = self.read().records.values().cloned().collect();
        records.sort_by_key(|r| r.installation);
        records
    }
}
