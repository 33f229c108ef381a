//! Status reconciler: turns a verdict into at most one commit-status write.
//!
//! [`reconcile`] is the pure decision: compare the desired status with the last
//! one this system wrote for the same commit and emit a
//! [`StatusWriteRequest`] only when they differ.
//!
//! [`StatusLedger`] owns the [`StatusRecord`] cache and wraps the decision in
//! a critical section. [`StatusLedger::claim`] reads the prior record, decides,
//! and stores the new intent before returning, so when two events for the same
//! commit race, the second one sees the first one's intent and stands down.
//! The caller then performs the remote write and either
//! [`commits`](StatusLedger::commit) or [`rolls back`](StatusLedger::rollback)
//! the claim.
//!
//! A claim only settles identical intents. Events for one commit with
//! different verdicts are ordered by a [`WriteLane`]: at most one
//! claim-write-settle sequence per commit runs at a time, and each holder
//! claims against the record its predecessor left. Lanes are granted in
//! arrival order, so the newest intent is the last write to reach GitHub.
//!
//! ## Record lifecycle
//!
//! Records are keyed by `(repository, head SHA)` because commit statuses are
//! commit-scoped. A record stops counting when
//!
//! - the pull request's head moves to another SHA (the old record is dropped),
//! - it is older than the ledger's TTL (another tool may have overwritten the
//!   status out of band), or
//! - its write failed and was rolled back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::{
    CommitSha, CommitState, InstallationId, PullRequestNumber, PullRequestSnapshot,
    RepositoryName, StatusContext, Timestamp, WipVerdict,
};

/// Description written while the pull request is a work in progress.
pub const PENDING_DESCRIPTION: &str = "Work in progress";

/// Description written once the pull request is ready.
pub const READY_DESCRIPTION: &str = "Ready for review";

// ---------------------------------------------------------------------------
// Records and requests
// ---------------------------------------------------------------------------

/// The last commit status this system intended for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Intended state.
    pub state: CommitState,
    /// Intended description.
    pub description: String,
    /// Context the status was written under.
    pub context: StatusContext,
    /// When the intent was recorded.
    pub written_at: Timestamp,
    /// `true` once the remote write succeeded.
    pub confirmed: bool,
}

impl StatusRecord {
    /// Whether the record is too old to suppress a write at `now`.
    pub fn is_expired(&self, ttl: Duration, now: Timestamp) -> bool {
        self.written_at.is_older_than(ttl, now)
    }

    fn describes(&self, request: &StatusWriteRequest) -> bool {
        self.state == request.state
            && self.description == request.description
            && self.context == request.context
    }
}

/// One `createOrUpdateCommitStatus` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusWriteRequest {
    /// Installation whose credentials perform the write.
    pub installation: InstallationId,
    /// Repository the commit lives in.
    pub repository: RepositoryName,
    /// Pull request that triggered the write (for logs only).
    pub pull_request: PullRequestNumber,
    /// Commit to annotate.
    pub sha: CommitSha,
    /// Status state.
    pub state: CommitState,
    /// Status description.
    pub description: String,
    /// Status context.
    pub context: StatusContext,
}

/// Maps a verdict to the status that should be on the head commit.
pub fn desired_state(verdict: &WipVerdict) -> (CommitState, &'static str) {
    if verdict.is_wip {
        (CommitState::Pending, PENDING_DESCRIPTION)
    } else {
        (CommitState::Success, READY_DESCRIPTION)
    }
}

/// Decides whether the head commit needs a new status.
///
/// `prior` must be the live record for `(snapshot.repository,
/// snapshot.head_sha)`: callers pass `None` for absent or expired records.
/// Returns `None` when `prior` already describes the desired status.
pub fn reconcile(
    snapshot: &PullRequestSnapshot,
    verdict: &WipVerdict,
    prior: Option<&StatusRecord>,
    context: &StatusContext,
) -> Option<StatusWriteRequest> {
    let (state, description) = desired_state(verdict);
    let request = StatusWriteRequest {
        installation: snapshot.installation,
        repository: snapshot.repository.clone(),
        pull_request: snapshot.number,
        sha: snapshot.head_sha.clone(),
        state,
        description: description.to_string(),
        context: context.clone(),
    };

    match prior {
        Some(record) if record.describes(&request) => None,
        _ => Some(request),
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Cache key of a [`StatusRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusKey {
    /// Repository the commit lives in.
    pub repository: RepositoryName,
    /// The commit.
    pub sha: CommitSha,
}

impl StatusKey {
    fn head_of(snapshot: &PullRequestSnapshot) -> Self {
        Self {
            repository: snapshot.repository.clone(),
            sha: snapshot.head_sha.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PullRequestKey {
    repository: RepositoryName,
    number: PullRequestNumber,
}

#[derive(Debug, Clone)]
struct Entry {
    record: StatusRecord,
    generation: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<StatusKey, Entry>,
    heads: HashMap<PullRequestKey, CommitSha>,
    next_generation: u64,
}

impl LedgerState {
    /// Moves the pull request's head to `sha`, dropping the record of the
    /// previous head.
    fn observe_head(&mut self, snapshot: &PullRequestSnapshot) {
        let key = PullRequestKey {
            repository: snapshot.repository.clone(),
            number: snapshot.number,
        };
        let previous = self.heads.insert(key, snapshot.head_sha.clone());
        if let Some(previous) = previous.filter(|sha| *sha != snapshot.head_sha) {
            debug!(
                repository = %snapshot.repository,
                pull_request = %snapshot.number,
                from = previous.short(),
                to = snapshot.head_sha.short(),
                "head moved; dropping status record of previous head"
            );
            self.records.remove(&StatusKey {
                repository: snapshot.repository.clone(),
                sha: previous,
            });
        }
    }
}

/// The outcome of a successful [`StatusLedger::claim`]: the write to perform
/// and what to restore if it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusClaim {
    /// The write the caller must now perform.
    pub request: StatusWriteRequest,
    key: StatusKey,
    prior: Option<StatusRecord>,
    generation: u64,
}

impl StatusClaim {
    /// The record that was live before this claim, if any.
    pub fn prior(&self) -> Option<&StatusRecord> {
        self.prior.as_ref()
    }
}

type LaneMap = HashMap<StatusKey, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive right to write the status of one commit.
///
/// Obtained from [`StatusLedger::lane`]; dropping it lets the next waiter for
/// the same commit proceed.
#[derive(Debug)]
pub struct WriteLane {
    key: StatusKey,
    guard: Option<OwnedMutexGuard<()>>,
    lanes: Arc<Mutex<LaneMap>>,
}

impl Drop for WriteLane {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map still references an idle lane.
        if lanes
            .get(&self.key)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(&self.key);
        }
    }
}

/// Process-wide cache of the last intended status per `(repository, SHA)`.
///
/// Every operation holds one mutex for its whole read-decide-write step and
/// never across an `.await`, which is what makes [`claim`](Self::claim)
/// atomic with respect to concurrent events.
#[derive(Debug)]
pub struct StatusLedger {
    ttl: Duration,
    state: Mutex<LedgerState>,
    lanes: Arc<Mutex<LaneMap>>,
}

impl StatusLedger {
    /// Creates an empty ledger whose records expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(LedgerState::default()),
            lanes: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // The state is a plain map; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until no other write for `snapshot`'s head commit is in flight.
    ///
    /// Hold the lane across [`claim`](Self::claim), the remote write and
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback).
    pub async fn lane(&self, snapshot: &PullRequestSnapshot) -> WriteLane {
        let key = StatusKey::head_of(snapshot);
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.entry(key.clone()).or_default().clone()
        };
        let guard = lane.lock_owned().await;
        WriteLane {
            key,
            guard: Some(guard),
            lanes: self.lanes.clone(),
        }
    }

    #[cfg(test)]
    fn open_lanes(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The live record for `(repository, sha)` at `now`, if any.
    pub fn record(
        &self,
        repository: &RepositoryName,
        sha: &CommitSha,
        now: Timestamp,
    ) -> Option<StatusRecord> {
        let key = StatusKey {
            repository: repository.clone(),
            sha: sha.clone(),
        };
        self.lock()
            .records
            .get(&key)
            .map(|entry| &entry.record)
            .filter(|record| !record.is_expired(self.ttl, now))
            .cloned()
    }

    /// Decides whether `snapshot`'s head commit needs a status write and, if
    /// it does, records the intent before returning.
    ///
    /// Returns `None` when the live record already matches. A returned claim
    /// must be passed to [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback) once the remote write finishes.
    pub fn claim(
        &self,
        snapshot: &PullRequestSnapshot,
        verdict: &WipVerdict,
        context: &StatusContext,
        now: Timestamp,
    ) -> Option<StatusClaim> {
        let mut state = self.lock();
        state.observe_head(snapshot);

        let key = StatusKey::head_of(snapshot);
        let prior = state
            .records
            .get(&key)
            .map(|entry| entry.record.clone())
            .filter(|record| !record.is_expired(self.ttl, now));

        let request = reconcile(snapshot, verdict, prior.as_ref(), context)?;

        state.next_generation += 1;
        let generation = state.next_generation;
        state.records.insert(
            key.clone(),
            Entry {
                record: StatusRecord {
                    state: request.state,
                    description: request.description.clone(),
                    context: request.context.clone(),
                    written_at: now,
                    confirmed: false,
                },
                generation,
            },
        );

        Some(StatusClaim {
            request,
            key,
            prior,
            generation,
        })
    }

    /// Marks the claimed record as confirmed by the remote side.
    ///
    /// A no-op when a newer claim has replaced the record in the meantime.
    pub fn commit(&self, claim: &StatusClaim) {
        let mut state = self.lock();
        if let Some(entry) = state.records.get_mut(&claim.key) {
            if entry.generation == claim.generation {
                entry.record.confirmed = true;
            }
        }
    }

    /// Restores the record that was live before `claim`.
    ///
    /// Returns `false` (and changes nothing) when a newer claim has replaced
    /// the record, so a late failure never clobbers a newer intent.
    pub fn rollback(&self, claim: &StatusClaim) -> bool {
        let mut state = self.lock();
        let current = state.records.get(&claim.key).map(|entry| entry.generation);
        if current != Some(claim.generation) {
            return false;
        }

        match &claim.prior {
            Some(prior) => {
                state.next_generation += 1;
                let generation = state.next_generation;
                state.records.insert(
                    claim.key.clone(),
                    Entry {
                        record: prior.clone(),
                        generation,
                    },
                );
            }
            None => {
                state.records.remove(&claim.key);
            }
        }
        true
    }

    /// Evicts expired records, and head bookkeeping for commits that no longer
    /// have a record. Returns the number of records evicted.
    pub fn prune_expired(&self, now: Timestamp) -> usize {
        let mut state = self.lock();
        let before = state.records.len();
        let ttl = self.ttl;
        state
            .records
            .retain(|_, entry| !entry.record.is_expired(ttl, now));
        let evicted = before - state.records.len();

        let LedgerState { records, heads, .. } = &mut *state;
        heads.retain(|pr, sha| {
            records.contains_key(&StatusKey {
                repository: pr.repository.clone(),
                sha: sha.clone(),
            })
        });
        evicted
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
