//! Shared value types for the WipGuard domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! the per-event facts the engine decides on: the commit-status state model,
//! wall-clock time, and the pull request snapshot built from each event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommitSha, InstallationId, PullRequestNumber, RepositoryName};

// ---------------------------------------------------------------------------
// Commit status state
// ---------------------------------------------------------------------------

/// The commit-status states this system writes.
///
/// GitHub also knows `error` and `failure`; WipGuard never produces them. The
/// "unset" state of the data model is the absence of a
/// [`crate::StatusRecord`], not a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// The pull request is a work in progress; merge gating should block.
    Pending,
    /// The pull request is ready for review.
    Success,
}

impl CommitState {
    /// The value sent in the `state` field of the REST API.
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
        }
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly. Every time-dependent engine operation takes `now` as an argument
/// so tests can drive expiry deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns this timestamp moved forward by `by`, saturating on overflow.
    pub fn plus(self, by: Duration) -> Self {
        chrono::Duration::from_std(by)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(self)
    }

    /// Returns `true` when more than `age` has passed between `self` and `now`.
    ///
    /// An `age` too large to represent never elapses.
    pub fn is_older_than(self, age: Duration, now: Timestamp) -> bool {
        match chrono::Duration::from_std(age) {
            Ok(age) => now.0.signed_duration_since(self.0) > age,
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Pull request snapshot
// ---------------------------------------------------------------------------

/// Everything the engine knows about a pull request at the moment one event
/// arrived.
///
/// Built from each `pull_request` webhook payload and never mutated; the next
/// event for the same pull request produces a fresh snapshot that supersedes
/// this one. The last status written for the head commit is not part of the
/// snapshot: it lives in the [`crate::StatusLedger`], keyed by
/// `(repository, head_sha)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    /// Installation the event was delivered for.
    pub installation: InstallationId,

    /// Repository the pull request belongs to.
    pub repository: RepositoryName,

    /// Whether the repository is private. Free marketplace plans and the
    /// open-source tier only cover public repositories.
    pub private: bool,

    /// Pull request number within `repository`.
    pub number: PullRequestNumber,

    /// Head commit the status is attached to.
    pub head_sha: CommitSha,

    /// Pull request title. May be empty.
    pub title: String,

    /// Label names in payload order, duplicates removed.
    pub labels: Vec<String>,
}

impl PullRequestSnapshot {
    /// Replaces the label list, keeping first occurrences in order.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for label in labels {
            let label = label.into();
            if !unique.contains(&label) {
                unique.push(label);
            }
        }
        self.labels = unique;
        self
    }
}
