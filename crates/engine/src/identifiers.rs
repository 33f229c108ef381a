//! Newtype domain identifiers.
//!
//! Every GitHub entity the engine keys state on is a distinct newtype wrapping a
//! primitive, so an [`InstallationId`] cannot be passed where an [`AccountId`]
//! is expected even though both are `u64` under the hood. The entitlement gate
//! indexes by both.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes (GitHub-assigned integers).
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: GitHub-integer-backed
// ---------------------------------------------------------------------------

u64_id! {
    /// Identifies a GitHub App installation: the binding between the app and a
    /// set of repositories under one account.
    InstallationId
}

u64_id! {
    /// Identifies the GitHub user or organisation account an installation or
    /// marketplace purchase belongs to.
    ///
    /// Marketplace events name the account, never the installation.
    AccountId
}

u64_id! {
    /// A pull request number, unique within its repository.
    PullRequestNumber
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single pass through the event dispatcher.
///
/// Generated fresh for every dispatched event; recorded on the dispatch span
/// so all log lines from one webhook delivery can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(Uuid);

impl DispatchId {
    /// Generates a new random dispatch identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a GitHub repository in `"owner/repo"` format.
    RepositoryName
}

impl RepositoryName {
    /// Splits the full name into `(owner, repo)`.
    ///
    /// Returns `None` when the name does not contain exactly one `/` with
    /// non-empty halves.
    pub fn split(&self) -> Option<(&str, &str)> {
        match self.0.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Some((owner, repo))
            }
            _ => None,
        }
    }
}

string_id! {
    /// A Git commit SHA (40-character lowercase hex string).
    CommitSha
}

impl CommitSha {
    /// The abbreviated (7 character) form used in log lines.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

string_id! {
    /// The `context` label of a commit status, e.g. `"WIP"`.
    ///
    /// GitHub keeps one status per (commit, context); writing the same context
    /// again replaces the previous value.
    StatusContext
}

impl Default for StatusContext {
    fn default() -> Self {
        Self(crate::config::DEFAULT_STATUS_CONTEXT.to_string())
    }
}
