//! Decision and reconciliation domain for WipGuard.
//!
//! WipGuard marks pull requests as work-in-progress by keeping a commit status
//! on their head commit. This crate decides *whether* a pull request is WIP,
//! *whether* a status write is needed, and *whether* the installation may use
//! the bot at all. Infrastructure crates implement the traits in [`ports`];
//! they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no network I/O.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`InstallationId`, `CommitSha`, etc.) |
//! | [`types`] | Shared value types (`PullRequestSnapshot`, `CommitState`, `Timestamp`) |
//! | [`errors`] | Error enums and the retry-policy classification |
//! | [`config`] | Per-repository config and process-wide engine settings |
//! | [`signal`] | WIP signal extraction from titles and labels |
//! | [`reconcile`] | Status reconciliation and the status ledger |
//! | [`entitlement`] | Marketplace/installation entitlement gate |
//! | [`events`] | Dispatch table and webhook payload parsing |
//! | [`ports`] | Traits implemented by infrastructure crates |
//! | [`dispatcher`] | The event dispatcher tying it all together |

pub mod config;
pub mod dispatcher;
pub mod entitlement;
pub mod errors;
pub mod events;
pub mod identifiers;
pub mod ports;
pub mod reconcile;
pub mod signal;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{EngineSettings, RepositoryConfig, TitleMatchMode, UnknownInstallationPolicy};
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use entitlement::{
    Authorization, EntitlementChange, EntitlementGate, EntitlementRecord, EntitlementStatus,
    MarketplacePlan, NotEntitledReason, RepositorySelection,
};
pub use errors::{ConfigReadError, DispatchError, PatternError, RetryPolicy, StatusWriteError};
pub use identifiers::{
    AccountId, CommitSha, DispatchId, InstallationId, PullRequestNumber, RepositoryName,
    StatusContext,
};
pub use ports::{Clock, CommitStatusWriter, NoRepositoryConfig, RepositoryConfigSource, SystemClock};
pub use reconcile::{StatusClaim, StatusLedger, StatusRecord, StatusWriteRequest, WriteLane};
pub use signal::{evaluate, MatchedSignal, SignalConfig, TitlePattern, WipVerdict};
pub use types::{CommitState, PullRequestSnapshot, Timestamp};
