//! Port traits for the engine's remote effects.
//!
//! The engine never talks to GitHub directly. Infrastructure crates implement
//! these traits; tests substitute in-memory fakes and a controllable
//! [`Clock`].

use async_trait::async_trait;

use crate::config::RepositoryConfig;
use crate::reconcile::StatusWriteRequest;
use crate::{ConfigReadError, InstallationId, RepositoryName, StatusWriteError, Timestamp};

/// Writes commit statuses.
#[async_trait]
pub trait CommitStatusWriter: Send + Sync {
    /// Creates the status described by `request`, replacing any existing
    /// status with the same context on the same commit.
    ///
    /// Implementations must not retry internally; the failure classification
    /// is what lets the dispatcher roll back and the transport ask for
    /// re-delivery.
    async fn create_or_update_commit_status(
        &self,
        request: &StatusWriteRequest,
    ) -> Result<(), StatusWriteError>;
}

/// Reads per-repository configuration.
#[async_trait]
pub trait RepositoryConfigSource: Send + Sync {
    /// Returns `Ok(None)` when the repository has no configuration file.
    async fn read_config(
        &self,
        installation: InstallationId,
        repository: &RepositoryName,
    ) -> Result<Option<RepositoryConfig>, ConfigReadError>;
}

/// A config source for deployments that never read repository files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepositoryConfig;

#[async_trait]
impl RepositoryConfigSource for NoRepositoryConfig {
    async fn read_config(
        &self,
        _installation: InstallationId,
        _repository: &RepositoryName,
    ) -> Result<Option<RepositoryConfig>, ConfigReadError> {
        Ok(None)
    }
}

/// Source of the current time for TTL and entitlement bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
