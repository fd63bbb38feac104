// Durable storage for per-repository sync leases.
//
// The store is the single arbitration point between service instances:
// `save` is a compare-and-swap on `version`, so of two racers that read the
// same row only one write lands. Backends are swappable behind `LockStore`.

pub mod memory;
pub mod postgres;

use std::future::Future;

use repomirror_common::lock::RepoSyncLock;
use repomirror_common::types::Account;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockStoreError {
    /// No row for this repository yet; callers treat it as a first sync.
    #[error("no sync lock recorded for {owner}/{repo_id}")]
    NotFound { owner: String, repo_id: String },

    /// The stored version no longer matches the caller's copy.
    #[error("sync lock for {owner}/{repo_id} was modified concurrently (expected version {expected})")]
    Conflict { owner: String, repo_id: String, expected: i64 },

    #[error("lock store error: {0}")]
    Store(String),
}

impl LockStoreError {
    pub fn not_found(lock_owner: &Account, repo_id: &str) -> Self {
        Self::NotFound { owner: lock_owner.to_string(), repo_id: repo_id.to_string() }
    }

    pub fn conflict(lock: &RepoSyncLock) -> Self {
        Self::Conflict {
            owner: lock.owner.to_string(),
            repo_id: lock.repo_id.clone(),
            expected: lock.version,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for LockStoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.to_string())
    }
}

/// Capability interface over the lease table.
///
/// All methods return `Send` futures so workers can run on a multi-threaded
/// runtime.
pub trait LockStore: Send + Sync + 'static {
    /// Load the lock row for a repository, or `NotFound`.
    fn find(
        &self,
        owner: &Account,
        repo_id: &str,
    ) -> impl Future<Output = Result<RepoSyncLock, LockStoreError>> + Send;

    /// Conditionally write `lock`, using `lock.version` as the expected stored
    /// version (0 = insert a new row). Returns the stored value with its
    /// bumped version, or `Conflict` leaving the row unchanged.
    fn save(
        &self,
        lock: &RepoSyncLock,
    ) -> impl Future<Output = Result<RepoSyncLock, LockStoreError>> + Send;
}
