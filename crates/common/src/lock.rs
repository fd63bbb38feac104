// Per-repository sync lease.
//
// One durable row per (owner, repo_id). The row doubles as the repository's
// watermark (`last_commit`) and is never deleted. A lease is active only while
// `status = Running` and `expiry` lies in the future; an expired `Running` row
// counts as free, so a crashed worker cannot wedge a repository forever.
//
// `version` is the optimistic-concurrency token: stores accept a write only if
// the caller's copy still carries the stored version.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Account;

/// Default lease duration (10 hours).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Done,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSyncLock {
    pub owner: Account,
    pub repo_id: String,
    pub status: SyncStatus,
    /// Unix seconds; meaningful only while `status = Running`.
    pub expiry: i64,
    /// 0 means the row has never been persisted.
    pub version: i64,
    /// Last commit recorded as synced. Empty means never synced.
    pub last_commit: String,
}

impl RepoSyncLock {
    /// A fresh, never-persisted lock for a repository seen for the first time.
    pub fn new(owner: Account, repo_id: impl Into<String>) -> Self {
        Self {
            owner,
            repo_id: repo_id.into(),
            status: SyncStatus::Done,
            expiry: 0,
            version: 0,
            last_commit: String::new(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// Claim the lease for syncing up to `commit`.
    ///
    /// Returns `false` and leaves the value untouched when `commit` is
    /// already the recorded watermark.
    pub fn lock(&mut self, commit: &str, ttl: Duration) -> bool {
        self.lock_at(commit, ttl, Utc::now())
    }

    pub fn lock_at(&mut self, commit: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.last_commit == commit {
            return false;
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.status = SyncStatus::Running;
        self.expiry = now.timestamp().saturating_add(ttl_secs).max(1);
        true
    }

    /// Release the lease. An empty `commit` (failed sync) keeps the old
    /// watermark.
    pub fn unlock(&mut self, commit: &str) {
        if !commit.is_empty() {
            self.last_commit = commit.to_string();
        }

        self.status = SyncStatus::Done;
        self.expiry = 0;
    }

    /// Whether another worker currently holds an unexpired lease.
    pub fn is_doing(&self) -> bool {
        self.is_doing_at(Utc::now())
    }

    pub fn is_doing_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Running && self.expiry > now.timestamp()
    }
}
