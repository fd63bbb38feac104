// In-process lock store with the same compare-and-swap semantics as the
// Postgres backend. Backs tests and single-instance deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use repomirror_common::lock::RepoSyncLock;
use repomirror_common::types::Account;

use super::{LockStore, LockStoreError};

type LockKey = (String, String);

#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    rows: Arc<Mutex<HashMap<LockKey, RepoSyncLock>>>,
    writes: Arc<Mutex<u64>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing version checks.
    pub fn insert(&self, lock: RepoSyncLock) {
        let key = (lock.owner.to_string(), lock.repo_id.clone());
        self.lock_rows().insert(key, lock);
    }

    /// Current stored value, if any.
    pub fn get(&self, owner: &Account, repo_id: &str) -> Option<RepoSyncLock> {
        self.lock_rows().get(&(owner.to_string(), repo_id.to_string())).cloned()
    }

    /// Number of successful `save` calls so far.
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, RepoSyncLock>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockStore for MemoryLockStore {
    async fn find(&self, owner: &Account, repo_id: &str) -> Result<RepoSyncLock, LockStoreError> {
        self.get(owner, repo_id).ok_or_else(|| LockStoreError::not_found(owner, repo_id))
    }

    async fn save(&self, lock: &RepoSyncLock) -> Result<RepoSyncLock, LockStoreError> {
        let key = (lock.owner.to_string(), lock.repo_id.clone());
        let mut rows = self.lock_rows();

        let stored_version = rows.get(&key).map(|row| row.version).unwrap_or(0);
        if stored_version != lock.version {
            return Err(LockStoreError::conflict(lock));
        }

        let mut updated = lock.clone();
        updated.version = lock.version + 1;
        rows.insert(key, updated.clone());
        drop(rows);

        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(updated)
    }
}
