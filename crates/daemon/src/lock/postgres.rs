// Postgres-backed lock store.
//
// One row per (owner, repo_id) in `repo_sync_locks`. Inserts race through
// `ON CONFLICT DO NOTHING`; updates only match while `version` is unchanged.
// Either way an empty `RETURNING` means another instance won.

use repomirror_common::lock::{RepoSyncLock, SyncStatus};
use repomirror_common::types::Account;
use sqlx::PgPool;

use super::{LockStore, LockStoreError};

type LockRow = (String, String, String, i64, i64, String);

#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, lock: &RepoSyncLock) -> Result<Option<LockRow>, LockStoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
INSERT INTO repo_sync_locks (owner, repo_id, status, expiry, version, last_commit)
VALUES ($1, $2, $3, $4, 1, $5)
ON CONFLICT (owner, repo_id) DO NOTHING
RETURNING owner, repo_id, status, expiry, version, last_commit
            "#,
        )
        .bind(lock.owner.as_str())
        .bind(&lock.repo_id)
        .bind(lock.status.as_str())
        .bind(lock.expiry)
        .bind(&lock.last_commit)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update(&self, lock: &RepoSyncLock) -> Result<Option<LockRow>, LockStoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
UPDATE repo_sync_locks
SET status = $3,
    expiry = $4,
    last_commit = $5,
    version = version + 1,
    updated_at = now()
WHERE owner = $1
  AND repo_id = $2
  AND version = $6
RETURNING owner, repo_id, status, expiry, version, last_commit
            "#,
        )
        .bind(lock.owner.as_str())
        .bind(&lock.repo_id)
        .bind(lock.status.as_str())
        .bind(lock.expiry)
        .bind(&lock.last_commit)
        .bind(lock.version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

impl LockStore for PgLockStore {
    async fn find(&self, owner: &Account, repo_id: &str) -> Result<RepoSyncLock, LockStoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
SELECT owner, repo_id, status, expiry, version, last_commit
FROM repo_sync_locks
WHERE owner = $1
  AND repo_id = $2
            "#,
        )
        .bind(owner.as_str())
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => lock_from_row(row),
            None => Err(LockStoreError::not_found(owner, repo_id)),
        }
    }

    async fn save(&self, lock: &RepoSyncLock) -> Result<RepoSyncLock, LockStoreError> {
        let row =
            if lock.is_persisted() { self.update(lock).await? } else { self.insert(lock).await? };

        match row {
            Some(row) => lock_from_row(row),
            None => Err(LockStoreError::conflict(lock)),
        }
    }
}

fn lock_from_row(
    (owner, repo_id, status, expiry, version, last_commit): LockRow,
) -> Result<RepoSyncLock, LockStoreError> {
    let owner = Account::new(owner)
        .map_err(|error| LockStoreError::Store(format!("invalid owner in lock row: {error}")))?;
    let status = SyncStatus::parse(&status)
        .ok_or_else(|| LockStoreError::Store(format!("invalid status in lock row: {status}")))?;

    Ok(RepoSyncLock { owner, repo_id, status, expiry, version, last_commit })
}
