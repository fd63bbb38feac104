// Sync coordinator.
//
// Drives one repository through: read lease, compare upstream head, take
// the lease with a conditional write, run the sync script in a private
// scratch dir, replicate changed large objects, record the watermark and
// release the lease. The conditional write is the only real mutual
// exclusion; the `is_doing` check before it is a fast path.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use repomirror_common::lock::RepoSyncLock;
use repomirror_common::manifest::{join_key, parse_manifest};
use repomirror_common::types::{Account, SyncTask};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncOutcome};
use crate::executor::{CommandExecutor, ProcessCommandExecutor, SyncExecutor, SyncInvocation, SyncResult};
use crate::lock::LockStore;
use crate::platform::PlatformClient;
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

/// Runs one sync per call. The dispatcher's workers only see this seam.
pub trait RepoSyncer: Send + Sync + 'static {
    fn sync_repo(
        &self,
        task: &SyncTask,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub work_dir: PathBuf,
    pub tool_path: String,
    pub bucket: String,
    pub lfs_prefix: String,
    pub repo_prefix: String,
    pub commit_file: String,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.service.work_dir.clone(),
            tool_path: config.storage.tool_path.to_string_lossy().into_owned(),
            bucket: config.storage.bucket.clone(),
            lfs_prefix: config.storage.lfs_prefix.clone(),
            repo_prefix: config.storage.repo_prefix.clone(),
            commit_file: config.storage.commit_file.clone(),
            lock_ttl: config.lock_ttl(),
            retry: config.retry_policy(),
        }
    }

    /// `<repo_prefix>/<owner>/<repo_id>`
    pub fn repo_key(&self, owner: &Account, repo_id: &str) -> String {
        join_key(&[&self.repo_prefix, owner.as_str(), repo_id])
    }

    pub fn watermark_key(&self, owner: &Account, repo_id: &str) -> String {
        join_key(&[&self.repo_key(owner, repo_id), &self.commit_file])
    }
}

pub struct SyncCoordinator<L, P, O, E = ProcessCommandExecutor> {
    locks: L,
    platform: P,
    objects: O,
    executor: Arc<SyncExecutor<E>>,
    settings: CoordinatorSettings,
}

impl<L, P, O, E> SyncCoordinator<L, P, O, E>
where
    L: LockStore,
    P: PlatformClient,
    O: ObjectStore,
    E: CommandExecutor + 'static,
{
    pub fn new(
        locks: L,
        platform: P,
        objects: O,
        executor: SyncExecutor<E>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self { locks, platform, objects, executor: Arc::new(executor), settings }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Watermark as recorded in the destination store; empty when the
    /// repository was never synced.
    pub async fn recorded_watermark(
        &self,
        owner: &Account,
        repo_id: &str,
    ) -> Result<String, crate::storage::StorageError> {
        match self.objects.get_object(&self.settings.watermark_key(owner, repo_id)).await {
            Ok(content) => Ok(String::from_utf8_lossy(&content).trim().to_string()),
            Err(error) if error.is_not_found() => Ok(String::new()),
            Err(error) => Err(error),
        }
    }

    async fn load_lock(&self, task: &SyncTask) -> Result<RepoSyncLock, SyncError> {
        match self.locks.find(&task.owner, &task.repo_id).await {
            Ok(lock) => Ok(lock),
            Err(error) if error.is_not_found() => {
                Ok(RepoSyncLock::new(task.owner.clone(), task.repo_id.clone()))
            }
            Err(error) => Err(SyncError::LockStore(error)),
        }
    }

    /// Steps that touch the mirror. Returns the commit now recorded.
    async fn transfer(&self, task: &SyncTask, start_commit: &str) -> Result<String, SyncError> {
        let workspace = tempfile::Builder::new().prefix("sync").tempdir_in(&self.settings.work_dir)?;
        let repo_key = self.settings.repo_key(&task.owner, &task.repo_id);

        let result = self.run_script(task, workspace.path(), &repo_key, start_commit).await?;
        debug!(
            repo = %task,
            commit = %result.commit,
            manifest = ?result.manifest,
            "sync script finished"
        );

        if let Some(manifest) = &result.manifest {
            self.replicate(manifest, &repo_key).await?;
        }
        self.record_watermark(task, &result.commit).await?;

        if let Err(error) = workspace.close() {
            warn!(repo = %task, error = %error, "failed to remove sync scratch dir");
        }
        Ok(result.commit)
    }

    async fn run_script(
        &self,
        task: &SyncTask,
        work_dir: &Path,
        repo_key: &str,
        start_commit: &str,
    ) -> Result<SyncResult, SyncError> {
        let executor = Arc::clone(&self.executor);
        let clone_url = self.platform.clone_url(&task.owner, &task.repo_name);
        let work_dir = work_dir.to_path_buf();
        let repo_name = task.repo_name.clone();
        let tool_path = self.settings.tool_path.clone();
        let bucket = self.settings.bucket.clone();
        let destination_prefix = repo_key.to_string();
        let start_commit = start_commit.to_string();

        let result = tokio::task::spawn_blocking(move || {
            executor.run(&SyncInvocation {
                work_dir: &work_dir,
                clone_url: &clone_url,
                repo_name: &repo_name,
                tool_path: &tool_path,
                bucket: &bucket,
                destination_prefix: &destination_prefix,
                start_commit: &start_commit,
            })
        })
        .await
        .map_err(|error| std::io::Error::other(format!("sync script task aborted: {error}")))??;
        Ok(result)
    }

    async fn replicate(&self, manifest: &Path, repo_key: &str) -> Result<(), SyncError> {
        let text = tokio::fs::read_to_string(manifest).await?;
        let entries = parse_manifest(&text)?;
        debug!(count = entries.len(), "replicating large objects");

        for entry in &entries {
            let src = entry.source_key(&self.settings.lfs_prefix);
            let dst = entry.destination_key(repo_key);
            self.settings
                .retry
                .run("copy large object", || self.objects.copy_object(&dst, &src))
                .await
                .map_err(SyncError::Replication)?;
        }
        Ok(())
    }

    async fn record_watermark(&self, task: &SyncTask, commit: &str) -> Result<(), SyncError> {
        let key = self.settings.watermark_key(&task.owner, &task.repo_id);
        self.settings
            .retry
            .run("save watermark", || self.objects.save_object(&key, commit.as_bytes()))
            .await
            .map_err(|source| {
                error!(
                    repo = %task,
                    %commit,
                    error = %source,
                    "repository synced but watermark not recorded"
                );
                SyncError::NotRecorded { repo: task.storage_path(), commit: commit.to_string(), source }
            })
    }

    /// Persist `unlock(commit)`. Failures are logged only: an unreleased
    /// lease frees itself at expiry.
    async fn release(&self, task: &SyncTask, mut lock: RepoSyncLock, commit: &str) {
        lock.unlock(commit);
        let saved = self
            .settings
            .retry
            .run_while("release sync lock", || self.locks.save(&lock), |error| !error.is_conflict())
            .await;

        match saved {
            Ok(stored) => {
                debug!(repo = %task, version = stored.version, watermark = %stored.last_commit, "sync lock released");
            }
            Err(error) => {
                warn!(repo = %task, error = %error, "failed to release sync lock; it expires on its own");
            }
        }
    }
}

impl<L, P, O, E> RepoSyncer for SyncCoordinator<L, P, O, E>
where
    L: LockStore,
    P: PlatformClient,
    O: ObjectStore,
    E: CommandExecutor + 'static,
{
    async fn sync_repo(&self, task: &SyncTask) -> Result<SyncOutcome, SyncError> {
        let mut lock = self.load_lock(task).await?;
        if lock.is_doing() {
            debug!(repo = %task, expiry = lock.expiry, "repository busy");
            return Err(SyncError::Busy { repo: task.storage_path() });
        }

        let head = match self.platform.last_commit(&task.repo_id).await {
            Ok(head) => head,
            Err(error) if error.is_not_exists() => {
                info!(repo = %task, "repository no longer exists upstream; skipping");
                return Ok(SyncOutcome::UpstreamMissing);
            }
            Err(error) => return Err(error.into()),
        };

        let start_commit = lock.last_commit.clone();
        if !lock.lock(&head, self.settings.lock_ttl) {
            debug!(repo = %task, commit = %head, "repository already up to date");
            return Ok(SyncOutcome::UpToDate);
        }

        let held = self.locks.save(&lock).await.map_err(|error| {
            if error.is_conflict() {
                SyncError::Conflict { repo: task.storage_path() }
            } else {
                SyncError::LockStore(error)
            }
        })?;
        info!(repo = %task, from = %start_commit, head = %head, "sync started");

        let transferred = self.transfer(task, &start_commit).await;
        let watermark = transferred.as_deref().unwrap_or("");
        self.release(task, held, watermark).await;

        match transferred {
            Ok(commit) => {
                info!(repo = %task, %commit, "sync finished");
                Ok(SyncOutcome::Synced { commit })
            }
            Err(error) => Err(error),
        }
    }
}
