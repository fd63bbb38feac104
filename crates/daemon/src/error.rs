// Coordinator error taxonomy.

use repomirror_common::manifest::ManifestError;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::lock::LockStoreError;
use crate::platform::PlatformError;
use crate::storage::StorageError;

/// Successful ends of one sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The repository was copied up to `commit` and the watermark recorded.
    Synced { commit: String },
    /// Upstream head equals the recorded watermark; nothing was written.
    UpToDate,
    /// The repository no longer exists upstream.
    UpstreamMissing,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Another worker holds an unexpired lease.
    #[error("repository {repo} is being synced elsewhere")]
    Busy { repo: String },

    /// Lost the conditional write to a concurrent instance.
    #[error("lost the sync lease race for {repo}")]
    Conflict { repo: String },

    #[error(transparent)]
    LockStore(LockStoreError),

    #[error("platform lookup failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("sync workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("sync script failed: {0}")]
    Execution(#[from] ExecutorError),

    #[error("invalid large-object manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("large-object replication failed: {0}")]
    Replication(StorageError),

    /// The mirror holds `commit` but the watermark object could not be written.
    #[error("synced {repo} to {commit} but failed to record it: {source}")]
    NotRecorded { repo: String, commit: String, source: StorageError },
}

impl SyncError {
    /// Whether the event is worth redelivering. A manifest that tries to
    /// escape the repository prefix will do so again on every replay.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Manifest(ManifestError::Traversal { .. }))
    }

    /// Short machine-friendly label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "busy",
            Self::Conflict { .. } => "conflict",
            Self::LockStore(_) => "lock_store",
            Self::Platform(_) => "platform",
            Self::Workspace(_) => "workspace",
            Self::Execution(_) => "execution",
            Self::Manifest(_) => "manifest",
            Self::Replication(_) => "replication",
            Self::NotRecorded { .. } => "not_recorded",
        }
    }
}
