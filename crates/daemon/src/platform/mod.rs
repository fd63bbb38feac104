// Read-only access to the hosting platform.

pub mod gitlab;

use std::future::Future;

use repomirror_common::types::Account;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Deleted upstream (or never had a commit); nothing to mirror.
    #[error("repository {repo_id} does not exist upstream")]
    NotExists { repo_id: String },

    #[error("platform returned status {status} for repository {repo_id}")]
    Upstream { status: u16, repo_id: String },

    #[error("platform request failed: {0}")]
    Request(String),
}

impl PlatformError {
    pub fn is_not_exists(&self) -> bool {
        matches!(self, Self::NotExists { .. })
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(error: reqwest::Error) -> Self {
        // Strip the URL: request URLs are harmless here but errors end up in logs verbatim.
        Self::Request(error.without_url().to_string())
    }
}

pub trait PlatformClient: Send + Sync + 'static {
    /// Head commit of the repository's default branch.
    fn last_commit(
        &self,
        repo_id: &str,
    ) -> impl Future<Output = Result<String, PlatformError>> + Send;

    /// Authenticated clone URL handed to the sync script. Contains credentials.
    fn clone_url(&self, owner: &Account, repo_name: &str) -> String;
}
