// Core domain types: validated owner accounts and per-event sync tasks.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account name reserved by the hosting platform; never mirrored.
const RESERVED_ACCOUNT: &str = "root";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("account name is empty")]
    Empty,

    #[error("account name `{0}` is reserved")]
    Reserved(String),

    #[error("account name `{0}` contains characters outside [A-Za-z0-9_-]")]
    InvalidCharacters(String),
}

/// A validated repository owner.
///
/// Non-empty, not the reserved `root` account (case-insensitive), and
/// restricted to ASCII letters, digits, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account(String);

impl Account {
    pub fn new(value: impl Into<String>) -> Result<Self, AccountError> {
        let value = value.into();
        if value.is_empty() {
            return Err(AccountError::Empty);
        }
        if value.eq_ignore_ascii_case(RESERVED_ACCOUNT) {
            return Err(AccountError::Reserved(value));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(AccountError::InvalidCharacters(value));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Account {
    type Error = AccountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.0
    }
}

/// One unit of work derived from an inbound push event. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub owner: Account,
    /// Platform-stable numeric id, kept as text because it keys storage paths.
    pub repo_id: String,
    pub repo_name: String,
}

impl SyncTask {
    /// `<owner>/<repo_id>`: the repository's prefix in the destination store.
    pub fn storage_path(&self) -> String {
        format!("{}/{}", self.owner, self.repo_id)
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.repo_name, self.repo_id)
    }
}
