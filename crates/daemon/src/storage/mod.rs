// Destination object storage.
//
// Keys are bucket-relative, `/`-separated paths. Adapters must make
// `save_object` and `copy_object` idempotent: the coordinator retries them
// and an event may be replayed after a partial sync.

pub mod memory;
pub mod obsutil;

use std::future::Future;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{key}` not found")]
    NotFound { key: String },

    #[error("storage tool failed for `{key}`: {message}")]
    Tool { key: String, message: String },

    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub trait ObjectStore: Send + Sync + 'static {
    /// Write `content` under `key`, replacing any previous object.
    fn save_object(
        &self,
        key: &str,
        content: &[u8],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get_object(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;

    /// Server-side copy of `src` into `dst` (note the argument order).
    fn copy_object(
        &self,
        dst: &str,
        src: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}
