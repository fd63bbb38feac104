// In-memory object store for tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ObjectStore, StorageError};

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Vec<u8>>,
    /// Injected failures, consumed one per write or copy.
    failures: VecDeque<String>,
    copies: Vec<(String, String)>,
    saves: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.lock().objects.insert(key.into(), content.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    /// Make the next `count` mutating calls fail with a tool error.
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut inner = self.lock();
        inner.failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Successful copies so far, as `(dst, src)`.
    pub fn copies(&self) -> Vec<(String, String)> {
        self.lock().copies.clone()
    }

    /// Keys of successful saves so far.
    pub fn saves(&self) -> Vec<String> {
        self.lock().saves.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn take_failure(&mut self, key: &str) -> Result<(), StorageError> {
        match self.failures.pop_front() {
            Some(message) => Err(StorageError::Tool { key: key.to_string(), message }),
            None => Ok(()),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    async fn save_object(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.take_failure(key)?;
        inner.objects.insert(key.to_string(), content.to_vec());
        inner.saves.push(key.to_string());
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { key: key.to_string() })
    }

    async fn copy_object(&self, dst: &str, src: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.take_failure(dst)?;
        let content = inner
            .objects
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { key: src.to_string() })?;
        inner.objects.insert(dst.to_string(), content);
        inner.copies.push((dst.to_string(), src.to_string()));
        Ok(())
    }
}
