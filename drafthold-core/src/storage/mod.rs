/*!
Backing store adapters.

This module defines the storage abstraction (port) the engine writes through
and the concrete adapters. Stores are key/value: single-key writes are
expected to be atomic, and a full store must report
[`DraftError::QuotaExceeded`] so the engine can reclaim space and retry.
*/

pub mod local;

use crate::{DraftError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub use local::LocalFileStore;

/// Async key/value store the engine persists into
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read the value under `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value atomically
    ///
    /// # Errors
    /// * `DraftError::QuotaExceeded` - the store has no room for the value
    /// * `DraftError::Storage` / `DraftError::Io` - any other failure
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete `key`; deleting an absent key succeeds
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every key currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }
}

/// In-process store backed by a `HashMap`
///
/// Clones share the same underlying map, so a test can keep a handle to a
/// store it has handed to the engine. An optional byte quota makes writes
/// that would push total usage past the limit fail with `QuotaExceeded`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes beyond `quota` total bytes
    pub fn with_quota(quota: usize) -> Self {
        Self {
            data: Arc::default(),
            quota: Some(quota),
        }
    }

    /// Total bytes currently stored
    pub fn usage(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut data = self.lock();
        if let Some(quota) = self.quota {
            let others: usize = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if others + value.len() > quota {
                return Err(DraftError::quota_exceeded(key));
            }
        }
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
