//! In-memory cache backend.
//!
//! Used in tests and as the fallback medium when the LMDB environment cannot
//! be opened. Supports write-failure injection and raw writes so callers can
//! exercise quota and corruption paths.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use taskroom_core::{StorageError, StorageResult};

use super::traits::CacheBackend;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `QuotaExceeded`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store bytes directly, bypassing failure injection.
    pub fn insert_raw(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prefixed(
        entries: &BTreeMap<Vec<u8>, Vec<u8>>,
        prefix: &[u8],
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn read(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn write(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded {
                reason: "write failure injected".to_string(),
            });
        }
        self.insert_raw(key, value)
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Self::prefixed(&entries, prefix))
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> StorageResult<u64> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        let keys: Vec<Vec<u8>> = Self::prefixed(&entries, prefix)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        Ok(keys.len() as u64)
    }
}
