//! Typed local store with lazy TTL expiry.
//!
//! [`LocalStore`] wraps a [`CacheBackend`] and stores every value inside a
//! [`CacheEntry`] envelope carrying its write and expiry times. Expiry is
//! checked on read; an expired or undecodable entry is evicted and reported
//! as a miss.
//!
//! None of the methods return errors. Backend failures are logged and the
//! store degrades to behaving as if it were empty.

use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use taskroom_core::{Clock, StorageError, Timestamp};

use super::key::{KeyKind, NamespacedKey};
use super::traits::{CacheBackend, CacheStats};

/// Envelope persisted for every cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub written_at: Timestamp,
    pub expires_at: Timestamp,
}

impl<T> CacheEntry<T> {
    /// An entry is expired strictly after its expiry time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Expiry fields only, for sweeping without decoding payloads.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryHeader {
    expires_at: Timestamp,
}

pub struct LocalStore {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    stats: RwLock<CacheStats>,
}

impl LocalStore {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        namespace: impl Into<String>,
        ttl: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            ttl,
            clock,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Write `value` under `key`, replacing any previous entry.
    pub async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) {
        self.put_raw(KeyKind::Entry, key, value).await;
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_raw(KeyKind::Entry, key).await
    }

    pub async fn remove(&self, key: &str) {
        self.remove_raw(KeyKind::Entry, key).await;
    }

    /// Replace the whole collection named `store`.
    pub async fn put_collection<T: Serialize + Sync>(&self, store: &str, items: &[T]) {
        self.put_raw(KeyKind::Collection, store, &items).await;
    }

    /// Items of the collection, or an empty list on miss.
    pub async fn get_collection<T: DeserializeOwned>(&self, store: &str) -> Vec<T> {
        self.get_raw(KeyKind::Collection, store)
            .await
            .unwrap_or_default()
    }

    pub async fn remove_collection(&self, store: &str) {
        self.remove_raw(KeyKind::Collection, store).await;
    }

    /// Remove every entry and collection under this namespace.
    ///
    /// Queue slots share the namespace and are removed too. Returns the
    /// number of keys deleted, 0 on failure.
    pub async fn clear_all(&self) -> u64 {
        let prefix = NamespacedKey::namespace_prefix(&self.namespace);
        match self.backend.delete_prefix(&prefix).await {
            Ok(deleted) => {
                tracing::info!(namespace = %self.namespace, deleted, "Cleared local store");
                deleted
            }
            Err(e) => {
                self.record_failure(&e, "clear_all");
                0
            }
        }
    }

    /// Evict every expired entry and collection. Returns the number evicted.
    pub async fn sweep_expired(&self) -> u64 {
        let now = self.clock.now();
        let mut evicted = 0u64;
        for kind in [KeyKind::Entry, KeyKind::Collection] {
            let prefix = NamespacedKey::kind_prefix(&self.namespace, kind);
            let entries = match self.backend.scan_prefix(&prefix).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.record_failure(&e, "sweep_expired");
                    continue;
                }
            };
            for (key, bytes) in entries {
                let expired = match serde_json::from_slice::<EntryHeader>(&bytes) {
                    Ok(header) => now > header.expires_at,
                    Err(_) => true,
                };
                if !expired {
                    continue;
                }
                match self.backend.delete(&key).await {
                    Ok(true) => {
                        evicted += 1;
                        self.bump(|s| s.expired_evictions += 1);
                    }
                    Ok(false) => {}
                    Err(e) => self.record_failure(&e, "sweep_expired"),
                }
            }
        }
        if evicted > 0 {
            tracing::debug!(namespace = %self.namespace, evicted, "Swept expired entries");
        }
        evicted
    }

    async fn put_raw<T: Serialize + Sync>(&self, kind: KeyKind, name: &str, value: &T) {
        let now = self.clock.now();
        let entry = CacheEntry {
            data: value,
            written_at: now,
            expires_at: now + self.ttl,
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = name, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        let key = NamespacedKey::new(self.namespace.as_str(), kind, name).encode();
        if let Err(e) = self.backend.write(&key, &bytes).await {
            self.record_failure(&e, name);
        }
    }

    async fn get_raw<T: DeserializeOwned>(&self, kind: KeyKind, name: &str) -> Option<T> {
        let key = NamespacedKey::new(self.namespace.as_str(), kind, name).encode();
        let bytes = match self.backend.read(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.bump(|s| s.misses += 1);
                return None;
            }
            Err(e) => {
                self.record_failure(&e, name);
                self.bump(|s| s.misses += 1);
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = name, error = %e, "Evicting corrupt cache entry");
                self.evict(&key, name).await;
                self.bump(|s| {
                    s.corrupt_evictions += 1;
                    s.misses += 1;
                });
                return None;
            }
        };

        if entry.is_expired(self.clock.now()) {
            tracing::debug!(key = name, expires_at = %entry.expires_at, "Evicting expired cache entry");
            self.evict(&key, name).await;
            self.bump(|s| {
                s.expired_evictions += 1;
                s.misses += 1;
            });
            return None;
        }

        self.bump(|s| s.hits += 1);
        Some(entry.data)
    }

    async fn remove_raw(&self, kind: KeyKind, name: &str) {
        let key = NamespacedKey::new(self.namespace.as_str(), kind, name).encode();
        self.evict(&key, name).await;
    }

    async fn evict(&self, key: &[u8], name: &str) {
        if let Err(e) = self.backend.delete(key).await {
            self.record_failure(&e, name);
        }
    }

    fn record_failure(&self, error: &StorageError, key: &str) {
        tracing::warn!(key, error = %error, "Local store operation failed, degrading to empty");
        self.bump(|s| s.backend_failures += 1);
    }

    fn bump(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}
