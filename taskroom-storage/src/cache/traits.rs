//! Cache backend trait and cache statistics.

use async_trait::async_trait;
use taskroom_core::StorageResult;

/// Byte-level key/value backend for the local store and the pending queue.
///
/// This trait abstracts over the persistence medium (LMDB on device, a
/// `BTreeMap` in tests). It is object safe so one backend instance can be
/// shared as `Arc<dyn CacheBackend>` by every component that needs it.
///
/// # Ordering
///
/// `scan_prefix` must return entries in ascending byte order of their keys.
/// The pending queue relies on this for FIFO replay.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read a value, or `None` if the key is absent.
    async fn read(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one. Durable once it returns.
    async fn write(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &[u8]) -> StorageResult<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Delete every key starting with `prefix`. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &[u8]) -> StorageResult<u64>;
}

/// Statistics about local store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired and corrupt reads.
    pub misses: u64,
    /// Entries evicted because they had expired.
    pub expired_evictions: u64,
    /// Entries evicted because they could not be decoded.
    pub corrupt_evictions: u64,
    /// Backend failures swallowed by the store.
    pub backend_failures: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
