//! Taskroom Storage - Local Persistence
//!
//! The on-device half of the offline sync engine: a TTL cache of the last
//! known session state and the durable queue of writes that have not yet
//! reached the remote store. Both share one [`CacheBackend`].

pub mod cache;
pub mod queue;

use std::path::Path;
use std::sync::Arc;

pub use cache::{
    CacheBackend, CacheEntry, CacheStats, KeyKind, LmdbBackend, LmdbOpenError, LocalStore,
    MemoryBackend, NamespacedKey,
};
pub use queue::PendingQueue;

/// Open the LMDB backend at `path`, falling back to memory if it cannot be
/// opened. The fallback keeps the engine usable without durability.
pub fn open_backend_or_memory(path: &Path, max_size_mb: usize) -> Arc<dyn CacheBackend> {
    match LmdbBackend::open(path, max_size_mb) {
        Ok(backend) => {
            tracing::info!(path = %path.display(), max_size_mb, "Opened LMDB local store");
            Arc::new(backend)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to open LMDB local store, falling back to memory"
            );
            Arc::new(MemoryBackend::new())
        }
    }
}
