//! Durable local cache.
//!
//! - [`NamespacedKey`]: key encoding that scopes every key to one namespace
//! - [`CacheBackend`]: object-safe byte-level backend trait
//! - [`LmdbBackend`]: durable LMDB backend
//! - [`MemoryBackend`]: in-memory backend for tests and fallback
//! - [`LocalStore`]: typed store with lazy TTL expiry over any backend

mod key;
mod lmdb_backend;
mod memory_backend;
mod store;
mod traits;

pub use key::{KeyKind, NamespacedKey};
pub use lmdb_backend::{LmdbBackend, LmdbOpenError};
pub use memory_backend::MemoryBackend;
pub use store::{CacheEntry, LocalStore};
pub use traits::{CacheBackend, CacheStats};
