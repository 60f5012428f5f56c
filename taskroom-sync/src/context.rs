//! Dependency bundle shared by the coordinator, finalizer and engine.

use std::sync::Arc;

use taskroom_core::{Clock, SessionId, StorageResult, SyncConfig, SystemClock};
use taskroom_storage::{open_backend_or_memory, CacheBackend, LocalStore, PendingQueue};

use crate::network::NetworkMonitor;
use crate::remote::RemoteStore;

/// Everything an engine instance needs, passed explicitly so several
/// isolated instances can live in one process.
pub struct EngineContext {
    pub config: SyncConfig,
    pub store: Arc<LocalStore>,
    pub queue: Arc<PendingQueue>,
    pub remote: Arc<dyn RemoteStore>,
    pub network: NetworkMonitor,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    /// Open the on-device store named by `config` and wire it to `remote`.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
    ) -> StorageResult<Self> {
        let backend = open_backend_or_memory(&config.store_path, config.store_max_size_mb);
        Self::with_backend(config, backend, remote, network, Arc::new(SystemClock)).await
    }

    pub async fn with_backend(
        config: SyncConfig,
        backend: Arc<dyn CacheBackend>,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let store = LocalStore::new(
            backend.clone(),
            config.namespace.as_str(),
            config.cache_ttl(),
            clock.clone(),
        );
        let queue = PendingQueue::open(backend, config.namespace.as_str(), clock.clone()).await?;
        Ok(Self {
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
            remote,
            network,
            clock,
        })
    }
}

/// Local store key of a session's live state.
pub fn live_state_key(session_id: &SessionId) -> String {
    format!("live:{session_id}")
}

/// Local collection store holding a session's task list.
pub fn tasks_store_name(session_id: &SessionId) -> String {
    format!("tasks:{session_id}")
}
