//! Taskroom Sync - Offline-First Session Engine
//!
//! Keeps a participant's task progress usable without connectivity. Writes
//! are applied to the local view at once, sent to the remote store when
//! possible and queued durably otherwise. Queued work is replayed in order
//! when connectivity returns. Finished sessions are converted into
//! anonymized records by a single remote transaction.

pub mod context;
pub mod coordinator;
pub mod engine;
pub mod finalizer;
pub mod network;
pub mod remote;
pub mod telemetry;

pub use context::EngineContext;
pub use coordinator::{
    CoordinatorHandle, CoordinatorState, DrainOutcome, DrainReport, ObserverGuard, ObserverId,
};
pub use engine::OfflineEngine;
pub use finalizer::Finalizer;
pub use network::{NetworkMonitor, NetworkTransition, NetworkWatcher};
pub use remote::{
    CollectionSnapshot, DocumentSnapshot, MemoryRemoteStore, RemoteStore, SnapshotStream,
    SubscriptionFilter, TransactionStep, WriteRecord,
};
pub use telemetry::init_tracing;
