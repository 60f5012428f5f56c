//! Taskroom Core - Shared Types
//!
//! Data model, identifiers, clock, errors and configuration for the offline
//! sync engine. All other crates depend on this one. Behavior here is limited
//! to pure transformations of the data model.

pub mod clock;
pub mod config;
pub mod entities;
pub mod error;
pub mod identity;
pub mod operation;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use entities::{
    finalized_session_path, live_session_path, LiveSessionState, SyncStatus, Task, TaskProgress,
    TaskStatus, FINALIZED_SESSIONS_COLLECTION, LIVE_SESSIONS_COLLECTION,
};
pub use error::{
    ConfigError, FinalizeError, RemoteError, StorageError, StorageResult, TaskroomError,
    TaskroomResult, UsageError,
};
pub use identity::{DurationMs, OperationId, SessionId, TaskId, Timestamp};
pub use operation::{JoinPayload, NewOperation, OperationKind, PendingOperation, StatusUpdate};
pub use record::{anonymized_label, FinalizedSessionRecord, PerTaskMetric};
