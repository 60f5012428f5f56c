//! Error types for Taskroom operations
//!
//! The taxonomy mirrors how far each failure is allowed to travel:
//! [`RemoteError`] and [`StorageError`] stay below the sync coordinator,
//! while [`FinalizeError`], [`UsageError`] and [`ConfigError`] reach callers.

use std::time::Duration;
use thiserror::Error;

use crate::identity::SessionId;

/// Local storage errors (quota, corruption, backend failures).
///
/// Never fatal: the cache layer logs them and degrades to a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Local storage quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Corrupted entry at {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Transient remote errors. Always queued or retried, never surfaced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Remote write timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Remote store rejected the write to {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error("Transaction precondition failed on {path}")]
    PreconditionFailed { path: String },
}

/// Session finalize errors. Surfaced to the caller and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FinalizeError {
    #[error("Finalize transaction for session {session_id} failed: {source}")]
    Transaction {
        session_id: SessionId,
        source: RemoteError,
    },

    #[error("Session {session_id} has both a live and a finalized record")]
    Corruption { session_id: SessionId },

    #[error("Live state for session {session_id} could not be decoded: {reason}")]
    Decode { session_id: SessionId, reason: String },

    #[error("Session {session_id} still has {pending} pending operation(s) that did not reach the remote")]
    PendingWrites { session_id: SessionId, pending: u32 },

    #[error("Pending queue for session {session_id} could not be read: {source}")]
    QueueUnreadable {
        session_id: SessionId,
        source: StorageError,
    },
}

/// Programmer misuse. Fails fast instead of being ignored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("{operation} called before initialize")]
    NotInitialized { operation: &'static str },

    #[error("Engine already initialized for session {active}, cannot initialize {requested}")]
    SessionConflict {
        active: SessionId,
        requested: SessionId,
    },

    #[error("Invalid task id {task_id:?}: {reason}")]
    InvalidTaskId { task_id: String, reason: String },

    #[error("Invalid session id {session_id:?}: {reason}")]
    InvalidSessionId { session_id: String, reason: String },

    #[error("Sync engine has stopped")]
    EngineStopped,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TASKROOM_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Taskroom errors.
#[derive(Debug, Error)]
pub enum TaskroomError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Finalize error: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Taskroom operations.
pub type TaskroomResult<T> = Result<T, TaskroomError>;

/// Result type alias for local storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// TESTS
// =============================================================================
