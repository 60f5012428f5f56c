//! Identity types for Taskroom entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::UsageError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds, as stored in finalized records.
pub type DurationMs = i64;

/// Check that `id` can be used as a single path segment or field name.
fn check_segment(id: &str) -> Result<(), &'static str> {
    if id.trim().is_empty() {
        return Err("must not be empty");
    }
    if id.contains('.') || id.contains('/') {
        return Err("must not contain '.' or '/'");
    }
    Ok(())
}

/// Identifier of one participation session (a remote document id).
///
/// `new` trusts its input; ids coming from callers go through
/// [`SessionId::parse`] or [`SessionId::validate`] since they become a
/// document path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a validated session id.
    pub fn parse(id: impl Into<String>) -> Result<Self, UsageError> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn validate(&self) -> Result<(), UsageError> {
        check_segment(&self.0).map_err(|reason| UsageError::InvalidSessionId {
            session_id: self.0.clone(),
            reason: reason.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a task inside a session's task-status map.
///
/// Task ids are used as nested field names on the remote store, so `.` and
/// `/` are rejected: they would address a different field or document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build a validated task id.
    pub fn parse(id: impl Into<String>) -> Result<Self, UsageError> {
        let id = id.into();
        match check_segment(&id) {
            Ok(()) => Ok(Self(id)),
            Err(reason) => Err(UsageError::InvalidTaskId {
                task_id: id,
                reason: reason.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a pending operation.
///
/// UUIDv7 embeds a Unix timestamp, so ids are distinguishable and sortable
/// by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new timestamp-sortable operation id.
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_rejects_separators() {
        assert!(TaskId::parse("t1").is_ok());
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("   ").is_err());
        assert!(TaskId::parse("a.b").is_err());
        assert!(TaskId::parse("a/b").is_err());
    }

    #[test]
    fn test_session_id_rejects_path_separators() {
        assert!(SessionId::parse("s-42").is_ok());
        assert!(matches!(
            SessionId::parse("a/b"),
            Err(UsageError::InvalidSessionId { .. })
        ));
        assert!(SessionId::parse("a.b").is_err());
        assert!(SessionId::parse(" ").is_err());
        assert!(SessionId::new("live/x").validate().is_err());
    }

    #[test]
    fn test_operation_ids_are_distinct_and_ordered() {
        let a = OperationId::now_v7();
        let b = OperationId::now_v7();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_session_id_serializes_transparently() {
        let id = SessionId::new("s-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s-42\"");
    }
}
