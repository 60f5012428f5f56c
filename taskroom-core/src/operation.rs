//! Pending write operations.
//!
//! An operation carries everything needed to replay it later: the kind, the
//! session and target it belongs to, and a JSON payload. The same operation
//! drives both the remote field write and the optimistic local update, so a
//! replayed write and the locally shown state never diverge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::{LiveSessionState, TaskStatus};
use crate::identity::{OperationId, SessionId, TaskId, Timestamp};

/// Kind of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Participant joined: creates or refreshes the live record header.
    Join,
    /// Participant changed the status of a task.
    RecordStatus,
}

/// Payload of a [`OperationKind::Join`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub display_name: String,
    pub joined_at: Timestamp,
}

/// Payload of a [`OperationKind::RecordStatus`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub comment: Option<String>,
    pub recorded_at: Timestamp,
}

/// A write that has not been assigned a queue id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub kind: OperationKind,
    pub session_id: SessionId,
    pub target_id: String,
    pub payload: Value,
}

impl NewOperation {
    pub fn join(session_id: SessionId, payload: &JoinPayload) -> serde_json::Result<Self> {
        Ok(Self {
            kind: OperationKind::Join,
            target_id: session_id.to_string(),
            session_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn record_status(session_id: SessionId, update: &StatusUpdate) -> serde_json::Result<Self> {
        Ok(Self {
            kind: OperationKind::RecordStatus,
            target_id: update.task_id.to_string(),
            session_id,
            payload: serde_json::to_value(update)?,
        })
    }

    /// Field writes this operation performs on the session's live document.
    ///
    /// Dotted names address nested map fields.
    pub fn remote_fields(&self) -> serde_json::Result<Map<String, Value>> {
        let mut fields = Map::new();
        match self.kind {
            OperationKind::Join => {
                let join: JoinPayload = serde_json::from_value(self.payload.clone())?;
                fields.insert("sessionId".into(), serde_json::to_value(&self.session_id)?);
                fields.insert("displayName".into(), Value::String(join.display_name));
                fields.insert("joinedAt".into(), serde_json::to_value(join.joined_at)?);
                fields.insert("lastSeenAt".into(), serde_json::to_value(join.joined_at)?);
            }
            OperationKind::RecordStatus => {
                let update: StatusUpdate = serde_json::from_value(self.payload.clone())?;
                let prefix = format!("taskStatusMap.{}", update.task_id);
                let at = serde_json::to_value(update.recorded_at)?;
                let status = serde_json::to_value(update.status)?;

                fields.insert(format!("{prefix}.status"), status.clone());
                fields.insert(
                    format!("{prefix}.comment"),
                    update.comment.map(Value::String).unwrap_or(Value::Null),
                );
                fields.insert(format!("{prefix}.updatedAt"), at.clone());
                match update.status {
                    TaskStatus::InProgress => {
                        fields.insert(format!("{prefix}.startedAt"), at.clone());
                    }
                    TaskStatus::Completed => {
                        fields.insert(format!("{prefix}.completedAt"), at.clone());
                    }
                    TaskStatus::NotStarted | TaskStatus::NeedsHelp => {}
                }
                fields.insert("currentTaskId".into(), Value::String(update.task_id.to_string()));
                fields.insert("currentStatus".into(), status);
                fields.insert("lastSeenAt".into(), at);
            }
        }
        Ok(fields)
    }

    /// Apply this operation to locally known state.
    ///
    /// A status update without a known live state is dropped from the local
    /// view only; the queued write still carries it to the remote.
    pub fn apply_to(&self, state: Option<LiveSessionState>) -> serde_json::Result<Option<LiveSessionState>> {
        match self.kind {
            OperationKind::Join => {
                let join: JoinPayload = serde_json::from_value(self.payload.clone())?;
                Ok(Some(match state {
                    Some(mut existing) => {
                        existing.display_name = join.display_name;
                        existing.joined_at = join.joined_at;
                        existing.last_seen_at = join.joined_at;
                        existing
                    }
                    None => LiveSessionState::new(
                        self.session_id.clone(),
                        join.display_name,
                        join.joined_at,
                    ),
                }))
            }
            OperationKind::RecordStatus => {
                let update: StatusUpdate = serde_json::from_value(self.payload.clone())?;
                Ok(state.map(|mut live| {
                    live.apply_status(
                        &update.task_id,
                        update.status,
                        update.comment,
                        update.recorded_at,
                    );
                    live
                }))
            }
        }
    }
}

/// A write waiting in the pending queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    #[serde(flatten)]
    pub operation: NewOperation,
    pub enqueued_at: Timestamp,
    /// Failed replay attempts. Diagnostic only, never used to drop.
    pub retry_count: u32,
}

impl PendingOperation {
    pub fn new(id: OperationId, operation: NewOperation, enqueued_at: Timestamp) -> Self {
        Self {
            id,
            operation,
            enqueued_at,
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    pub fn session_id(&self) -> &SessionId {
        &self.operation.session_id
    }

    pub fn target_id(&self) -> &str {
        &self.operation.target_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn status_op(task: &str, status: TaskStatus, at: Timestamp) -> NewOperation {
        NewOperation::record_status(
            SessionId::new("s1"),
            &StatusUpdate {
                task_id: TaskId::parse(task).unwrap(),
                status,
                comment: None,
                recorded_at: at,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_record_status_fields_use_dotted_paths() {
        let at = Utc::now();
        let op = status_op("t1", TaskStatus::InProgress, at);
        let fields = op.remote_fields().unwrap();

        assert_eq!(fields["taskStatusMap.t1.status"], "in_progress");
        assert!(fields.contains_key("taskStatusMap.t1.startedAt"));
        assert!(!fields.contains_key("taskStatusMap.t1.completedAt"));
        assert_eq!(fields["taskStatusMap.t1.comment"], Value::Null);
        assert_eq!(fields["currentTaskId"], "t1");
        assert_eq!(op.target_id, "t1");
    }

    #[test]
    fn test_join_fields_do_not_touch_task_map() {
        let op = NewOperation::join(
            SessionId::new("s1"),
            &JoinPayload {
                display_name: "Ada".to_string(),
                joined_at: Utc::now(),
            },
        )
        .unwrap();
        let fields = op.remote_fields().unwrap();

        assert_eq!(fields["displayName"], "Ada");
        assert_eq!(fields["sessionId"], "s1");
        assert!(fields.keys().all(|k| !k.starts_with("taskStatusMap")));
    }

    #[test]
    fn test_apply_join_then_status() {
        let t0 = Utc::now();
        let join = NewOperation::join(
            SessionId::new("s1"),
            &JoinPayload {
                display_name: "Ada".to_string(),
                joined_at: t0,
            },
        )
        .unwrap();
        let state = join.apply_to(None).unwrap();
        let state = status_op("t1", TaskStatus::Completed, t0 + Duration::minutes(3))
            .apply_to(state)
            .unwrap()
            .unwrap();

        assert_eq!(state.display_name, "Ada");
        assert_eq!(state.tasks().len(), 1);
        assert_eq!(state.current_status, TaskStatus::Completed);
    }

    #[test]
    fn test_status_without_live_state_is_not_invented() {
        let op = status_op("t1", TaskStatus::InProgress, Utc::now());
        assert!(op.apply_to(None).unwrap().is_none());
    }

    #[test]
    fn test_pending_operation_serializes_flat() {
        let op = status_op("t1", TaskStatus::InProgress, Utc::now());
        let pending = PendingOperation::new(OperationId::now_v7(), op, Utc::now());
        let json = serde_json::to_value(&pending).unwrap();

        assert_eq!(json["kind"], "record_status");
        assert_eq!(json["targetId"], "t1");
        assert_eq!(json["retryCount"], 0);

        let back: PendingOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, pending);
    }
}
