//! Live session state and the task views derived from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::{SessionId, TaskId, Timestamp};

/// Remote collection holding one live document per active session.
pub const LIVE_SESSIONS_COLLECTION: &str = "live_sessions";

/// Remote collection holding finalized, anonymized session records.
pub const FINALIZED_SESSIONS_COLLECTION: &str = "finalized_sessions";

/// Document path of a session's live state.
pub fn live_session_path(session_id: &SessionId) -> String {
    format!("{}/{}", LIVE_SESSIONS_COLLECTION, session_id)
}

/// Document path of a session's finalized record.
pub fn finalized_session_path(session_id: &SessionId) -> String {
    format!("{}/{}", FINALIZED_SESSIONS_COLLECTION, session_id)
}

/// Progress state of a single task for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    NeedsHelp,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::NeedsHelp => "needs_help",
        }
    }
}

/// One entry of a session's task-status map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub status: TaskStatus,
    #[serde(default)]
    pub comment: Option<String>,
    /// Last time the task moved to in-progress.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// Last time the task moved to completed.
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// Task as delivered to task observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub comment: Option<String>,
    pub updated_at: Timestamp,
}

/// Ephemeral per-participant record for an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionState {
    pub session_id: SessionId,
    pub display_name: String,
    pub joined_at: Timestamp,
    #[serde(default)]
    pub current_status: TaskStatus,
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    #[serde(default)]
    pub task_status_map: BTreeMap<TaskId, TaskProgress>,
    pub last_seen_at: Timestamp,
}

impl LiveSessionState {
    /// Create the state of a participant who just joined.
    pub fn new(session_id: SessionId, display_name: impl Into<String>, joined_at: Timestamp) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
            joined_at,
            current_status: TaskStatus::NotStarted,
            current_task_id: None,
            task_status_map: BTreeMap::new(),
            last_seen_at: joined_at,
        }
    }

    /// Apply a status change the same way the remote merge applies it.
    pub fn apply_status(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        comment: Option<String>,
        at: Timestamp,
    ) {
        let entry = self
            .task_status_map
            .entry(task_id.clone())
            .or_insert_with(|| TaskProgress {
                status,
                comment: None,
                started_at: None,
                completed_at: None,
                updated_at: at,
            });
        entry.status = status;
        entry.comment = comment;
        entry.updated_at = at;
        match status {
            TaskStatus::InProgress => entry.started_at = Some(at),
            TaskStatus::Completed => entry.completed_at = Some(at),
            TaskStatus::NotStarted | TaskStatus::NeedsHelp => {}
        }

        self.current_task_id = Some(task_id.clone());
        self.current_status = status;
        self.last_seen_at = at;
    }

    /// Task list view, ordered by task id.
    pub fn tasks(&self) -> Vec<Task> {
        self.task_status_map
            .iter()
            .map(|(task_id, progress)| Task {
                task_id: task_id.clone(),
                status: progress.status,
                comment: progress.comment.clone(),
                updated_at: progress.updated_at,
            })
            .collect()
    }
}

/// Sync status broadcast to status observers. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_synced_at: Option<Timestamp>,
    pub pending_count: u32,
    pub is_syncing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn task(id: &str) -> TaskId {
        TaskId::parse(id).unwrap()
    }

    #[test]
    fn test_apply_status_tracks_start_and_completion() {
        let t0 = Utc::now();
        let mut state = LiveSessionState::new(SessionId::new("s1"), "Ada", t0);

        state.apply_status(&task("t1"), TaskStatus::InProgress, None, t0 + Duration::minutes(1));
        state.apply_status(
            &task("t1"),
            TaskStatus::Completed,
            Some("done".to_string()),
            t0 + Duration::minutes(6),
        );

        let progress = &state.task_status_map[&task("t1")];
        assert_eq!(progress.status, TaskStatus::Completed);
        assert_eq!(progress.started_at, Some(t0 + Duration::minutes(1)));
        assert_eq!(progress.completed_at, Some(t0 + Duration::minutes(6)));
        assert_eq!(progress.comment.as_deref(), Some("done"));
        assert_eq!(state.current_task_id, Some(task("t1")));
        assert_eq!(state.current_status, TaskStatus::Completed);
        assert_eq!(state.last_seen_at, t0 + Duration::minutes(6));
    }

    #[test]
    fn test_tasks_are_ordered_by_id() {
        let t0 = Utc::now();
        let mut state = LiveSessionState::new(SessionId::new("s1"), "Ada", t0);
        state.apply_status(&task("b"), TaskStatus::NeedsHelp, None, t0);
        state.apply_status(&task("a"), TaskStatus::InProgress, None, t0);

        let ids: Vec<_> = state.tasks().into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![task("a"), task("b")]);
    }

    #[test]
    fn test_live_state_decodes_without_optional_fields() {
        let json = serde_json::json!({
            "sessionId": "s1",
            "displayName": "Ada",
            "joinedAt": "2026-01-01T09:00:00Z",
            "lastSeenAt": "2026-01-01T09:00:00Z"
        });
        let state: LiveSessionState = serde_json::from_value(json).unwrap();
        assert_eq!(state.current_status, TaskStatus::NotStarted);
        assert!(state.task_status_map.is_empty());
    }

    #[test]
    fn test_document_paths() {
        let id = SessionId::new("abc");
        assert_eq!(live_session_path(&id), "live_sessions/abc");
        assert_eq!(finalized_session_path(&id), "finalized_sessions/abc");
    }
}
