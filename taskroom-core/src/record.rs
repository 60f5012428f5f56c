//! Finalized, anonymized session records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entities::{LiveSessionState, TaskProgress, TaskStatus};
use crate::identity::{DurationMs, SessionId, TaskId, Timestamp};

const LABEL_DOMAIN: &str = "taskroom-session:";

/// Per-task summary kept after a session is scrubbed.
///
/// Comment text is not copied, only whether one was left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerTaskMetric {
    pub task_id: TaskId,
    pub final_status: TaskStatus,
    pub completed: bool,
    pub time_on_task_ms: Option<DurationMs>,
    pub commented: bool,
}

impl PerTaskMetric {
    pub fn from_progress(task_id: &TaskId, progress: &TaskProgress) -> Self {
        let time_on_task_ms = match (progress.started_at, progress.completed_at) {
            (Some(started), Some(completed)) if completed >= started => {
                Some((completed - started).num_milliseconds())
            }
            _ => None,
        };
        Self {
            task_id: task_id.clone(),
            final_status: progress.status,
            completed: progress.status == TaskStatus::Completed,
            time_on_task_ms,
            commented: progress
                .comment
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty()),
        }
    }
}

/// Permanent record of a finished session. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSessionRecord {
    pub session_id: SessionId,
    pub anonymized_label: String,
    pub date: NaiveDate,
    pub duration_ms: DurationMs,
    pub per_task_metrics: Vec<PerTaskMetric>,
    pub finalized_at: Timestamp,
    /// Scheduled-deletion horizon, enforced by the remote store.
    pub retain_until: Timestamp,
}

impl FinalizedSessionRecord {
    /// Derive the record from a live snapshot.
    pub fn from_live(
        live: &LiveSessionState,
        finalized_at: Timestamp,
        retention: chrono::Duration,
    ) -> Self {
        let duration_ms = (finalized_at - live.joined_at).num_milliseconds().max(0);
        Self {
            session_id: live.session_id.clone(),
            anonymized_label: anonymized_label(&live.session_id, &live.display_name),
            date: live.joined_at.date_naive(),
            duration_ms,
            per_task_metrics: live
                .task_status_map
                .iter()
                .map(|(task_id, progress)| PerTaskMetric::from_progress(task_id, progress))
                .collect(),
            finalized_at,
            retain_until: finalized_at + retention,
        }
    }
}

/// Deterministic anonymized label for a session.
///
/// Derived from the session id only. If the derived label happens to match
/// the display name it is re-derived with a counter until it differs.
pub fn anonymized_label(session_id: &SessionId, display_name: &str) -> String {
    let name = display_name.trim();
    let mut round = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(LABEL_DOMAIN.as_bytes());
        hasher.update(session_id.as_str().as_bytes());
        if round > 0 {
            hasher.update(round.to_le_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        let label = format!("Participant {}", &digest[..8].to_ascii_uppercase());
        if !label.eq_ignore_ascii_case(name) {
            return label;
        }
        round += 1;
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// The anonymized label never equals a non-empty display name.
        #[test]
        fn prop_label_never_equals_display_name(
            session in "[a-z0-9]{1,16}",
            name in "\\PC{1,32}",
        ) {
            let label = anonymized_label(&SessionId::new(session), &name);
            prop_assert_ne!(label, name);
        }

        /// Even a display name chosen to collide with the label is avoided.
        #[test]
        fn prop_label_avoids_adversarial_name(session in "[a-z0-9]{1,16}") {
            let id = SessionId::new(session);
            let natural = anonymized_label(&id, "");
            let label = anonymized_label(&id, &natural);
            prop_assert_ne!(label, natural);
        }
    }
}
