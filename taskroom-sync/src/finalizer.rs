//! Session finalizer.
//!
//! Turns a session's live document into its permanent anonymized record in
//! one remote transaction. The transaction carries its own preconditions, so
//! the live and finalized documents never coexist even when two clients race
//! to finalize the same session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskroom_core::{
    finalized_session_path, live_session_path, Clock, FinalizeError, FinalizedSessionRecord,
    LiveSessionState, RemoteError, SessionId,
};

use crate::remote::{RemoteStore, TransactionStep};

pub struct Finalizer {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    timeout: Duration,
    /// Sessions being finalized or already finalized by this instance.
    claimed: Mutex<HashSet<SessionId>>,
}

impl Finalizer {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            clock,
            retention,
            timeout,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Finalize a session.
    ///
    /// Returns the record written, or `None` when there was nothing to do:
    /// the session is already being finalized here, was finalized here
    /// before, has no live state, or another client finalized it first.
    /// Errors are never retried here; the caller decides.
    pub async fn finalize(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FinalizedSessionRecord>, FinalizeError> {
        if !self.claim(session_id) {
            tracing::debug!(session_id = %session_id, "Finalize already claimed, skipping");
            return Ok(None);
        }

        let result = self.run(session_id).await;
        if !matches!(result, Ok(Some(_))) {
            self.release(session_id);
        }
        result
    }

    fn claim(&self, session_id: &SessionId) -> bool {
        match self.claimed.lock() {
            Ok(mut claimed) => claimed.insert(session_id.clone()),
            Err(_) => false,
        }
    }

    fn release(&self, session_id: &SessionId) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(session_id);
        }
    }

    fn transaction_error(session_id: &SessionId, source: RemoteError) -> FinalizeError {
        FinalizeError::Transaction {
            session_id: session_id.clone(),
            source,
        }
    }

    async fn read(&self, session_id: &SessionId, path: &str) -> Result<Option<serde_json::Value>, FinalizeError> {
        match tokio::time::timeout(self.timeout, self.remote.get_document(path)).await {
            Ok(result) => result.map_err(|e| Self::transaction_error(session_id, e)),
            Err(_) => Err(Self::transaction_error(
                session_id,
                RemoteError::Timeout { after: self.timeout },
            )),
        }
    }

    async fn run(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FinalizedSessionRecord>, FinalizeError> {
        let live_path = live_session_path(session_id);
        let record_path = finalized_session_path(session_id);

        let live = self.read(session_id, &live_path).await?;
        let existing_record = self.read(session_id, &record_path).await?;

        let live = match (live, existing_record) {
            (None, _) => {
                tracing::info!(session_id = %session_id, "No live state, nothing to finalize");
                return Ok(None);
            }
            (Some(_), Some(_)) => {
                tracing::error!(
                    session_id = %session_id,
                    "Live state and finalized record both exist, leaving as is"
                );
                return Err(FinalizeError::Corruption {
                    session_id: session_id.clone(),
                });
            }
            (Some(live), None) => live,
        };

        let live: LiveSessionState =
            serde_json::from_value(live).map_err(|e| FinalizeError::Decode {
                session_id: session_id.clone(),
                reason: e.to_string(),
            })?;
        let record = FinalizedSessionRecord::from_live(&live, self.clock.now(), self.retention);
        let data = serde_json::to_value(&record).map_err(|e| FinalizeError::Decode {
            session_id: session_id.clone(),
            reason: e.to_string(),
        })?;

        let steps = vec![
            TransactionStep::Precondition {
                path: live_path.clone(),
                exists: true,
            },
            TransactionStep::Precondition {
                path: record_path.clone(),
                exists: false,
            },
            TransactionStep::Set {
                path: record_path,
                data,
            },
            TransactionStep::Delete {
                path: live_path.clone(),
            },
        ];

        let committed = match tokio::time::timeout(self.timeout, self.remote.run_transaction(steps)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout { after: self.timeout }),
        };

        match committed {
            Ok(()) => {
                tracing::info!(
                    session_id = %session_id,
                    label = %record.anonymized_label,
                    duration_ms = record.duration_ms,
                    tasks = record.per_task_metrics.len(),
                    "Session finalized"
                );
                Ok(Some(record))
            }
            Err(RemoteError::PreconditionFailed { path }) => {
                if let Ok(None) = self.read(session_id, &live_path).await {
                    tracing::info!(session_id = %session_id, "Session was finalized concurrently");
                    return Ok(None);
                }
                tracing::error!(session_id = %session_id, path = %path, "Finalize precondition failed");
                Err(Self::transaction_error(
                    session_id,
                    RemoteError::PreconditionFailed { path },
                ))
            }
            Err(source) => {
                tracing::error!(session_id = %session_id, error = %source, "Finalize transaction failed");
                Err(Self::transaction_error(session_id, source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use chrono::Duration as ChronoDuration;
    use taskroom_core::{ManualClock, TaskId, TaskStatus};

    fn finalizer(remote: Arc<MemoryRemoteStore>, clock: &ManualClock) -> Finalizer {
        Finalizer::new(
            remote,
            Arc::new(clock.clone()),
            ChronoDuration::days(30),
            Duration::from_secs(5),
        )
    }

    fn seed_live(remote: &MemoryRemoteStore, clock: &ManualClock, id: &str) -> LiveSessionState {
        let mut live = LiveSessionState::new(SessionId::new(id), "Ada Lovelace", clock.now());
        live.apply_status(
            &TaskId::parse("t1").unwrap(),
            TaskStatus::Completed,
            Some("done".to_string()),
            clock.now(),
        );
        remote.insert_document(
            &live_session_path(&live.session_id),
            serde_json::to_value(&live).unwrap(),
        );
        live
    }

    #[tokio::test]
    async fn test_finalize_moves_live_to_record() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let live = seed_live(&remote, &clock, "s1");
        clock.advance(ChronoDuration::minutes(20));

        let record = finalizer(remote.clone(), &clock)
            .finalize(&live.session_id)
            .await
            .unwrap()
            .expect("record");

        assert_eq!(record.duration_ms, 20 * 60 * 1000);
        assert_ne!(record.anonymized_label, "Ada Lovelace");
        assert!(remote.document(&live_session_path(&live.session_id)).is_none());
        let stored = remote
            .document(&finalized_session_path(&live.session_id))
            .unwrap();
        assert!(!stored.to_string().contains("Ada"));
    }

    #[tokio::test]
    async fn test_second_call_is_noop() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let live = seed_live(&remote, &clock, "s1");
        let finalizer = finalizer(remote, &clock);

        assert!(finalizer.finalize(&live.session_id).await.unwrap().is_some());
        assert!(finalizer.finalize(&live.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_live_state_is_noop() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let result = finalizer(remote, &clock)
            .finalize(&SessionId::new("ghost"))
            .await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_coexisting_records_are_corruption() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let live = seed_live(&remote, &clock, "s1");
        remote.insert_document(
            &finalized_session_path(&live.session_id),
            serde_json::json!({"sessionId": "s1"}),
        );

        let result = finalizer(remote.clone(), &clock)
            .finalize(&live.session_id)
            .await;
        assert!(matches!(result, Err(FinalizeError::Corruption { .. })));
        assert!(remote.document(&live_session_path(&live.session_id)).is_some());
    }

    #[tokio::test]
    async fn test_outage_surfaces_transaction_error_and_allows_retry() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let live = seed_live(&remote, &clock, "s1");
        let finalizer = finalizer(remote.clone(), &clock);

        remote.set_available(false);
        let result = finalizer.finalize(&live.session_id).await;
        assert!(matches!(result, Err(FinalizeError::Transaction { .. })));

        remote.set_available(true);
        assert!(finalizer.finalize(&live.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_finalize_elsewhere_is_noop() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        let live = seed_live(&remote, &clock, "s1");
        let record_path = finalized_session_path(&live.session_id);
        remote.interfere_with_next_transaction(vec![
            TransactionStep::Set {
                path: record_path.clone(),
                data: serde_json::json!({"sessionId": "s1"}),
            },
            TransactionStep::Delete {
                path: live_session_path(&live.session_id),
            },
        ]);

        let result = finalizer(remote.clone(), &clock)
            .finalize(&live.session_id)
            .await;
        assert!(matches!(result, Ok(None)));
        assert!(remote.document(&record_path).is_some());
        assert!(remote.document(&live_session_path(&live.session_id)).is_none());
    }

    #[tokio::test]
    async fn test_undecodable_live_state_is_reported() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.insert_document("live_sessions/s1", serde_json::json!({"lastSeenAt": 5}));

        let result = finalizer(remote.clone(), &clock)
            .finalize(&SessionId::new("s1"))
            .await;
        assert!(matches!(result, Err(FinalizeError::Decode { .. })));
        assert!(remote.document("live_sessions/s1").is_some());
    }
}
