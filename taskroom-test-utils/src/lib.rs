//! Taskroom Test Utilities
//!
//! Shared test infrastructure for the Taskroom workspace:
//! - Proptest generators for the data model
//! - Fixtures for configs, sessions and live state
//! - An engine harness wired to in-memory backends and a manual clock
//! - Recorders for observer callbacks and polling helpers

pub use taskroom_core::{
    LiveSessionState, ManualClock, SessionId, StatusUpdate, SyncConfig, SyncStatus, Task, TaskId,
    TaskStatus, Timestamp, UsageError,
};
pub use taskroom_storage::{CacheBackend, MemoryBackend};
pub use taskroom_sync::{MemoryRemoteStore, NetworkMonitor, ObserverGuard, OfflineEngine};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskroom_sync::EngineContext;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for the Taskroom data model.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_session_id() -> impl Strategy<Value = SessionId> {
        "[a-z0-9]{4,12}".prop_map(SessionId::new)
    }

    pub fn arb_task_id() -> impl Strategy<Value = TaskId> {
        "t[0-9]{1,3}".prop_map(|id| TaskId::parse(id).expect("generated task id is valid"))
    }

    pub fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::NotStarted),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Completed),
            Just(TaskStatus::NeedsHelp),
        ]
    }

    /// Timestamps between 2020 and 2030, second precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_comment() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[a-zA-Z ]{1,40}")
    }

    pub fn arb_status_update() -> impl Strategy<Value = StatusUpdate> {
        (arb_task_id(), arb_task_status(), arb_comment(), arb_timestamp()).prop_map(
            |(task_id, status, comment, recorded_at)| StatusUpdate {
                task_id,
                status,
                comment,
                recorded_at,
            },
        )
    }

    /// Live state built by applying a sequence of updates after joining.
    pub fn arb_live_state() -> impl Strategy<Value = LiveSessionState> {
        (
            arb_session_id(),
            "[A-Z][a-z]{2,10}",
            arb_timestamp(),
            prop::collection::vec(arb_status_update(), 0..8),
        )
            .prop_map(|(session_id, name, joined_at, updates)| {
                let mut live = LiveSessionState::new(session_id, name, joined_at);
                for update in updates {
                    let at = joined_at + chrono::Duration::seconds(60);
                    live.apply_status(&update.task_id, update.status, update.comment, at);
                }
                live
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made values for common scenarios.

    use super::*;

    /// Config with short timeouts and a single attempt per drain pass.
    pub fn fast_config() -> SyncConfig {
        let mut config = SyncConfig {
            namespace: "test".to_string(),
            cache_ttl_ms: 60 * 60 * 1000,
            write_timeout_ms: 200,
            heartbeat_interval_ms: 60_000,
            heartbeat_max_failures: 3,
            ..SyncConfig::default()
        };
        config.drain_retry.attempts_per_pass = 1;
        config.drain_retry.initial_backoff_ms = 10;
        config.drain_retry.max_backoff_ms = 50;
        config
    }

    pub fn session(id: &str) -> SessionId {
        SessionId::new(id)
    }

    pub fn task_id(id: &str) -> TaskId {
        TaskId::parse(id).expect("fixture task id is valid")
    }

    pub fn status_update(task: &str, status: TaskStatus, at: Timestamp) -> StatusUpdate {
        StatusUpdate {
            task_id: task_id(task),
            status,
            comment: None,
            recorded_at: at,
        }
    }

    /// Live state of `session` with the given task statuses applied in order.
    pub fn live_state(
        session: &SessionId,
        display_name: &str,
        joined_at: Timestamp,
        tasks: &[(&str, TaskStatus)],
    ) -> LiveSessionState {
        let mut live = LiveSessionState::new(session.clone(), display_name, joined_at);
        for (task, status) in tasks {
            live.apply_status(&task_id(task), *status, None, joined_at);
        }
        live
    }

    /// Seed the remote with a session's live document.
    pub fn seed_remote(remote: &MemoryRemoteStore, live: &LiveSessionState) {
        let data = serde_json::to_value(live).expect("live state serializes");
        remote.insert_document(&taskroom_core::live_session_path(&live.session_id), data);
    }
}

// ============================================================================
// ENGINE HARNESS
// ============================================================================

/// An engine plus handles on every fake it runs against.
pub struct Harness {
    pub engine: OfflineEngine,
    pub remote: Arc<MemoryRemoteStore>,
    pub backend: Arc<MemoryBackend>,
    pub network: NetworkMonitor,
    pub clock: ManualClock,
    pub config: SyncConfig,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(fixtures::fast_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryRemoteStore::new()),
            NetworkMonitor::new(true),
            ManualClock::starting_now(),
        )
        .await
    }

    /// A second engine over the same local store and remote, as after an
    /// app restart. Call after dropping or destroying the first one.
    pub async fn restart(&self) -> Self {
        Self::assemble(
            self.config.clone(),
            self.backend.clone(),
            self.remote.clone(),
            self.network.clone(),
            self.clock.clone(),
        )
        .await
    }

    async fn assemble(
        config: SyncConfig,
        backend: Arc<MemoryBackend>,
        remote: Arc<MemoryRemoteStore>,
        network: NetworkMonitor,
        clock: ManualClock,
    ) -> Self {
        let ctx = EngineContext::with_backend(
            config.clone(),
            backend.clone(),
            remote.clone(),
            network.clone(),
            Arc::new(clock.clone()),
        )
        .await
        .expect("engine context opens over memory backend");
        Self {
            engine: OfflineEngine::new(Arc::new(ctx)),
            remote,
            backend,
            network,
            clock,
            config,
        }
    }

    /// Live document of `session` as the remote currently holds it.
    pub fn remote_live(&self, session: &SessionId) -> Option<serde_json::Value> {
        self.remote
            .document(&taskroom_core::live_session_path(session))
    }

    pub async fn pending_count(&self) -> u32 {
        self.engine
            .sync_status()
            .await
            .expect("engine running")
            .pending_count
    }

    /// Poll the sync status until `check` holds.
    pub async fn wait_for_status(
        &self,
        what: &str,
        check: impl Fn(&SyncStatus) -> bool,
    ) -> SyncStatus {
        for _ in 0..POLL_ROUNDS {
            let status = self.engine.sync_status().await.expect("engine running");
            if check(&status) {
                return status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("sync status never satisfied: {what}");
    }
}

// ============================================================================
// OBSERVER RECORDERS
// ============================================================================

const POLL_ROUNDS: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Collects every value an observer callback receives.
#[derive(Debug)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, value: T) {
        self.events.lock().expect("recorder lock").push(value);
    }

    pub fn all(&self) -> Vec<T> {
        self.events.lock().expect("recorder lock").clone()
    }

    pub fn last(&self) -> Option<T> {
        self.events.lock().expect("recorder lock").last().cloned()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("recorder lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register a task observer that records every delivered list.
pub fn record_tasks(engine: &OfflineEngine) -> (Recorder<Vec<Task>>, ObserverGuard) {
    let recorder = Recorder::default();
    let sink = recorder.clone();
    let guard = engine.on_tasks_changed(move |tasks| sink.push(tasks.to_vec()));
    (recorder, guard)
}

/// Register a status observer that records every delivered status.
pub fn record_status(engine: &OfflineEngine) -> (Recorder<SyncStatus>, ObserverGuard) {
    let recorder = Recorder::default();
    let sink = recorder.clone();
    let guard = engine.on_sync_status_changed(move |status| sink.push(status.clone()));
    (recorder, guard)
}

/// Poll a synchronous condition, yielding to the runtime between checks.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..POLL_ROUNDS {
        if check() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("condition never held: {what}");
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for engine usage errors.

    use super::*;

    #[track_caller]
    pub fn assert_not_initialized<T: std::fmt::Debug>(result: &Result<T, UsageError>) {
        match result {
            Err(UsageError::NotInitialized { .. }) => {}
            other => panic!("Expected NotInitialized, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_session_conflict<T: std::fmt::Debug>(
        result: &Result<T, UsageError>,
        active: &SessionId,
    ) {
        match result {
            Err(UsageError::SessionConflict { active: a, .. }) => {
                assert_eq!(a, active, "Wrong active session in conflict");
            }
            other => panic!("Expected SessionConflict, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_task_id<T: std::fmt::Debug>(result: &Result<T, UsageError>) {
        match result {
            Err(UsageError::InvalidTaskId { .. }) => {}
            other => panic!("Expected InvalidTaskId, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_session_id<T: std::fmt::Debug>(result: &Result<T, UsageError>) {
        match result {
            Err(UsageError::InvalidSessionId { .. }) => {}
            other => panic!("Expected InvalidSessionId, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_live_state_tasks_match_status_map(live in arb_live_state()) {
            let tasks = live.tasks();
            prop_assert_eq!(tasks.len(), live.task_status_map.len());
            for task in tasks {
                prop_assert_eq!(live.task_status_map[&task.task_id].status, task.status);
            }
        }
    }

    #[test]
    fn test_recorder_keeps_order() {
        let recorder = Recorder::default();
        recorder.push(1);
        recorder.push(2);
        assert_eq!(recorder.all(), vec![1, 2]);
        assert_eq!(recorder.last(), Some(2));
    }
}
