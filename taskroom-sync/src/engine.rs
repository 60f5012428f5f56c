//! The offline sync engine facade used by the UI layer.
//!
//! Owns one coordinator actor and one finalizer over a shared
//! [`EngineContext`]. Several engines with separate contexts can run side by
//! side in one process.

use std::sync::Arc;

use taskroom_core::{
    FinalizedSessionRecord, JoinPayload, SessionId, StatusUpdate, SyncConfig, SyncStatus, Task,
    TaskId, TaskStatus, TaskroomResult, UsageError,
};

use crate::context::EngineContext;
use crate::coordinator::{CoordinatorHandle, CoordinatorState, DrainReport, ObserverGuard};
use crate::finalizer::Finalizer;
use crate::network::NetworkMonitor;
use crate::remote::RemoteStore;

pub struct OfflineEngine {
    ctx: Arc<EngineContext>,
    coordinator: CoordinatorHandle,
    finalizer: Finalizer,
}

impl OfflineEngine {
    /// Start an engine over an already opened context.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let finalizer = Finalizer::new(
            ctx.remote.clone(),
            ctx.clock.clone(),
            ctx.config.record_retention(),
            ctx.config.write_timeout(),
        );
        let coordinator = CoordinatorHandle::spawn(ctx.clone());
        Self {
            ctx,
            coordinator,
            finalizer,
        }
    }

    /// Open the local store described by `config` and start an engine.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
    ) -> TaskroomResult<Self> {
        let ctx = EngineContext::open(config, remote, network).await?;
        Ok(Self::new(Arc::new(ctx)))
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.ctx.network
    }

    /// Bind the engine to a session: load the cached view, replay pending
    /// work if online and subscribe to remote changes.
    ///
    /// Idempotent for the same session. Fails with
    /// [`UsageError::SessionConflict`] while another session is active.
    pub async fn initialize(&self, session_id: SessionId) -> Result<(), UsageError> {
        session_id.validate()?;
        self.coordinator.initialize(session_id).await
    }

    /// Unbind from the active session. Pending operations stay queued.
    pub async fn destroy(&self) -> Result<(), UsageError> {
        self.coordinator.destroy().await
    }

    pub fn on_tasks_changed<F>(&self, callback: F) -> ObserverGuard
    where
        F: Fn(&[Task]) + Send + Sync + 'static,
    {
        self.coordinator.on_tasks_changed(Arc::new(callback))
    }

    pub fn on_sync_status_changed<F>(&self, callback: F) -> ObserverGuard
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.coordinator.on_sync_status_changed(Arc::new(callback))
    }

    pub async fn join(&self, display_name: impl Into<String>) -> Result<bool, UsageError> {
        let payload = JoinPayload {
            display_name: display_name.into(),
            joined_at: self.ctx.clock.now(),
        };
        self.coordinator.join(payload).await
    }

    /// Record a task status change.
    ///
    /// Returns `true` once the intent is durable: written remotely or queued.
    /// The UI must not distinguish the two. `false` means neither happened,
    /// for example when the local store is full.
    pub async fn record_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        comment: Option<String>,
    ) -> Result<bool, UsageError> {
        let update = StatusUpdate {
            task_id: TaskId::parse(task_id)?,
            status,
            comment,
            recorded_at: self.ctx.clock.now(),
        };
        self.coordinator.record_status(update).await
    }

    /// Task list as last persisted locally, without touching the network.
    pub async fn force_reload_from_cache(&self) -> Result<Vec<Task>, UsageError> {
        self.coordinator.force_reload_from_cache().await
    }

    /// Replay pending operations now instead of waiting for the next
    /// online transition or heartbeat.
    pub async fn drain_now(&self) -> Result<DrainReport, UsageError> {
        self.coordinator.drain().await
    }

    /// Convert a session's live state into its finalized record.
    ///
    /// Pending operations of the active session are flushed first; if any
    /// remain queued the call fails with [`FinalizeError::PendingWrites`]
    /// without touching the remote. Local data for the session is purged
    /// only when the finalize succeeds.
    ///
    /// [`FinalizeError::PendingWrites`]: taskroom_core::FinalizeError::PendingWrites
    pub async fn finalize_session(
        &self,
        session_id: &SessionId,
    ) -> TaskroomResult<Option<FinalizedSessionRecord>> {
        session_id.validate()?;
        self.coordinator.prepare_finalize(session_id.clone()).await?;
        let record = self.finalizer.finalize(session_id).await?;
        if record.is_some() {
            self.coordinator.finish_finalize(session_id.clone()).await?;
        }
        Ok(record)
    }

    /// Erase everything stored locally for the active session and tear down.
    pub async fn forget_me(&self) -> Result<(), UsageError> {
        self.coordinator.forget_me().await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, UsageError> {
        self.coordinator.status().await
    }

    pub async fn state(&self) -> Result<CoordinatorState, UsageError> {
        self.coordinator.state().await
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }
}
