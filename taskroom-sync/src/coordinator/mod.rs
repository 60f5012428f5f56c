//! Sync coordinator.
//!
//! One actor task owns the coordinator state. Commands from the UI handle,
//! remote snapshots, network transitions and heartbeat ticks are all
//! serialized through its `select!` loop, so no two mutations of the local
//! store or pending queue ever interleave.
//!
//! The handle talks to the actor over an unbounded channel with `oneshot`
//! replies. Teardown bumps a cancellation epoch first so a drain stuck on a
//! slow remote write gives up without removing the unacknowledged operation.

mod actor;
mod observers;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use taskroom_core::{
    FinalizeError, JoinPayload, SessionId, StatusUpdate, SyncStatus, Task, TaskroomResult,
    UsageError,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::context::EngineContext;

pub use observers::{ObserverId, StatusCallback, TaskCallback};
pub use state::CoordinatorState;

/// How a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every queued operation of the session was acknowledged.
    Completed,
    /// An operation failed; it and everything after it stay queued.
    Failed,
    /// Teardown interrupted the pass.
    Cancelled,
    /// Offline, so nothing was attempted.
    Offline,
    /// No active session.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub remaining: u32,
    pub outcome: DrainOutcome,
}

pub(crate) enum Command {
    Initialize {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), UsageError>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    Join {
        payload: JoinPayload,
        reply: oneshot::Sender<Result<bool, UsageError>>,
    },
    RecordStatus {
        update: StatusUpdate,
        reply: oneshot::Sender<Result<bool, UsageError>>,
    },
    AddTaskObserver {
        id: ObserverId,
        callback: TaskCallback,
    },
    AddStatusObserver {
        id: ObserverId,
        callback: StatusCallback,
    },
    RemoveObserver {
        id: ObserverId,
    },
    ForceReload {
        reply: oneshot::Sender<Result<Vec<Task>, UsageError>>,
    },
    Drain {
        reply: oneshot::Sender<DrainReport>,
    },
    PrepareFinalize {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), FinalizeError>>,
    },
    FinishFinalize {
        session_id: SessionId,
        reply: oneshot::Sender<()>,
    },
    ForgetMe {
        reply: oneshot::Sender<Result<(), UsageError>>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    State {
        reply: oneshot::Sender<CoordinatorState>,
    },
}

/// Handle to a running coordinator actor.
///
/// Dropping every handle closes the command channel and the actor exits.
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: watch::Sender<u64>,
    next_observer: AtomicU64,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(ctx: Arc<EngineContext>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(0u64);
        let actor = actor::CoordinatorActor::new(ctx, cancel_rx);
        let task = tokio::spawn(actor.run(rx));
        Self {
            commands,
            cancel,
            next_observer: AtomicU64::new(1),
            task,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, UsageError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| UsageError::EngineStopped)?;
        rx.await.map_err(|_| UsageError::EngineStopped)
    }

    /// Interrupt an in-flight drain or direct write.
    fn cancel_in_flight(&self) {
        self.cancel.send_modify(|epoch| *epoch += 1);
    }

    pub async fn initialize(&self, session_id: SessionId) -> Result<(), UsageError> {
        self.request(|reply| Command::Initialize { session_id, reply })
            .await?
    }

    pub async fn destroy(&self) -> Result<(), UsageError> {
        self.cancel_in_flight();
        self.request(|reply| Command::Destroy { reply }).await
    }

    pub async fn join(&self, payload: JoinPayload) -> Result<bool, UsageError> {
        self.request(|reply| Command::Join { payload, reply }).await?
    }

    pub async fn record_status(&self, update: StatusUpdate) -> Result<bool, UsageError> {
        self.request(|reply| Command::RecordStatus { update, reply })
            .await?
    }

    pub fn on_tasks_changed(&self, callback: TaskCallback) -> ObserverGuard {
        let id = self.next_id();
        let _ = self.commands.send(Command::AddTaskObserver { id, callback });
        ObserverGuard::new(id, &self.commands)
    }

    pub fn on_sync_status_changed(&self, callback: StatusCallback) -> ObserverGuard {
        let id = self.next_id();
        let _ = self.commands.send(Command::AddStatusObserver { id, callback });
        ObserverGuard::new(id, &self.commands)
    }

    pub async fn force_reload_from_cache(&self) -> Result<Vec<Task>, UsageError> {
        self.request(|reply| Command::ForceReload { reply }).await?
    }

    pub async fn drain(&self) -> Result<DrainReport, UsageError> {
        self.request(|reply| Command::Drain { reply }).await
    }

    /// Flush the session's queue. Fails while any of its operations remain
    /// unacknowledged.
    pub(crate) async fn prepare_finalize(&self, session_id: SessionId) -> TaskroomResult<()> {
        self.request(|reply| Command::PrepareFinalize { session_id, reply })
            .await??;
        Ok(())
    }

    pub(crate) async fn finish_finalize(&self, session_id: SessionId) -> Result<(), UsageError> {
        self.cancel_in_flight();
        self.request(|reply| Command::FinishFinalize { session_id, reply })
            .await
    }

    pub async fn forget_me(&self) -> Result<(), UsageError> {
        self.cancel_in_flight();
        self.request(|reply| Command::ForgetMe { reply }).await?
    }

    pub async fn status(&self) -> Result<SyncStatus, UsageError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn state(&self) -> Result<CoordinatorState, UsageError> {
        self.request(|reply| Command::State { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registration of an observer. Unsubscribes when dropped.
///
/// Holds only a weak reference to the command channel, so outstanding
/// guards do not keep a dropped engine's actor alive.
#[must_use = "dropping the guard unsubscribes the observer"]
pub struct ObserverGuard {
    id: ObserverId,
    commands: Option<mpsc::WeakUnboundedSender<Command>>,
}

impl ObserverGuard {
    fn new(id: ObserverId, commands: &mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            commands: Some(commands.downgrade()),
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(commands) = self.commands.take().and_then(|weak| weak.upgrade()) {
            let _ = commands.send(Command::RemoveObserver { id: self.id });
        }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ObserverGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGuard")
            .field("id", &self.id)
            .field("active", &self.commands.is_some())
            .finish()
    }
}
