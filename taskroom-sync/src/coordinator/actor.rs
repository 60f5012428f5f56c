//! The coordinator actor loop and its handlers.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Map;
use taskroom_core::{
    live_session_path, FinalizeError, LiveSessionState, NewOperation, PendingOperation,
    RemoteError, SessionId, SyncStatus, Task, UsageError, LIVE_SESSIONS_COLLECTION,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::observers::{ObserverRegistry, Removed};
use super::state::CoordinatorState;
use super::{Command, DrainOutcome, DrainReport};
use crate::context::{live_state_key, tasks_store_name, EngineContext};
use crate::network::{NetworkTransition, NetworkWatcher};
use crate::remote::{CollectionSnapshot, SnapshotStream, SubscriptionFilter};

enum Event {
    Command(Option<Command>),
    Snapshot(Option<CollectionSnapshot>),
    Network(Option<NetworkTransition>),
    Heartbeat,
}

enum WriteOutcome {
    Acked,
    Failed(RemoteError),
    Cancelled,
}

pub(crate) struct CoordinatorActor {
    ctx: Arc<EngineContext>,
    state: CoordinatorState,
    /// Confirmed remote state with pending operations applied on top.
    live: Option<LiveSessionState>,
    observers: ObserverRegistry,
    subscription: Option<SnapshotStream>,
    /// Set when the last task observer left; cleared by a new one.
    subscription_released: bool,
    network: NetworkWatcher,
    network_open: bool,
    status: SyncStatus,
    last_published: Option<SyncStatus>,
    heartbeat_failures: u32,
    heartbeat_paused: bool,
    cancel: watch::Receiver<u64>,
}

async fn next_snapshot(subscription: &mut Option<SnapshotStream>) -> Option<CollectionSnapshot> {
    match subscription {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn attempt_write(
    ctx: &EngineContext,
    operation: &NewOperation,
    cancel: &mut watch::Receiver<u64>,
) -> WriteOutcome {
    let path = live_session_path(&operation.session_id);
    let fields = match operation.remote_fields() {
        Ok(fields) => fields,
        Err(e) => {
            return WriteOutcome::Failed(RemoteError::Rejected {
                path,
                reason: e.to_string(),
            })
        }
    };
    let timeout = ctx.config.write_timeout();

    tokio::select! {
        biased;
        _ = cancel.changed() => WriteOutcome::Cancelled,
        result = tokio::time::timeout(timeout, ctx.remote.write_field(&path, fields)) => {
            match result {
                Ok(Ok(())) => WriteOutcome::Acked,
                Ok(Err(e)) => WriteOutcome::Failed(e),
                Err(_) => WriteOutcome::Failed(RemoteError::Timeout { after: timeout }),
            }
        }
    }
}

/// One replay step under the retry policy.
async fn replay(
    ctx: &EngineContext,
    operation: &PendingOperation,
    cancel: &mut watch::Receiver<u64>,
) -> WriteOutcome {
    let policy = &ctx.config.drain_retry;
    let mut attempt = 1;
    loop {
        match attempt_write(ctx, &operation.operation, cancel).await {
            WriteOutcome::Failed(e) if attempt < policy.attempts_per_pass => {
                let backoff = policy.backoff_for(attempt);
                tracing::debug!(
                    operation_id = %operation.id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Replay attempt failed, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.changed() => return WriteOutcome::Cancelled,
                    _ = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

impl CoordinatorActor {
    pub(crate) fn new(ctx: Arc<EngineContext>, cancel: watch::Receiver<u64>) -> Self {
        let network = ctx.network.subscribe();
        let status = SyncStatus {
            is_online: network.is_online(),
            ..SyncStatus::default()
        };
        Self {
            ctx,
            state: CoordinatorState::Idle,
            live: None,
            observers: ObserverRegistry::default(),
            subscription: None,
            subscription_released: false,
            network,
            network_open: true,
            status,
            last_published: None,
            heartbeat_failures: 0,
            heartbeat_paused: false,
            cancel,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let period = self.ctx.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            heartbeat_interval_ms = period.as_millis() as u64,
            write_timeout_ms = self.ctx.config.write_timeout_ms,
            "Sync coordinator started"
        );

        loop {
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                snapshot = next_snapshot(&mut self.subscription) => Event::Snapshot(snapshot),
                transition = self.network.next_transition(), if self.network_open => {
                    Event::Network(transition)
                }
                _ = heartbeat.tick() => Event::Heartbeat,
            };

            match event {
                Event::Command(Some(command)) => self.handle(command).await,
                Event::Command(None) => break,
                Event::Snapshot(Some(snapshot)) => self.on_snapshot(snapshot).await,
                Event::Snapshot(None) => {
                    tracing::warn!(state = %self.state, "Remote subscription ended");
                    self.subscription = None;
                }
                Event::Network(Some(transition)) => self.on_network(transition).await,
                Event::Network(None) => self.network_open = false,
                Event::Heartbeat => self.on_heartbeat().await,
            }
        }

        self.subscription = None;
        tracing::info!(state = %self.state, "Sync coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Initialize { session_id, reply } => {
                let result = self.initialize(session_id).await;
                let _ = reply.send(result);
            }
            Command::Destroy { reply } => {
                self.teardown("destroy");
                let _ = reply.send(());
            }
            Command::Join { payload, reply } => {
                let result = self
                    .submit("join", |session_id| NewOperation::join(session_id, &payload))
                    .await;
                let _ = reply.send(result);
            }
            Command::RecordStatus { update, reply } => {
                let result = self
                    .submit("record_status", |session_id| {
                        NewOperation::record_status(session_id, &update)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::AddTaskObserver { id, callback } => {
                let count = self.observers.add_task(id, callback);
                if let Some(live) = &self.live {
                    self.observers.notify_task_observer(id, &live.tasks());
                }
                if count == 1 && self.subscription_released {
                    self.subscription_released = false;
                    self.ensure_subscription().await;
                }
            }
            Command::AddStatusObserver { id, callback } => {
                self.observers.add_status(id, callback);
                self.observers.notify_status_observer(id, &self.status);
            }
            Command::RemoveObserver { id } => {
                if let Removed::Task { remaining: 0 } = self.observers.remove(id) {
                    if self.state.is_active() {
                        self.subscription_released = true;
                    }
                    // Held until the first snapshot ends initialization.
                    if !matches!(self.state, CoordinatorState::Initializing { .. }) {
                        self.release_subscription();
                    }
                }
            }
            Command::ForceReload { reply } => {
                let result = match self.require_session("force_reload_from_cache") {
                    Ok(session_id) => Ok(self
                        .ctx
                        .store
                        .get_collection::<Task>(&tasks_store_name(&session_id))
                        .await),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Drain { reply } => {
                let report = self.drain().await;
                let _ = reply.send(report);
            }
            Command::PrepareFinalize { session_id, reply } => {
                let result = self.prepare_finalize(&session_id).await;
                let _ = reply.send(result);
            }
            Command::FinishFinalize { session_id, reply } => {
                self.purge_session(&session_id).await;
                if self.state.session_id() == Some(&session_id) {
                    self.teardown("finalized");
                }
                let _ = reply.send(());
            }
            Command::ForgetMe { reply } => {
                let result = match self.require_session("forget_me") {
                    Ok(session_id) => {
                        self.purge_session(&session_id).await;
                        self.teardown("forget_me");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    fn release_subscription(&mut self) {
        if self.subscription.take().is_some() {
            tracing::info!("Last task observer left, closed remote subscription");
        }
    }

    /// Drain the session's queue before its live state is finalized.
    ///
    /// Anything still queued afterwards would be missing from the record and
    /// then purged with the session, so it is reported instead.
    async fn prepare_finalize(&mut self, session_id: &SessionId) -> Result<(), FinalizeError> {
        if self.state.session_id() == Some(session_id) && self.ctx.network.is_online() {
            let report = self.drain().await;
            tracing::debug!(session_id = %session_id, ?report, "Drained before finalize");
        }
        let pending = self
            .ctx
            .queue
            .count_for_session(session_id)
            .await
            .map_err(|source| FinalizeError::QueueUnreadable {
                session_id: session_id.clone(),
                source,
            })?;
        if pending > 0 {
            tracing::warn!(session_id = %session_id, pending, "Refusing to finalize with pending operations");
            return Err(FinalizeError::PendingWrites {
                session_id: session_id.clone(),
                pending,
            });
        }
        Ok(())
    }

    fn require_session(&self, operation: &'static str) -> Result<SessionId, UsageError> {
        self.state
            .session_id()
            .cloned()
            .ok_or(UsageError::NotInitialized { operation })
    }

    async fn initialize(&mut self, session_id: SessionId) -> Result<(), UsageError> {
        if let Some(active) = self.state.session_id() {
            if *active == session_id {
                tracing::debug!(session_id = %session_id, "Already initialized for session");
                return Ok(());
            }
            return Err(UsageError::SessionConflict {
                active: active.clone(),
                requested: session_id,
            });
        }

        self.state.advance(CoordinatorState::Initializing {
            session_id: session_id.clone(),
        });
        self.subscription_released = false;
        self.heartbeat_failures = 0;
        self.heartbeat_paused = false;

        self.ctx.store.sweep_expired().await;
        self.live = self.ctx.store.get(&live_state_key(&session_id)).await;
        if let Some(live) = &self.live {
            self.observers.notify_tasks(&live.tasks());
        }

        self.status.is_online = self.ctx.network.is_online();
        self.status.is_syncing = true;
        self.refresh_pending().await;
        self.publish_status();

        tracing::info!(
            session_id = %session_id,
            cached = self.live.is_some(),
            pending = self.status.pending_count,
            "Initializing sync coordinator"
        );

        if self.status.is_online && self.status.pending_count > 0 {
            self.drain().await;
        }
        self.ensure_subscription().await;
        Ok(())
    }

    fn teardown(&mut self, reason: &'static str) {
        let Some(session_id) = self.state.session_id().cloned() else {
            tracing::debug!(reason, state = %self.state, "Teardown with no active session");
            return;
        };

        self.subscription = None;
        self.subscription_released = false;
        self.live = None;
        self.status.is_syncing = false;
        self.status.pending_count = 0;
        self.publish_status();
        self.observers.clear();
        self.state.advance(CoordinatorState::TornDown);

        tracing::info!(session_id = %session_id, reason, "Sync coordinator torn down");
    }

    async fn ensure_subscription(&mut self) {
        let Some(session_id) = self.state.session_id().cloned() else {
            return;
        };
        if self.subscription.is_some() || self.subscription_released {
            return;
        }

        let filter = SubscriptionFilter::field_equals(
            LIVE_SESSIONS_COLLECTION,
            "sessionId",
            session_id.as_str(),
        );
        match self.ctx.remote.subscribe(filter).await {
            Ok(stream) => {
                self.subscription = Some(stream);
                tracing::info!(session_id = %session_id, "Opened remote subscription");
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to open remote subscription, will retry when online"
                );
            }
        }
    }

    /// Build an operation for the active session and write it.
    async fn submit(
        &mut self,
        operation: &'static str,
        build: impl FnOnce(SessionId) -> serde_json::Result<NewOperation>,
    ) -> Result<bool, UsageError> {
        let session_id = self.require_session(operation)?;
        match build(session_id.clone()) {
            Ok(op) => Ok(self.write(&session_id, op).await),
            Err(e) => {
                tracing::warn!(operation, error = %e, "Failed to encode operation");
                Ok(false)
            }
        }
    }

    /// Optimistic write: apply locally, try the remote, queue on any failure.
    ///
    /// The caller is told the intent was accepted whether or not the remote
    /// write has happened yet. Returns `false` only when the remote did not
    /// acknowledge it and it could not be queued either.
    async fn write(&mut self, session_id: &SessionId, operation: NewOperation) -> bool {
        self.apply_locally(session_id, &operation).await;

        let queued = match self.ctx.queue.count_for_session(session_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read pending queue, queueing write");
                1
            }
        };

        if self.ctx.network.is_online() && queued == 0 {
            let mut cancel = self.cancel.clone();
            cancel.borrow_and_update();
            match attempt_write(&self.ctx, &operation, &mut cancel).await {
                WriteOutcome::Acked => {
                    self.status.last_synced_at = Some(self.ctx.clock.now());
                    self.publish_status();
                    tracing::debug!(
                        session_id = %session_id,
                        kind = ?operation.kind,
                        target_id = %operation.target_id,
                        "Remote write acknowledged"
                    );
                    return true;
                }
                WriteOutcome::Failed(e) => {
                    tracing::debug!(error = %e, "Remote write failed, queueing");
                }
                WriteOutcome::Cancelled => {
                    tracing::debug!("Remote write interrupted, queueing");
                }
            }
        }

        let accepted = match self.ctx.queue.enqueue(operation).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to persist pending operation, write not accepted"
                );
                false
            }
        };
        self.refresh_pending().await;
        self.publish_status();
        accepted
    }

    async fn apply_locally(&mut self, session_id: &SessionId, operation: &NewOperation) {
        match operation.apply_to(self.live.clone()) {
            Ok(Some(next)) => self.set_live(session_id, Some(next)).await,
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "No live state yet, local view unchanged");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to apply operation locally");
            }
        }
    }

    /// Replace the live view, persist it and fan it out.
    async fn set_live(&mut self, session_id: &SessionId, live: Option<LiveSessionState>) {
        let tasks = live.as_ref().map(LiveSessionState::tasks).unwrap_or_default();
        let key = live_state_key(session_id);
        match &live {
            Some(state) => self.ctx.store.put(&key, state).await,
            None => self.ctx.store.remove(&key).await,
        }
        self.ctx
            .store
            .put_collection(&tasks_store_name(session_id), &tasks)
            .await;
        self.live = live;
        self.observers.notify_tasks(&tasks);
    }

    /// Replay the active session's queue oldest first, stopping at the first
    /// failure. Operations leave the queue only once acknowledged.
    async fn drain(&mut self) -> DrainReport {
        let Some(session_id) = self.state.session_id().cloned() else {
            return DrainReport {
                replayed: 0,
                remaining: 0,
                outcome: DrainOutcome::Inactive,
            };
        };
        if !self.ctx.network.is_online() {
            return DrainReport {
                replayed: 0,
                remaining: self.refresh_pending().await,
                outcome: DrainOutcome::Offline,
            };
        }

        let pending = match self.ctx.queue.list_for_session(&session_id).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to read pending queue");
                return DrainReport {
                    replayed: 0,
                    remaining: self.status.pending_count,
                    outcome: DrainOutcome::Failed,
                };
            }
        };
        if pending.is_empty() {
            return DrainReport {
                replayed: 0,
                remaining: self.refresh_pending().await,
                outcome: DrainOutcome::Completed,
            };
        }

        let was_subscribed = matches!(self.state, CoordinatorState::Subscribed { .. });
        if was_subscribed {
            self.state.advance(CoordinatorState::Syncing {
                session_id: session_id.clone(),
            });
        }
        self.status.is_syncing = true;
        self.publish_status();
        tracing::info!(session_id = %session_id, pending = pending.len(), "Draining pending queue");

        let mut cancel = self.cancel.clone();
        cancel.borrow_and_update();
        let mut replayed = 0;
        let mut outcome = DrainOutcome::Completed;

        for operation in &pending {
            match replay(&self.ctx, operation, &mut cancel).await {
                WriteOutcome::Acked => {
                    if let Err(e) = self.ctx.queue.remove(operation.id).await {
                        tracing::warn!(operation_id = %operation.id, error = %e, "Failed to remove replayed operation");
                    }
                    replayed += 1;
                    self.status.last_synced_at = Some(self.ctx.clock.now());
                    tracing::debug!(
                        operation_id = %operation.id,
                        kind = ?operation.kind(),
                        target_id = operation.target_id(),
                        "Replayed pending operation"
                    );
                }
                WriteOutcome::Failed(e) => {
                    let retry_count = self.ctx.queue.record_failure(operation.id).await;
                    tracing::warn!(
                        operation_id = %operation.id,
                        retry_count = ?retry_count.ok().flatten(),
                        error = %e,
                        "Replay failed, stopping drain"
                    );
                    outcome = DrainOutcome::Failed;
                    break;
                }
                WriteOutcome::Cancelled => {
                    tracing::info!(operation_id = %operation.id, "Drain interrupted by teardown");
                    outcome = DrainOutcome::Cancelled;
                    break;
                }
            }
        }

        if was_subscribed {
            self.state.advance(CoordinatorState::Subscribed {
                session_id: session_id.clone(),
            });
        }
        self.status.is_syncing = matches!(self.state, CoordinatorState::Initializing { .. });
        let remaining = self.refresh_pending().await;
        self.publish_status();

        DrainReport {
            replayed,
            remaining,
            outcome,
        }
    }

    async fn on_snapshot(&mut self, snapshot: CollectionSnapshot) {
        let Some(session_id) = self.state.session_id().cloned() else {
            return;
        };
        let path = live_session_path(&session_id);

        let document = snapshot.documents.into_iter().find(|doc| doc.path == path);
        let decoded = match document {
            Some(doc) => match serde_json::from_value::<LiveSessionState>(doc.data) {
                Ok(confirmed) => Some(Some(confirmed)),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Ignoring undecodable live document");
                    None
                }
            },
            None => Some(None),
        };

        if let Some(confirmed) = decoded {
            let pending = match self.ctx.queue.list_for_session(&session_id).await {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read pending queue for overlay");
                    Vec::new()
                }
            };
            let mut merged = confirmed;
            for operation in &pending {
                match operation.operation.apply_to(merged.clone()) {
                    Ok(next) => merged = next,
                    Err(e) => {
                        tracing::warn!(operation_id = %operation.id, error = %e, "Skipping undecodable pending operation in overlay");
                    }
                }
            }
            self.set_live(&session_id, merged).await;
        }

        if matches!(self.state, CoordinatorState::Initializing { .. }) {
            self.state.advance(CoordinatorState::Subscribed {
                session_id: session_id.clone(),
            });
            tracing::info!(session_id = %session_id, "First remote snapshot received");
            if self.subscription_released {
                self.release_subscription();
            }
        }
        self.status.is_syncing = false;
        self.status.last_synced_at = Some(self.ctx.clock.now());
        self.publish_status();
    }

    async fn on_network(&mut self, transition: NetworkTransition) {
        match transition {
            NetworkTransition::Online => {
                self.status.is_online = true;
                self.heartbeat_failures = 0;
                self.heartbeat_paused = false;
                self.publish_status();
                if self.state.is_active() {
                    let report = self.drain().await;
                    tracing::debug!(?report, "Drained after coming online");
                    self.ensure_subscription().await;
                }
            }
            NetworkTransition::Offline => {
                self.status.is_online = false;
                self.publish_status();
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        let session_id = match &self.state {
            CoordinatorState::Initializing { session_id }
            | CoordinatorState::Subscribed { session_id }
            | CoordinatorState::Syncing { session_id } => session_id.clone(),
            CoordinatorState::Idle | CoordinatorState::TornDown => return,
        };
        if !self.ctx.network.is_online() {
            return;
        }

        if !self.heartbeat_paused && self.live.is_some() {
            self.send_heartbeat(&session_id).await;
        }
        if self.status.pending_count > 0 {
            let report = self.drain().await;
            tracing::debug!(?report, "Heartbeat drain");
        }
    }

    /// Fire-and-forget presence write. Failures are counted, never queued.
    async fn send_heartbeat(&mut self, session_id: &SessionId) {
        let mut fields = Map::new();
        match serde_json::to_value(self.ctx.clock.now()) {
            Ok(now) => {
                fields.insert("lastSeenAt".to_string(), now);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode heartbeat timestamp");
                return;
            }
        }

        let timeout = self.ctx.config.write_timeout();
        let path = live_session_path(session_id);
        let error = match tokio::time::timeout(timeout, self.ctx.remote.write_field(&path, fields)).await {
            Ok(Ok(())) => {
                self.heartbeat_failures = 0;
                tracing::trace!(session_id = %session_id, "Heartbeat sent");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => RemoteError::Timeout { after: timeout },
        };

        self.heartbeat_failures += 1;
        tracing::trace!(
            session_id = %session_id,
            failures = self.heartbeat_failures,
            error = %error,
            "Heartbeat failed"
        );
        if self.heartbeat_failures >= self.ctx.config.heartbeat_max_failures {
            self.heartbeat_paused = true;
            tracing::warn!(
                session_id = %session_id,
                failures = self.heartbeat_failures,
                "Pausing heartbeats until the next online transition"
            );
        }
    }

    async fn purge_session(&mut self, session_id: &SessionId) {
        self.ctx.store.remove(&live_state_key(session_id)).await;
        self.ctx
            .store
            .remove_collection(&tasks_store_name(session_id))
            .await;
        match self.ctx.queue.purge_session(session_id).await {
            Ok(purged) => {
                tracing::info!(session_id = %session_id, purged, "Purged local session data");
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to purge pending operations");
            }
        }
    }

    async fn refresh_pending(&mut self) -> u32 {
        let Some(session_id) = self.state.session_id().cloned() else {
            self.status.pending_count = 0;
            return 0;
        };
        match self.ctx.queue.count_for_session(&session_id).await {
            Ok(count) => self.status.pending_count = count,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to count pending operations");
            }
        }
        self.status.pending_count
    }

    /// Broadcast the status if it changed since the last broadcast.
    fn publish_status(&mut self) {
        if self.last_published.as_ref() == Some(&self.status) {
            return;
        }
        self.observers.notify_status(&self.status);
        self.last_published = Some(self.status.clone());
    }
}
