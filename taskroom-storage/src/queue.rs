//! Durable FIFO queue of remote writes that have not been acknowledged.
//!
//! Each operation is stored under a queue-kind key whose name is its
//! zero-padded sequence number, so backend key order is enqueue order and
//! a prefix scan replays the queue oldest first. The sequence counter is
//! restored from the highest persisted slot when the queue is opened.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use taskroom_core::{
    Clock, NewOperation, OperationId, PendingOperation, SessionId, StorageError, StorageResult,
};

use crate::cache::{CacheBackend, KeyKind, NamespacedKey};

const SEQUENCE_WIDTH: usize = 20;

pub struct PendingQueue {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    clock: Arc<dyn Clock>,
    next_sequence: AtomicU64,
}

impl PendingQueue {
    /// Open the queue stored under `namespace`.
    pub async fn open(
        backend: Arc<dyn CacheBackend>,
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let namespace = namespace.into();
        let prefix = NamespacedKey::kind_prefix(&namespace, KeyKind::Queue);
        let highest = backend
            .scan_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|(key, _)| parse_sequence(key))
            .max();
        let next = highest.map_or(0, |seq| seq + 1);
        tracing::debug!(namespace = %namespace, next_sequence = next, "Opened pending queue");

        Ok(Self {
            backend,
            namespace,
            clock,
            next_sequence: AtomicU64::new(next),
        })
    }

    /// Persist a new operation at the tail. Durable once this returns.
    pub async fn enqueue(&self, operation: NewOperation) -> StorageResult<OperationId> {
        let id = OperationId::now_v7();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let pending = PendingOperation::new(id, operation, self.clock.now());
        let bytes = serde_json::to_vec(&pending).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;

        self.backend.write(&self.slot_key(sequence), &bytes).await?;
        tracing::debug!(
            operation_id = %id,
            sequence,
            kind = ?pending.kind(),
            session_id = %pending.session_id(),
            "Enqueued pending operation"
        );
        Ok(id)
    }

    /// Every pending operation, oldest first.
    pub async fn list_pending(&self) -> StorageResult<Vec<PendingOperation>> {
        Ok(self
            .slots()
            .await?
            .into_iter()
            .map(|(_, op)| op)
            .collect())
    }

    pub async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> StorageResult<Vec<PendingOperation>> {
        Ok(self
            .list_pending()
            .await?
            .into_iter()
            .filter(|op| op.session_id() == session_id)
            .collect())
    }

    pub async fn count_for_session(&self, session_id: &SessionId) -> StorageResult<u32> {
        Ok(self.list_for_session(session_id).await?.len() as u32)
    }

    /// Remove an acknowledged operation. Returns whether it was queued.
    pub async fn remove(&self, id: OperationId) -> StorageResult<bool> {
        for (key, op) in self.slots().await? {
            if op.id == id {
                return self.backend.delete(&key).await;
            }
        }
        Ok(false)
    }

    /// Increment an operation's retry count. Returns the new count, or
    /// `None` if the operation is no longer queued.
    pub async fn record_failure(&self, id: OperationId) -> StorageResult<Option<u32>> {
        for (key, mut op) in self.slots().await? {
            if op.id != id {
                continue;
            }
            op.retry_count += 1;
            let bytes = serde_json::to_vec(&op).map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
            self.backend.write(&key, &bytes).await?;
            return Ok(Some(op.retry_count));
        }
        Ok(None)
    }

    /// Drop every queued operation of a session. Returns how many were removed.
    pub async fn purge_session(&self, session_id: &SessionId) -> StorageResult<u64> {
        let mut purged = 0u64;
        for (key, op) in self.slots().await? {
            if op.session_id() == session_id && self.backend.delete(&key).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(session_id = %session_id, purged, "Purged pending operations");
        }
        Ok(purged)
    }

    fn slot_key(&self, sequence: u64) -> Vec<u8> {
        let name = format!("{:0width$}", sequence, width = SEQUENCE_WIDTH);
        NamespacedKey::new(self.namespace.as_str(), KeyKind::Queue, name).encode()
    }

    /// Decoded slots in key order. Undecodable slots are logged and skipped,
    /// never deleted.
    async fn slots(&self) -> StorageResult<Vec<(Vec<u8>, PendingOperation)>> {
        let prefix = NamespacedKey::kind_prefix(&self.namespace, KeyKind::Queue);
        let raw = self.backend.scan_prefix(&prefix).await?;

        let mut slots = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            match serde_json::from_slice::<PendingOperation>(&bytes) {
                Ok(op) => slots.push((key, op)),
                Err(e) => {
                    tracing::error!(
                        sequence = ?parse_sequence(&key),
                        error = %e,
                        "Skipping undecodable pending operation"
                    );
                }
            }
        }
        Ok(slots)
    }
}

fn parse_sequence(key: &[u8]) -> Option<u64> {
    NamespacedKey::decode(key)?.name().parse().ok()
}
