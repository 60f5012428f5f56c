//! In-memory remote store.
//!
//! Behaves like the hosted document store closely enough to drive the engine
//! end to end: documents with merge writes, atomic transactions, and live
//! subscriptions. Test controls simulate outages, transient write failures,
//! writes that never resolve, and a concurrent committer racing a
//! transaction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use taskroom_core::RemoteError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    collection_of, merge_fields, CollectionSnapshot, DocumentSnapshot, RemoteStore,
    SnapshotStream, SubscriptionFilter, TransactionStep,
};

/// A field write accepted by the store, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub path: String,
    pub fields: Map<String, Value>,
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<CollectionSnapshot>,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<String, Value>,
    subscribers: Vec<Subscriber>,
    writes: Vec<WriteRecord>,
    rejected_fields: Vec<String>,
    interference: Option<Vec<TransactionStep>>,
}

impl Inner {
    fn snapshot_for(&self, filter: &SubscriptionFilter) -> CollectionSnapshot {
        CollectionSnapshot {
            collection: filter.collection.clone(),
            documents: self
                .documents
                .iter()
                .filter(|(path, data)| filter.matches(path, data))
                .map(|(path, data)| DocumentSnapshot {
                    path: path.clone(),
                    data: data.clone(),
                })
                .collect(),
        }
    }

    /// Push a fresh snapshot to every live subscriber of `collection`.
    fn notify(&mut self, collection: &str) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.filter.collection == collection {
                let _ = subscriber.tx.send(self.snapshot_for(&subscriber.filter));
            }
        }
    }

    fn notify_all(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &self.subscribers {
            let _ = subscriber.tx.send(self.snapshot_for(&subscriber.filter));
        }
    }

    fn commit(&mut self, steps: &[TransactionStep]) -> Result<(), RemoteError> {
        for step in steps {
            if let TransactionStep::Precondition { path, exists } = step {
                if self.documents.contains_key(path) != *exists {
                    return Err(RemoteError::PreconditionFailed { path: path.clone() });
                }
            }
        }

        let mut touched = Vec::new();
        for step in steps {
            match step {
                TransactionStep::Precondition { .. } => {}
                TransactionStep::Set { path, data } => {
                    self.documents.insert(path.clone(), data.clone());
                    touched.push(collection_of(path).to_string());
                }
                TransactionStep::Delete { path } => {
                    self.documents.remove(path);
                    touched.push(collection_of(path).to_string());
                }
            }
        }
        touched.sort();
        touched.dedup();
        for collection in touched {
            self.notify(&collection);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    hang_writes: AtomicBool,
    failing_writes: AtomicU32,
    subscriptions_opened: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RemoteError> {
        self.inner.lock().map_err(|_| RemoteError::Unavailable {
            reason: "remote store state poisoned".to_string(),
        })
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable {
                reason: "simulated outage".to_string(),
            });
        }
        Ok(())
    }

    /// Simulate an outage. Coming back delivers the current snapshot to
    /// every subscriber.
    pub fn set_available(&self, available: bool) {
        let was_unavailable = self.unavailable.swap(!available, Ordering::SeqCst);
        if available && was_unavailable {
            if let Ok(mut inner) = self.inner.lock() {
                inner.notify_all();
            }
        }
    }

    /// Fail the next `count` field writes with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Reject every field write that touches a field starting with `prefix`
    /// until [`MemoryRemoteStore::clear_rejections`] is called.
    pub fn reject_writes_touching(&self, prefix: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rejected_fields.push(prefix.into());
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rejected_fields.clear();
        }
    }

    /// Make field writes and transactions never resolve.
    pub fn set_hang_writes(&self, hang: bool) {
        self.hang_writes.store(hang, Ordering::SeqCst);
    }

    /// Commit `steps` right before the next transaction is evaluated, as if
    /// another client got there first.
    pub fn interfere_with_next_transaction(&self, steps: Vec<TransactionStep>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.interference = Some(steps);
        }
    }

    /// Seed or replace a document and notify subscribers.
    pub fn insert_document(&self, path: &str, data: Value) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.documents.insert(path.to_string(), data);
            if !self.unavailable.load(Ordering::SeqCst) {
                inner.notify(collection_of(path));
            }
        }
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.documents.get(path).cloned())
    }

    /// Accepted field writes, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner
            .lock()
            .map(|inner| inner.writes.clone())
            .unwrap_or_default()
    }

    /// Subscriptions opened since creation.
    pub fn subscriptions_opened(&self) -> u64 {
        self.subscriptions_opened.load(Ordering::SeqCst)
    }

    /// Subscriptions whose stream has not been dropped.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<SnapshotStream, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock()?;
            if !self.unavailable.load(Ordering::SeqCst) {
                let _ = tx.send(inner.snapshot_for(&filter));
            }
            inner.subscribers.push(Subscriber { filter, tx });
        }
        self.subscriptions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn write_field(&self, path: &str, fields: Map<String, Value>) -> Result<(), RemoteError> {
        if self.hang_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Unavailable {
                reason: "injected write failure".to_string(),
            });
        }

        let mut inner = self.lock()?;
        let rejected = fields
            .keys()
            .find(|name| inner.rejected_fields.iter().any(|p| name.starts_with(p.as_str())));
        if let Some(name) = rejected {
            return Err(RemoteError::Rejected {
                path: path.to_string(),
                reason: format!("write to {name} rejected"),
            });
        }
        let doc = inner
            .documents
            .entry(path.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        merge_fields(doc, &fields);
        inner.writes.push(WriteRecord {
            path: path.to_string(),
            fields,
        });
        inner.notify(collection_of(path));
        Ok(())
    }

    async fn run_transaction(&self, steps: Vec<TransactionStep>) -> Result<(), RemoteError> {
        if self.hang_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_available()?;

        let mut inner = self.lock()?;
        if let Some(racing) = inner.interference.take() {
            inner.commit(&racing)?;
        }
        inner.commit(&steps)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        self.check_available()?;
        Ok(self.lock()?.documents.get(path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_then_changes() {
        let store = MemoryRemoteStore::new();
        store.insert_document("live_sessions/s1", json!({"sessionId": "s1"}));

        let filter = SubscriptionFilter::field_equals("live_sessions", "sessionId", "s1");
        let mut stream = store.subscribe(filter).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.documents.len(), 1);

        store
            .write_field("live_sessions/s1", fields(&[("currentTaskId", json!("t1"))]))
            .await
            .unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second.documents[0].data["currentTaskId"], json!("t1"));
    }

    #[tokio::test]
    async fn test_outage_rejects_writes_and_defers_snapshots() {
        let store = MemoryRemoteStore::new();
        store.set_available(false);

        let filter = SubscriptionFilter::field_equals("live_sessions", "sessionId", "s1");
        let mut stream = store.subscribe(filter).await.unwrap();
        assert!(matches!(
            store.write_field("live_sessions/s1", Map::new()).await,
            Err(RemoteError::Unavailable { .. })
        ));

        store.set_available(true);
        let snapshot = stream.next().await.unwrap();
        assert!(snapshot.documents.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted_down() {
        let store = MemoryRemoteStore::new();
        store.fail_next_writes(1);
        assert!(store.write_field("c/d", Map::new()).await.is_err());
        assert!(store.write_field("c/d", Map::new()).await.is_ok());
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_field_blocks_whole_write() {
        let store = MemoryRemoteStore::new();
        store.reject_writes_touching("taskStatusMap.t2.");
        let write = fields(&[("taskStatusMap.t2.status", json!("completed")), ("currentTaskId", json!("t2"))]);
        assert!(matches!(
            store.write_field("live_sessions/s1", write.clone()).await,
            Err(RemoteError::Rejected { .. })
        ));
        assert!(store.document("live_sessions/s1").is_none());

        store.clear_rejections();
        store.write_field("live_sessions/s1", write).await.unwrap();
        assert!(store.document("live_sessions/s1").is_some());
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = MemoryRemoteStore::new();
        store.insert_document("a/1", json!({"x": 1}));

        let steps = vec![
            TransactionStep::Precondition { path: "a/1".into(), exists: true },
            TransactionStep::Precondition { path: "b/1".into(), exists: true },
            TransactionStep::Delete { path: "a/1".into() },
        ];
        assert!(matches!(
            store.run_transaction(steps).await,
            Err(RemoteError::PreconditionFailed { path }) if path == "b/1"
        ));
        assert!(store.document("a/1").is_some());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_not_active() {
        let store = MemoryRemoteStore::new();
        let filter = SubscriptionFilter::field_equals("live_sessions", "sessionId", "s1");
        let stream = store.subscribe(filter).await.unwrap();
        assert_eq!(store.active_subscriptions(), 1);
        drop(stream);
        assert_eq!(store.active_subscriptions(), 0);
        assert_eq!(store.subscriptions_opened(), 1);
    }
}
