//! Remote document store collaborator.
//!
//! The engine is a client of a hosted document database with a push-based
//! change feed. [`RemoteStore`] is the seam; [`MemoryRemoteStore`] is the
//! in-process implementation used by tests and the scenario binary.

mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{Map, Value};
use taskroom_core::RemoteError;

pub use memory::{MemoryRemoteStore, WriteRecord};

/// One document in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub path: String,
    pub data: Value,
}

/// Every document of a collection matching a subscription's filter, as of
/// one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    pub collection: String,
    pub documents: Vec<DocumentSnapshot>,
}

/// Equality filter over one top-level field of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub collection: String,
    pub field: String,
    pub equals: Value,
}

impl SubscriptionFilter {
    pub fn field_equals(
        collection: impl Into<String>,
        field: impl Into<String>,
        equals: impl Into<Value>,
    ) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, path: &str, data: &Value) -> bool {
        collection_of(path) == self.collection && data.get(&self.field) == Some(&self.equals)
    }
}

/// One step of an atomic multi-document transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionStep {
    /// Abort unless the document's existence matches `exists`.
    Precondition { path: String, exists: bool },
    /// Create or fully replace a document.
    Set { path: String, data: Value },
    Delete { path: String },
}

/// Push-based stream of collection snapshots. Dropping it unsubscribes.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = CollectionSnapshot> + Send>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a live subscription. The current snapshot is delivered first
    /// once the store is reachable, then one snapshot per change.
    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<SnapshotStream, RemoteError>;

    /// Merge `fields` into the document at `path`, creating it if absent.
    /// Dotted field names address nested map fields.
    async fn write_field(&self, path: &str, fields: Map<String, Value>) -> Result<(), RemoteError>;

    /// Apply every step atomically: either all take effect or none do.
    async fn run_transaction(&self, steps: Vec<TransactionStep>) -> Result<(), RemoteError>;

    async fn get_document(&self, path: &str) -> Result<Option<Value>, RemoteError>;
}

/// Collection part of a `collection/document` path.
pub fn collection_of(path: &str) -> &str {
    path.split_once('/').map_or(path, |(collection, _)| collection)
}

/// Merge `fields` into `target`, expanding dotted names into nested maps.
///
/// A non-object `target` is replaced by an empty object first, and so is any
/// non-object value sitting on a dotted path.
pub fn merge_fields(target: &mut Value, fields: &Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    for (name, value) in fields {
        let mut cursor = &mut *target;
        let mut parts = name.split('.').peekable();
        while let Some(part) = parts.next() {
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }
            let Value::Object(map) = cursor else {
                break;
            };
            if parts.peek().is_none() {
                map.insert(part.to_string(), value.clone());
                break;
            }
            cursor = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_expands_dotted_names() {
        let mut doc = json!({"sessionId": "s1", "taskStatusMap": {"t0": {"status": "completed"}}});
        let mut fields = Map::new();
        fields.insert("taskStatusMap.t1.status".into(), json!("in_progress"));
        fields.insert("currentTaskId".into(), json!("t1"));
        merge_fields(&mut doc, &fields);

        assert_eq!(doc["taskStatusMap"]["t1"]["status"], json!("in_progress"));
        assert_eq!(doc["taskStatusMap"]["t0"]["status"], json!("completed"));
        assert_eq!(doc["currentTaskId"], json!("t1"));
        assert_eq!(doc["sessionId"], json!("s1"));
    }

    #[test]
    fn test_merge_replaces_scalar_on_path() {
        let mut doc = json!({"a": 1});
        let mut fields = Map::new();
        fields.insert("a.b".into(), json!(2));
        merge_fields(&mut doc, &fields);
        assert_eq!(doc, json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_filter_matches_collection_and_field() {
        let filter = SubscriptionFilter::field_equals("live_sessions", "sessionId", "s1");
        assert!(filter.matches("live_sessions/s1", &json!({"sessionId": "s1"})));
        assert!(!filter.matches("live_sessions/s2", &json!({"sessionId": "s2"})));
        assert!(!filter.matches("finalized_sessions/s1", &json!({"sessionId": "s1"})));
    }
}
