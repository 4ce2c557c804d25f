//! Remote document store contract and its backends.

#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;

use std::cmp::Ordering;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::dao::{document, storage::StorageError, storage::StorageResult};

/// Collection holding game documents.
pub const GAMES_COLLECTION: &str = "games";

/// Options for [`RemoteStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge top-level fields into the existing document instead of replacing it.
    pub merge: bool,
}

impl SetOptions {
    /// Replace the whole document.
    pub const REPLACE: SetOptions = SetOptions { merge: false };
    /// Merge into the existing document.
    pub const MERGE: SetOptions = SetOptions { merge: true };
}

/// Equality filter on a dotted field path.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Dotted path, e.g. `owner.userId`.
    pub field: String,
    /// Value the field must equal.
    pub equals: Value,
}

impl QueryFilter {
    /// Filter documents whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: value.into(),
        }
    }

    /// Whether `document` passes the filter.
    pub fn matches(&self, document: &Value) -> bool {
        document::field(document, &self.field) == Some(&self.equals)
    }
}

/// Ordering on a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Dotted path to sort on.
    pub field: String,
    /// Largest first.
    pub descending: bool,
}

impl OrderBy {
    /// Newest-first ordering on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Sort `documents` in place. Documents missing the field sort last.
    pub fn sort(&self, documents: &mut [Value]) {
        documents.sort_by(|left, right| {
            let left = document::field(left, &self.field);
            let right = document::field(right, &self.field);
            let ordering = match (left, right) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if self.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l
            .as_f64()
            .partial_cmp(&r.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        _ => Ordering::Equal,
    }
}

/// Read rule: public documents are readable by anyone, private ones by their owner only.
pub fn can_read(document: &Value, caller: Option<&str>) -> bool {
    document.get("sharePublic").and_then(Value::as_bool) == Some(true)
        || is_owned_by(document, caller)
}

/// Write rule: `owner.userId` must match the caller.
pub fn is_owned_by(document: &Value, caller: Option<&str>) -> bool {
    let owner = document::field(document, "owner.userId").and_then(Value::as_str);
    matches!((owner, caller), (Some(owner), Some(caller)) if owner == caller)
}

/// Notification delivered by a document subscription.
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// Current document contents; `None` once it has been deleted.
    Changed(Option<Value>),
    /// The subscription failed; no further events follow.
    Error(StorageError),
}

/// Live subscription to a single document. Dropping it cancels the feed.
pub struct RemoteSubscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    task: Option<JoinHandle<()>>,
}

impl RemoteSubscription {
    /// Wrap a feed produced by a background task.
    pub fn new(events: mpsc::Receiver<SubscriptionEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Subscription that reports `error` once and ends.
    pub fn failed(error: StorageError) -> Self {
        let (tx, events) = mpsc::channel(1);
        let _ = tx.try_send(SubscriptionEvent::Error(error));
        Self { events, task: None }
    }

    /// Next event, or `None` when the feed has ended.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Authenticated document store shared across devices and spectators.
pub trait RemoteStore: Send + Sync {
    /// Point read; `Ok(None)` when the document does not exist.
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<Option<Value>>>;
    /// Create or overwrite a document; `createdAt` is assigned on first write.
    fn set(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        options: SetOptions,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Merge `fields` into an existing document; fails with `NotFound` when absent.
    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Remove a document; deleting a missing document succeeds.
    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<()>>;
    /// Documents matching `filter` visible to the caller, in `order` when given.
    fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        order: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>>;
    /// Follow one document; the current contents are delivered first.
    fn subscribe(&self, collection: &str, id: &str) -> RemoteSubscription;
    /// Resume network access after [`RemoteStore::disable_network`].
    fn enable_network(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Stop all network access; subsequent operations fail with `Offline`.
    fn disable_network(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Cheap reachability probe.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
