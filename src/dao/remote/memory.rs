//! In-process remote store with the same access rules as the hosted backend.
//!
//! Reads are allowed when the document is public or owned by the caller; writes are owner-only.
//! Several views created with [`MemoryRemoteStore::connect_as`] share the same documents, so a
//! scorer and a spectator can be simulated side by side.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc};
use tracing::debug;

use super::{
    OrderBy, QueryFilter, RemoteStore, RemoteSubscription, SetOptions, SubscriptionEvent,
    can_read, is_owned_by,
};
use crate::{
    auth::IdentityProvider,
    clock::Clock,
    dao::{
        document::merge_patch,
        storage::{StorageError, StorageResult},
    },
};

type DocKey = (String, String);

struct Shared {
    documents: DashMap<DocKey, Value>,
    changes: broadcast::Sender<DocKey>,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

/// Memory-backed [`RemoteStore`] enforcing public-read / owner-write rules.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    shared: Arc<Shared>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    online: Arc<AtomicBool>,
}

impl MemoryRemoteStore {
    /// Empty store seen through `identity`.
    pub fn new(identity: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>) -> Self {
        let (changes, _rx) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                documents: DashMap::new(),
                changes,
                writes: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            }),
            identity,
            clock,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Another client over the same documents, authenticated as `identity`.
    pub fn connect_as(&self, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            shared: self.shared.clone(),
            identity,
            clock: self.clock.clone(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Raw document, bypassing access rules.
    pub fn peek(&self, collection: &str, id: &str) -> Option<Value> {
        self.shared
            .documents
            .get(&key(collection, id))
            .map(|doc| doc.value().clone())
    }

    /// Delete a document bypassing access rules, as an administrator would.
    pub fn purge(&self, collection: &str, id: &str) {
        let key = key(collection, id);
        if self.shared.documents.remove(&key).is_some() {
            let _ = self.shared.changes.send(key);
        }
    }

    /// Number of successful writes (set, update, delete) since creation.
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Number of point reads that reached the document map.
    pub fn read_count(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Offline)
        }
    }

    fn caller(&self) -> Option<String> {
        self.identity.current_user().map(|user| user.uid)
    }

    fn readable(&self, document: &Value) -> bool {
        can_read(document, self.caller().as_deref())
    }

    fn is_owner(&self, document: &Value) -> bool {
        is_owned_by(document, self.caller().as_deref())
    }

    fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Value>> {
        self.ensure_online()?;
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        let Some(document) = self.peek(collection, id) else {
            return Ok(None);
        };
        if self.readable(&document) {
            Ok(Some(document))
        } else {
            Err(StorageError::PermissionDenied(format!(
                "read of `{collection}/{id}` denied"
            )))
        }
    }

    fn write(
        &self,
        collection: &str,
        id: &str,
        incoming: Value,
        merge: bool,
        must_exist: bool,
    ) -> StorageResult<()> {
        self.ensure_online()?;
        if !incoming.is_object() {
            return Err(StorageError::PermissionDenied(
                "documents must be JSON objects".into(),
            ));
        }

        let key = key(collection, id);
        let existing = self.peek(collection, id);
        let mut next = match existing {
            Some(current) => {
                if !self.is_owner(&current) {
                    return Err(StorageError::PermissionDenied(format!(
                        "write to `{collection}/{id}` denied"
                    )));
                }
                let created_at = current.get("createdAt").cloned();
                let mut next = if merge {
                    let mut merged = current;
                    merge_patch(&mut merged, &incoming, &[]);
                    merged
                } else {
                    incoming
                };
                if let (Some(created_at), Some(fields)) = (created_at, next.as_object_mut()) {
                    fields.insert("createdAt".into(), created_at);
                }
                next
            }
            None if must_exist => return Err(StorageError::NotFound(id.to_string())),
            None => {
                if !self.is_owner(&incoming) {
                    return Err(StorageError::PermissionDenied(format!(
                        "create of `{collection}/{id}` denied"
                    )));
                }
                incoming
            }
        };

        if let Some(fields) = next.as_object_mut() {
            fields
                .entry("createdAt")
                .or_insert_with(|| Value::from(self.clock.now_ms()));
        }

        self.shared.documents.insert(key.clone(), next);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.changes.send(key);
        Ok(())
    }

    fn remove(&self, collection: &str, id: &str) -> StorageResult<()> {
        self.ensure_online()?;
        let Some(current) = self.peek(collection, id) else {
            return Ok(());
        };
        if !self.is_owner(&current) {
            return Err(StorageError::PermissionDenied(format!(
                "delete of `{collection}/{id}` denied"
            )));
        }
        let key = key(collection, id);
        self.shared.documents.remove(&key);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.changes.send(key);
        Ok(())
    }
}

fn key(collection: &str, id: &str) -> DocKey {
    (collection.to_string(), id.to_string())
}

impl RemoteStore for MemoryRemoteStore {
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<Option<Value>>> {
        let result = self.read(collection, id);
        Box::pin(async move { result })
    }

    fn set(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        options: SetOptions,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.write(collection, id, document, options.merge, false);
        Box::pin(async move { result })
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.write(collection, id, fields, true, true);
        Box::pin(async move { result })
    }

    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.remove(collection, id);
        Box::pin(async move { result })
    }

    fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        order: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>> {
        let result = self.ensure_online().map(|()| {
            let mut matches: Vec<Value> = self
                .shared
                .documents
                .iter()
                .filter(|entry| entry.key().0 == collection)
                .map(|entry| entry.value().clone())
                .filter(|doc| filter.matches(doc) && self.readable(doc))
                .collect();
            if let Some(order) = &order {
                order.sort(&mut matches);
            }
            matches
        });
        Box::pin(async move { result })
    }

    fn subscribe(&self, collection: &str, id: &str) -> RemoteSubscription {
        if let Err(err) = self.ensure_online() {
            return RemoteSubscription::failed(err);
        }

        let store = self.clone();
        let watched = key(collection, id);
        let mut changes = self.shared.changes.subscribe();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let (collection, id) = watched.clone();
            let emit = |result: StorageResult<Option<Value>>| match result {
                Ok(document) => (SubscriptionEvent::Changed(document), true),
                Err(err) => (SubscriptionEvent::Error(err), false),
            };

            let (event, keep_going) = emit(store.read(&collection, &id));
            if tx.send(event).await.is_err() || !keep_going {
                return;
            }

            loop {
                match changes.recv().await {
                    Ok(changed) if changed == watched => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscription lagged; re-reading document");
                    }
                    Err(RecvError::Closed) => break,
                }
                let (event, keep_going) = emit(store.read(&collection, &id));
                if tx.send(event).await.is_err() || !keep_going {
                    break;
                }
            }
        });

        RemoteSubscription::new(rx, task)
    }

    fn enable_network(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.online.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn disable_network(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.online.store(false, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.ensure_online();
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        auth::{Identity, MemoryIdentityProvider},
        clock::ManualClock,
        dao::remote::GAMES_COLLECTION,
    };

    fn store_for(uid: &str) -> MemoryRemoteStore {
        MemoryRemoteStore::new(
            Arc::new(MemoryIdentityProvider::signed_in(Identity::registered(
                uid,
                format!("{uid}@example.com"),
            ))),
            Arc::new(ManualClock::new(42)),
        )
    }

    fn doc(owner: &str, public: bool, version: u64) -> Value {
        json!({"owner": {"type": "registered", "userId": owner}, "sharePublic": public, "version": version})
    }

    #[tokio::test]
    async fn created_at_is_assigned_once() {
        let store = store_for("u1");
        store
            .set(GAMES_COLLECTION, "g1", doc("u1", false, 1), SetOptions::REPLACE)
            .await
            .unwrap();
        assert_eq!(store.peek(GAMES_COLLECTION, "g1").unwrap()["createdAt"], 42);

        store
            .set(
                GAMES_COLLECTION,
                "g1",
                json!({"owner": {"userId": "u1"}, "version": 2, "createdAt": 99}),
                SetOptions::REPLACE,
            )
            .await
            .unwrap();
        let stored = store.peek(GAMES_COLLECTION, "g1").unwrap();
        assert_eq!(stored["createdAt"], 42);
        assert_eq!(stored["version"], 2);
    }

    #[tokio::test]
    async fn private_documents_are_owner_only() {
        let owner = store_for("u1");
        owner
            .set(GAMES_COLLECTION, "g1", doc("u1", false, 1), SetOptions::REPLACE)
            .await
            .unwrap();

        let stranger = owner.connect_as(Arc::new(MemoryIdentityProvider::new()));
        assert!(matches!(
            stranger.get(GAMES_COLLECTION, "g1").await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(matches!(
            stranger.delete(GAMES_COLLECTION, "g1").await,
            Err(StorageError::PermissionDenied(_))
        ));

        owner
            .update(GAMES_COLLECTION, "g1", json!({"sharePublic": true}))
            .await
            .unwrap();
        assert!(stranger.get(GAMES_COLLECTION, "g1").await.unwrap().is_some());
        assert!(matches!(
            stranger
                .update(GAMES_COLLECTION, "g1", json!({"version": 9}))
                .await,
            Err(StorageError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn update_requires_existing_document() {
        let store = store_for("u1");
        assert!(matches!(
            store.update(GAMES_COLLECTION, "nope", json!({"version": 1})).await,
            Err(StorageError::NotFound(_))
        ));
        store.delete(GAMES_COLLECTION, "nope").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_network_fails_fast() {
        let store = store_for("u1");
        store.disable_network().await.unwrap();
        assert!(matches!(
            store.get(GAMES_COLLECTION, "g1").await,
            Err(StorageError::Offline)
        ));
        assert!(store.health_check().await.is_err());
        store.enable_network().await.unwrap();
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn query_filters_by_owner_and_orders() {
        let store = store_for("u1");
        for (id, version) in [("g1", 1), ("g2", 3), ("g3", 2)] {
            store
                .set(GAMES_COLLECTION, id, doc("u1", false, version), SetOptions::REPLACE)
                .await
                .unwrap();
        }
        let found = store
            .query(
                GAMES_COLLECTION,
                QueryFilter::eq("owner.userId", "u1"),
                Some(OrderBy::desc("version")),
            )
            .await
            .unwrap();
        let versions: Vec<_> = found.iter().map(|d| d["version"].as_u64().unwrap()).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn subscription_sees_current_then_changes() {
        let owner = store_for("u1");
        owner
            .set(GAMES_COLLECTION, "g1", doc("u1", true, 1), SetOptions::REPLACE)
            .await
            .unwrap();

        let spectator = owner.connect_as(Arc::new(MemoryIdentityProvider::new()));
        let mut subscription = spectator.subscribe(GAMES_COLLECTION, "g1");

        match subscription.next().await {
            Some(SubscriptionEvent::Changed(Some(doc))) => assert_eq!(doc["version"], 1),
            other => panic!("unexpected event: {other:?}"),
        }

        owner
            .update(GAMES_COLLECTION, "g1", json!({"version": 2}))
            .await
            .unwrap();
        match subscription.next().await {
            Some(SubscriptionEvent::Changed(Some(doc))) => assert_eq!(doc["version"], 2),
            other => panic!("unexpected event: {other:?}"),
        }

        owner.purge(GAMES_COLLECTION, "g1");
        assert!(matches!(
            subscription.next().await,
            Some(SubscriptionEvent::Changed(None))
        ));
    }
}
