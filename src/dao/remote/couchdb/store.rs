use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    auth::IdentityProvider,
    clock::Clock,
    dao::{
        document::merge_patch,
        remote::{
            OrderBy, QueryFilter, RemoteStore, RemoteSubscription, SetOptions, SubscriptionEvent,
            can_read, is_owned_by,
        },
        storage::{StorageError, StorageResult},
    },
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        ChangesResponse, DatabaseInfo, FindRequest, FindResponse, collection_selector, doc_id,
        into_body, seq_param, with_meta,
    },
};

const FIND: &str = "_find";
const CHANGES: &str = "_changes";
const FIND_LIMIT: usize = 1_000;

/// [`RemoteStore`] over a CouchDB database, applying the public-read / owner-write rules
/// on behalf of the configured identity.
#[derive(Clone)]
pub struct CouchRemoteStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    changes_timeout: Duration,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    online: Arc<AtomicBool>,
}

impl CouchRemoteStore {
    /// Connect to CouchDB and make sure the database exists.
    pub async fn connect(
        config: CouchConfig,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
            changes_timeout: config.changes_timeout,
            identity,
            clock,
            online: Arc::new(AtomicBool::new(true)),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth {
            Some((ref user, ref pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.database_url(), path);
        self.with_auth(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = self.database_url();

        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .with_auth(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                if create.status().is_success() {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
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

    async fn get_raw(&self, doc_id: &str) -> CouchResult<Option<Value>> {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<Value>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_raw(&self, doc_id: &str, document: &Value) -> CouchResult<()> {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: response.status(),
            })
        }
    }

    async fn delete_raw(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Value>> {
        self.ensure_online()?;
        let Some(raw) = self.get_raw(&doc_id(collection, id)).await? else {
            return Ok(None);
        };
        let (_, body) = into_body(raw);
        if can_read(&body, self.caller().as_deref()) {
            Ok(Some(body))
        } else {
            Err(StorageError::PermissionDenied(format!(
                "read of `{collection}/{id}` denied"
            )))
        }
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        incoming: Value,
        merge: bool,
        must_exist: bool,
    ) -> StorageResult<()> {
        self.ensure_online()?;
        let doc_id = doc_id(collection, id);
        if !incoming.is_object() {
            return Err(CouchDaoError::InvalidDocument { doc_id }.into());
        }

        let caller = self.caller();
        let (rev, mut next) = match self.get_raw(&doc_id).await? {
            Some(raw) => {
                let (rev, current) = into_body(raw);
                if !is_owned_by(&current, caller.as_deref()) {
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
                (rev, next)
            }
            None if must_exist => return Err(StorageError::NotFound(id.to_string())),
            None => {
                if !is_owned_by(&incoming, caller.as_deref()) {
                    return Err(StorageError::PermissionDenied(format!(
                        "create of `{collection}/{id}` denied"
                    )));
                }
                (None, incoming)
            }
        };

        if let Some(fields) = next.as_object_mut() {
            fields
                .entry("createdAt")
                .or_insert_with(|| Value::from(self.clock.now_ms()));
        }

        let stored = with_meta(next, &doc_id, rev.as_deref());
        self.put_raw(&doc_id, &stored).await?;
        debug!(doc_id = %doc_id, "wrote CouchDB document");
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> StorageResult<()> {
        self.ensure_online()?;
        let doc_id = doc_id(collection, id);
        let Some(raw) = self.get_raw(&doc_id).await? else {
            return Ok(());
        };
        let (rev, current) = into_body(raw);
        if !is_owned_by(&current, self.caller().as_deref()) {
            return Err(StorageError::PermissionDenied(format!(
                "delete of `{collection}/{id}` denied"
            )));
        }
        match rev {
            Some(rev) => Ok(self.delete_raw(&doc_id, &rev).await?),
            None => Err(CouchDaoError::InvalidDocument { doc_id }.into()),
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: QueryFilter,
        order: Option<OrderBy>,
    ) -> StorageResult<Vec<Value>> {
        self.ensure_online()?;
        let request = FindRequest {
            selector: collection_selector(collection, &filter.field, &filter.equals),
            limit: FIND_LIMIT,
        };

        let response = self
            .request(Method::POST, FIND)
            .json(&request)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: FIND.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: FIND.to_string(),
                status: response.status(),
            }
            .into());
        }

        let payload = response.json::<FindResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: FIND.to_string(),
                source,
            }
        })?;

        let caller = self.caller();
        let mut documents: Vec<Value> = payload
            .docs
            .into_iter()
            .map(|raw| into_body(raw).1)
            .filter(|doc| filter.matches(doc) && can_read(doc, caller.as_deref()))
            .collect();
        if let Some(order) = order {
            order.sort(&mut documents);
        }
        Ok(documents)
    }

    async fn current_seq(&self) -> CouchResult<Value> {
        let url = self.database_url();
        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: url,
                status: response.status(),
            });
        }

        response
            .json::<DatabaseInfo>()
            .await
            .map(|info| info.update_seq)
            .map_err(|source| CouchDaoError::DecodeResponse { path: url, source })
    }

    async fn poll_changes(&self, doc_id: &str, since: &Value) -> CouchResult<ChangesResponse> {
        let timeout = self.changes_timeout.as_millis().to_string();
        let response = self
            .request(Method::POST, CHANGES)
            .query(&[
                ("feed", "longpoll"),
                ("filter", "_doc_ids"),
                ("include_docs", "true"),
                ("since", seq_param(since).as_str()),
                ("timeout", timeout.as_str()),
            ])
            .json(&json!({ "doc_ids": [doc_id] }))
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            })
    }

    async fn follow(
        self,
        collection: String,
        id: String,
        tx: mpsc::Sender<SubscriptionEvent>,
    ) {
        let doc_id = doc_id(&collection, &id);
        let mut since = match self.current_seq().await {
            Ok(seq) => seq,
            Err(err) => {
                let _ = tx.send(SubscriptionEvent::Error(err.into())).await;
                return;
            }
        };

        match self.read(&collection, &id).await {
            Ok(document) => {
                if tx.send(SubscriptionEvent::Changed(document)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(SubscriptionEvent::Error(err)).await;
                return;
            }
        }

        loop {
            if let Err(err) = self.ensure_online() {
                let _ = tx.send(SubscriptionEvent::Error(err)).await;
                return;
            }

            let changes = match self.poll_changes(&doc_id, &since).await {
                Ok(changes) => changes,
                Err(err) => {
                    warn!(doc_id = %doc_id, error = %err, "CouchDB change feed failed");
                    let _ = tx.send(SubscriptionEvent::Error(err.into())).await;
                    return;
                }
            };
            since = changes.last_seq;

            for row in changes.results {
                let event = match (row.deleted, row.doc) {
                    (false, Some(raw)) => {
                        let (_, body) = into_body(raw);
                        if can_read(&body, self.caller().as_deref()) {
                            SubscriptionEvent::Changed(Some(body))
                        } else {
                            SubscriptionEvent::Error(StorageError::PermissionDenied(format!(
                                "read of `{collection}/{id}` denied"
                            )))
                        }
                    }
                    _ => SubscriptionEvent::Changed(None),
                };
                let terminal = matches!(event, SubscriptionEvent::Error(_));
                if tx.send(event).await.is_err() || terminal {
                    return;
                }
            }
        }
    }
}

impl RemoteStore for CouchRemoteStore {
    fn get(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<Option<Value>>> {
        let store = self.clone();
        let (collection, id) = (collection.to_string(), id.to_string());
        Box::pin(async move { store.read(&collection, &id).await })
    }

    fn set(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        options: SetOptions,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (collection, id) = (collection.to_string(), id.to_string());
        Box::pin(async move {
            store
                .write(&collection, &id, document, options.merge, false)
                .await
        })
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (collection, id) = (collection.to_string(), id.to_string());
        Box::pin(async move { store.write(&collection, &id, fields, true, true).await })
    }

    fn delete(&self, collection: &str, id: &str) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (collection, id) = (collection.to_string(), id.to_string());
        Box::pin(async move { store.remove(&collection, &id).await })
    }

    fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        order: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>> {
        let store = self.clone();
        let collection = collection.to_string();
        Box::pin(async move { store.find(&collection, filter, order).await })
    }

    fn subscribe(&self, collection: &str, id: &str) -> RemoteSubscription {
        if let Err(err) = self.ensure_online() {
            return RemoteSubscription::failed(err);
        }
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(
            self.clone()
                .follow(collection.to_string(), id.to_string(), tx),
        );
        RemoteSubscription::new(rx, task)
    }

    fn enable_network(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.online.store(true, Ordering::SeqCst);
            store.ensure_database().await.map_err(Into::into)
        })
    }

    fn disable_network(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.online.store(false, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_online()?;
            store.current_seq().await.map(|_| ()).map_err(Into::into)
        })
    }
}
