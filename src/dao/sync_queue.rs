//! Persisted backlog of remote mutations waiting for connectivity.

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clock::TimestampMs,
    dao::kv::KeyValueStore,
    error::SyncError,
    state::game::GameId,
};

/// Storage key of the queue.
pub const SYNC_QUEUE_KEY: &str = "sync_queue";

/// Kind of remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    /// First write of the document.
    Create,
    /// Overwrite of an existing document.
    Update,
}

/// One pending remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Mutation kind.
    #[serde(rename = "type")]
    pub operation: QueueOperation,
    /// Target game.
    pub game_id: GameId,
    /// When the mutation was queued.
    pub timestamp: TimestampMs,
    /// Version of the payload.
    pub version: u64,
    /// Full game document to write.
    pub payload: Value,
}

/// Snapshot of the backlog for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Number of queued mutations.
    pub pending: usize,
    /// Timestamp of the oldest queued mutation.
    pub oldest: Option<TimestampMs>,
    /// Timestamp of the newest queued mutation.
    pub newest: Option<TimestampMs>,
}

/// What the delivery callback did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written remotely; the item can go.
    Delivered,
    /// Not deliverable by the current caller (e.g. another user's item); keep it.
    Skipped,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Games written remotely.
    pub delivered: Vec<GameId>,
    /// Games left queued because the remote was unreachable or the item was skipped.
    pub deferred: Vec<GameId>,
    /// Games dropped after a permanent failure.
    pub rejected: Vec<GameId>,
    /// Another drain was already running; nothing was attempted.
    pub busy: bool,
}

/// Ordered, per-game de-duplicated queue persisted in device storage.
pub struct SyncQueue {
    storage: Arc<dyn KeyValueStore>,
    cap: usize,
    draining: Mutex<()>,
}

impl SyncQueue {
    /// Bind the queue to device storage.
    pub fn new(storage: Arc<dyn KeyValueStore>, cap: usize) -> Self {
        Self {
            storage,
            cap: cap.max(1),
            draining: Mutex::new(()),
        }
    }

    /// Queued items, oldest first.
    pub fn items(&self) -> Vec<QueueItem> {
        match self.storage.get_item(SYNC_QUEUE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "sync queue is malformed; discarding it");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "failed to read sync queue");
                Vec::new()
            }
        }
    }

    /// Queue `item`, superseding any pending mutation for the same game.
    ///
    /// A pending create stays a create so the first remote write keeps its semantics.
    pub fn enqueue(&self, mut item: QueueItem) {
        let mut items = self.items();
        if let Some(previous) = items.iter().find(|queued| queued.game_id == item.game_id) {
            if previous.operation == QueueOperation::Create {
                item.operation = QueueOperation::Create;
            }
        }
        items.retain(|queued| queued.game_id != item.game_id);
        items.push(item);
        items.sort_by_key(|queued| queued.timestamp);

        if items.len() > self.cap {
            let overflow = items.len() - self.cap;
            let dropped: Vec<_> = items.drain(..overflow).map(|i| i.game_id).collect();
            warn!(?dropped, cap = self.cap, "sync queue full; dropping oldest mutations");
        }

        self.write(&items);
    }

    /// Drop the pending mutation for `game_id`, if any.
    pub fn remove(&self, game_id: &str) {
        let mut items = self.items();
        let before = items.len();
        items.retain(|queued| queued.game_id != game_id);
        if items.len() != before {
            self.write(&items);
        }
    }

    /// Pending count and age range.
    pub fn status(&self) -> QueueStatus {
        let items = self.items();
        QueueStatus {
            pending: items.len(),
            oldest: items.iter().map(|i| i.timestamp).min(),
            newest: items.iter().map(|i| i.timestamp).max(),
        }
    }

    /// Attempt every queued mutation in order.
    ///
    /// Delivered items are removed unless a newer mutation for the same game was queued
    /// meanwhile. The pass stops at the first transient failure and leaves the rest queued;
    /// permanently rejected items are dropped. Concurrent drains do not overlap.
    pub async fn drain<F, Fut>(&self, mut deliver: F) -> DrainReport
    where
        F: FnMut(QueueItem) -> Fut,
        Fut: Future<Output = Result<Delivery, SyncError>>,
    {
        let Ok(_guard) = self.draining.try_lock() else {
            debug!("sync queue drain already in progress");
            return DrainReport {
                busy: true,
                ..DrainReport::default()
            };
        };

        let items = self.items();
        let mut report = DrainReport::default();
        if items.is_empty() {
            return report;
        }

        let mut pending = items.into_iter();
        for item in pending.by_ref() {
            let game_id = item.game_id.clone();
            let version = item.version;
            match deliver(item).await {
                Ok(Delivery::Delivered) => {
                    self.remove_delivered(&game_id, version);
                    report.delivered.push(game_id);
                }
                Ok(Delivery::Skipped) => report.deferred.push(game_id),
                Err(err) if err.is_transient() => {
                    debug!(game_id = %game_id, error = %err, "remote unavailable; pausing drain");
                    report.deferred.push(game_id);
                    break;
                }
                Err(err) => {
                    warn!(game_id = %game_id, error = %err, "dropping queued mutation rejected by remote");
                    self.remove_delivered(&game_id, version);
                    report.rejected.push(game_id);
                }
            }
        }
        report.deferred.extend(pending.map(|item| item.game_id));

        info!(
            delivered = report.delivered.len(),
            deferred = report.deferred.len(),
            rejected = report.rejected.len(),
            "sync queue drained"
        );
        report
    }

    fn remove_delivered(&self, game_id: &str, version: u64) {
        let mut items = self.items();
        let before = items.len();
        items.retain(|queued| queued.game_id != game_id || queued.version > version);
        if items.len() != before {
            self.write(&items);
        }
    }

    fn write(&self, items: &[QueueItem]) {
        let result = if items.is_empty() {
            self.storage.remove_item(SYNC_QUEUE_KEY)
        } else {
            match serde_json::to_string(items) {
                Ok(encoded) => self.storage.set_item(SYNC_QUEUE_KEY, &encoded),
                Err(err) => {
                    warn!(error = %err, "failed to encode sync queue");
                    return;
                }
            }
        };

        if let Err(err) = result {
            warn!(error = %err, "failed to persist sync queue");
        }
    }
}
