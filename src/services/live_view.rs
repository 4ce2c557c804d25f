//! Read-only, real-time projection of one game for spectators.
//!
//! A remote copy is followed through the store's change subscription. Games that only exist on
//! this device are polled from local storage instead. Incomplete or older snapshots are never
//! shown.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::SyncConfig,
    dao::{
        local_store::{LocalGames, RecordFamily},
        remote::{GAMES_COLLECTION, RemoteStore, SubscriptionEvent},
        storage::StorageError,
    },
    state::game::{Game, GameId},
};

const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(10);

/// Where the rendered snapshot comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    /// Remote change subscription.
    Remote,
    /// Polled hybrid record on this device.
    HybridLocal,
    /// Polled guest record on this device.
    GuestLocal,
}

/// What a spectator currently sees.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveViewState {
    /// Sources are still being resolved.
    Loading,
    /// A complete snapshot.
    Live {
        /// Latest accepted snapshot.
        game: Box<Game>,
        /// Origin of the snapshot.
        source: ViewSource,
    },
    /// The game is absent or not public.
    NotFound,
}

impl LiveViewState {
    /// Rendered game, if any.
    pub fn game(&self) -> Option<&Game> {
        match self {
            LiveViewState::Live { game, .. } => Some(game),
            _ => None,
        }
    }
}

/// Opens live views.
#[derive(Clone)]
pub struct LiveViewSubscriber {
    remote: Arc<dyn RemoteStore>,
    local: Option<Arc<LocalGames>>,
    connectivity: Option<watch::Receiver<bool>>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl LiveViewSubscriber {
    /// Subscriber reading from the remote store only.
    pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        Self {
            remote,
            local: None,
            connectivity: None,
            clock,
            config,
        }
    }

    /// Also consider games stored on this device.
    pub fn with_local(mut self, local: Arc<LocalGames>) -> Self {
        self.local = Some(local);
        self
    }

    /// Only look for a remote copy of locally polled games while `signal` reports online.
    pub fn with_connectivity(mut self, signal: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(signal);
        self
    }

    /// Start following `id`. The view stays live until it is dropped.
    pub fn open(&self, id: &str) -> LiveView {
        let (tx, state) = watch::channel(LiveViewState::Loading);
        let task = tokio::spawn(follow(self.clone(), id.to_string(), tx));
        LiveView {
            state,
            clock: self.clock.clone(),
            task,
        }
    }

    fn locate_local(&self, id: &str) -> Option<LocalSource> {
        let local = self.local.clone()?;
        [RecordFamily::Hybrid, RecordFamily::Guest]
            .into_iter()
            .find(|family| {
                local
                    .family(*family)
                    .load(id)
                    .is_some_and(|game| game.share_public)
            })
            .map(|family| {
                let period = match family {
                    RecordFamily::Hybrid => self.config.hybrid_poll_ms,
                    _ => self.config.local_poll_ms,
                };
                LocalSource {
                    local,
                    family,
                    period: Duration::from_millis(period.max(1)),
                }
            })
    }
}

struct LocalSource {
    local: Arc<LocalGames>,
    family: RecordFamily,
    period: Duration,
}

/// Handle to an open live view; dropping it cancels the subscription or polling.
pub struct LiveView {
    state: watch::Receiver<LiveViewState>,
    clock: Arc<dyn Clock>,
    task: JoinHandle<()>,
}

impl LiveView {
    /// Current state.
    pub fn current(&self) -> LiveViewState {
        self.state.borrow().clone()
    }

    /// Current state, marking it as seen so [`LiveView::changed`] only reports later changes.
    pub fn take_current(&mut self) -> LiveViewState {
        self.state.borrow_and_update().clone()
    }

    /// Receiver observing every state change.
    pub fn watch(&self) -> watch::Receiver<LiveViewState> {
        self.state.clone()
    }

    /// Wait for the next state change; `None` once the view can no longer change.
    pub async fn changed(&mut self) -> Option<LiveViewState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Time left in the current phase of the rendered game.
    pub fn remaining_ms(&self) -> Option<u64> {
        let state = self.state.borrow();
        state.game().map(|game| game.remaining_ms(self.clock.now_ms()))
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow(subscriber: LiveViewSubscriber, id: GameId, tx: watch::Sender<LiveViewState>) {
    if !has_public_remote_copy(&subscriber, &id).await {
        let Some(source) = subscriber.locate_local(&id) else {
            info!(game_id = %id, "live view target not found");
            tx.send_replace(LiveViewState::NotFound);
            return;
        };
        poll_local(&subscriber, &id, source, &tx).await;
        info!(game_id = %id, "remote copy available; following it instead of local storage");
    }
    follow_remote(&subscriber, &id, &tx).await;
}

async fn has_public_remote_copy(subscriber: &LiveViewSubscriber, id: &str) -> bool {
    match subscriber.remote.get(GAMES_COLLECTION, id).await {
        Ok(Some(document)) if is_public(&document) => true,
        Ok(_) => {
            debug!(game_id = %id, "no public remote copy");
            false
        }
        Err(err) => {
            debug!(game_id = %id, error = %err, "remote read for live view failed");
            false
        }
    }
}

async fn follow_remote(
    subscriber: &LiveViewSubscriber,
    id: &str,
    tx: &watch::Sender<LiveViewState>,
) {
    let mut delay = RESUBSCRIBE_INITIAL_DELAY;
    loop {
        let mut subscription = subscriber.remote.subscribe(GAMES_COLLECTION, id);
        let failure = loop {
            match subscription.next().await {
                Some(SubscriptionEvent::Changed(Some(document))) => {
                    delay = RESUBSCRIBE_INITIAL_DELAY;
                    apply_remote(id, document, tx);
                }
                Some(SubscriptionEvent::Changed(None)) => {
                    info!(game_id = %id, "followed game was deleted");
                    tx.send_replace(LiveViewState::NotFound);
                }
                Some(SubscriptionEvent::Error(err)) => break Some(err),
                None => break None,
            }
        };

        match failure {
            Some(StorageError::PermissionDenied(message)) => {
                info!(game_id = %id, %message, "game is no longer public");
                tx.send_replace(LiveViewState::NotFound);
            }
            Some(err) => warn!(game_id = %id, error = %err, "live subscription failed; resubscribing"),
            None => debug!(game_id = %id, "live subscription ended; resubscribing"),
        }
        sleep(delay).await;
        delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
    }
}

fn apply_remote(id: &str, document: Value, tx: &watch::Sender<LiveViewState>) {
    if !is_public(&document) {
        tx.send_replace(LiveViewState::NotFound);
        return;
    }
    match Game::from_document(document) {
        Ok(game) => accept(game, ViewSource::Remote, tx),
        Err(err) => warn!(game_id = %id, error = %err, "ignoring incomplete snapshot"),
    }
}

/// Poll device storage until a hybrid game gains a public remote copy.
///
/// Guest games never leave this loop. Remote checks back off while the copy is missing and
/// restart as soon as connectivity comes back.
async fn poll_local(
    subscriber: &LiveViewSubscriber,
    id: &str,
    LocalSource {
        local,
        family,
        period,
    }: LocalSource,
    tx: &watch::Sender<LiveViewState>,
) {
    let source = match family {
        RecordFamily::Guest => ViewSource::GuestLocal,
        _ => ViewSource::HybridLocal,
    };
    debug!(game_id = %id, ?source, ?period, "polling local storage for live view");

    let mut connectivity = subscriber.connectivity.clone();
    let mut retry_delay = RESUBSCRIBE_INITIAL_DELAY;
    let mut next_remote_check = Instant::now() + retry_delay;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        if family == RecordFamily::Hybrid {
            let (online, restored) = match connectivity.as_mut() {
                Some(signal) => {
                    let changed = signal.has_changed().unwrap_or(false);
                    let online = *signal.borrow_and_update();
                    (online, changed && online)
                }
                None => (true, false),
            };
            if restored {
                retry_delay = RESUBSCRIBE_INITIAL_DELAY;
                next_remote_check = Instant::now();
            }
            if online && Instant::now() >= next_remote_check {
                if has_public_remote_copy(subscriber, id).await {
                    return;
                }
                next_remote_check = Instant::now() + retry_delay;
                retry_delay = (retry_delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            }
        }

        match local.find(id) {
            Some((_, game)) if game.share_public => accept(game, source, tx),
            _ => {
                tx.send_if_modified(|state| {
                    let changed = *state != LiveViewState::NotFound;
                    *state = LiveViewState::NotFound;
                    changed
                });
            }
        }
    }
}

/// Publish `game` unless the view already shows a newer version, or the same version from
/// the same source.
fn accept(game: Game, source: ViewSource, tx: &watch::Sender<LiveViewState>) {
    tx.send_if_modified(|state| {
        if let LiveViewState::Live {
            game: shown,
            source: shown_source,
        } = state
        {
            if shown.version > game.version
                || (shown.version == game.version && *shown_source == source)
            {
                return false;
            }
        }
        *state = LiveViewState::Live {
            game: Box::new(game),
            source,
        };
        true
    });
}

fn is_public(document: &Value) -> bool {
    document.get("sharePublic").and_then(Value::as_bool) == Some(true)
}
