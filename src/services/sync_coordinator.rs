//! Offline-first orchestration of games across device storage and the remote store.
//!
//! Guest games stay on the device. Shared guest games ("hybrid") and registered users' games are
//! written locally first and mirrored remotely afterwards; remote failures land in the sync queue
//! and never fail the local operation. Every remote write is version-checked through
//! [`resolve`], so a stale copy never overwrites a newer one.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    auth::{Identity, IdentityProvider},
    clock::{Clock, TimestampMs},
    config::SyncConfig,
    dao::{
        document,
        kv::KeyValueStore,
        local_store::{LocalGames, RecordFamily},
        models::GameSummaryEntity,
        remote::{GAMES_COLLECTION, OrderBy, QueryFilter, RemoteStore, SetOptions},
        storage::StorageError,
        sync_queue::{Delivery, DrainReport, QueueItem, QueueOperation, QueueStatus, SyncQueue},
    },
    dto::setup::GameSetup,
    error::SyncError,
    services::{
        conflict::{ConflictAction, resolve},
        connectivity::Connectivity,
        game_session::GameSession,
        scheduler::{Scheduler, TaskKind},
    },
    state::{
        game::{Game, GameId, MatchError, Owner, Scores, TeamSide},
        state_machine::{self, Phase},
    },
};

/// Result of pushing a game to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The local copy was written remotely.
    Synced,
    /// Both copies already carried the same version.
    AlreadyCurrent,
    /// The remote copy was newer and replaced the local one.
    RemoteNewer,
    /// The remote store was unreachable; the game waits in the sync queue.
    Queued,
    /// The game is device-only and has no remote copy.
    LocalOnly,
}

struct Inner {
    local: Arc<LocalGames>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    scheduler: Scheduler,
    connectivity: Connectivity,
    push_locks: DashMap<GameId, Arc<Mutex<()>>>,
}

/// Cheaply cloneable handle to the sync layer of one device.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Wire the coordinator to its collaborators.
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let local = Arc::new(LocalGames::new(storage.clone(), &config));
        let queue = SyncQueue::new(storage, config.sync_queue_cap);
        Self {
            inner: Arc::new(Inner {
                local,
                queue,
                remote,
                identity,
                clock,
                config,
                scheduler: Scheduler::new(),
                connectivity: Connectivity::default(),
                push_locks: DashMap::new(),
            }),
        }
    }

    /// Device-local game records.
    pub fn local_games(&self) -> Arc<LocalGames> {
        self.inner.local.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Wall clock used for timestamps.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Receiver following connectivity transitions.
    pub fn connectivity_watcher(&self) -> watch::Receiver<bool> {
        self.inner.connectivity.subscribe()
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Pending remote mutations.
    pub fn queue_status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    /// Queued items, oldest first.
    pub fn queued_items(&self) -> Vec<QueueItem> {
        self.inner.queue.items()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Handle that does not keep the coordinator alive, for background tasks.
    pub(crate) fn downgrade(&self) -> WeakCoordinator {
        WeakCoordinator(Arc::downgrade(&self.inner))
    }

    fn now(&self) -> TimestampMs {
        self.inner.clock.now_ms()
    }

    /// Create a game at quarter 1 for the current identity.
    ///
    /// Registered users get a local record mirrored remotely; guests get a device-only record,
    /// or a hybrid one when `share_public` is set. The remote write is attempted right away and
    /// queued on failure; the call succeeds as soon as the local write does.
    pub async fn create_game(&self, setup: GameSetup) -> Result<Game, SyncError> {
        setup.validate()?;
        let now = self.now();
        let user = self.inner.identity.current_user();

        let (family, owner) = match user {
            Some(user) if !user.is_anonymous => (
                RecordFamily::Local,
                Owner::Registered {
                    user_id: user.uid,
                    email: user.email.unwrap_or_default(),
                },
            ),
            user => {
                let device_id = self.inner.local.device().get_or_create(now).to_string();
                let family = if setup.share_public {
                    RecordFamily::Hybrid
                } else {
                    RecordFamily::Guest
                };
                let owner = Owner::Device {
                    device_id,
                    user_id: user.map(|user| user.uid),
                };
                (family, owner)
            }
        };

        let mut game = Game::new(setup, owner, now);
        if !self.inner.local.save_exclusive(family, &mut game, now) {
            return Err(SyncError::DataError(format!(
                "game `{}` could not be stored on this device",
                game.id
            )));
        }
        info!(game_id = %game.id, ?family, "created game");

        if family.is_remote_backed() {
            match self.push_inner(&game.id, true).await {
                Ok(outcome) => debug!(game_id = %game.id, ?outcome, "initial remote write"),
                Err(err) => warn!(game_id = %game.id, error = %err, "initial remote write failed"),
            }
            if let Some((_, latest)) = self.inner.local.find(&game.id) {
                game = latest;
            }
        }

        Ok(game)
    }

    /// Load a game, preferring the device copy.
    ///
    /// A remote-backed local copy whose last sync is older than the staleness window is compared
    /// with the remote copy by version. Without a local copy the remote one is fetched, with one
    /// re-fetch when the snapshot is incomplete.
    pub async fn load_game(&self, id: &str) -> Result<Game, SyncError> {
        let now = self.now();
        if let Some((family, game)) = self.inner.local.find(id) {
            warn_on_zero_duration(&game);
            if !family.is_remote_backed() || !self.is_online() {
                return Ok(game);
            }

            let stale = game
                .last_synced_at
                .is_none_or(|at| now - at > self.inner.config.staleness_ms as i64);
            if !stale {
                return Ok(game);
            }

            return match self.fetch_remote(id).await {
                Ok(remote) => Ok(self.reconcile(family, game, remote)),
                Err(err) => {
                    debug!(game_id = %id, error = %err, "remote check failed; using local copy");
                    Ok(game)
                }
            };
        }

        let Some(mut game) = self.fetch_remote(id).await? else {
            return Err(SyncError::NotFound(format!("game `{id}` not found")));
        };
        warn_on_zero_duration(&game);

        if let Some(family) = self.cache_family_for(&game) {
            game.last_synced_at = Some(now);
            if self.inner.local.save_exclusive(family, &mut game, now) {
                debug!(game_id = %id, ?family, "cached remote game on this device");
            }
        }
        Ok(game)
    }

    /// Record a goal for `team`.
    pub fn score(&self, id: &str, team: TeamSide) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.score(team, now))
    }

    /// Undo the most recent goal.
    pub fn undo_last_goal(&self, id: &str) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.undo_last_goal(now))
    }

    /// Stop the phase clock.
    pub fn pause(&self, id: &str) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.pause(now))
    }

    /// Start or restart the phase clock.
    pub fn resume(&self, id: &str) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.resume(now))
    }

    /// Move to the next phase immediately.
    pub fn advance_phase(&self, id: &str) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.advance_phase(now).map(|_| ()))
    }

    /// Return to quarter 1 with zero scores.
    pub fn reset(&self, id: &str) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| {
            game.reset(now);
            Ok(())
        })
    }

    /// Overwrite the totals by hand.
    pub fn edit_scores(&self, id: &str, scores: Scores) -> Result<Game, SyncError> {
        self.mutate(id, |game, now| game.edit_scores(scores, now))
    }

    /// Apply an automatic phase change if the clock has overrun its grace window.
    pub fn tick_clock(&self, id: &str) -> Result<Option<Phase>, SyncError> {
        let grace = self.inner.config.advance_grace_ms;
        let mut advanced = None;
        self.mutate_if(id, |game, now| {
            advanced = game.tick(now, grace);
            Ok(advanced.is_some())
        })?;
        if let Some(phase) = advanced {
            info!(game_id = %id, ?phase, "phase advanced automatically");
        }
        Ok(advanced)
    }

    /// Change public visibility.
    ///
    /// Sharing a guest-only game upgrades it to hybrid exactly once and writes it remotely.
    /// Unsharing keeps a hybrid game hybrid.
    pub async fn set_share_public(&self, id: &str, share_public: bool) -> Result<Game, SyncError> {
        let Some((family, mut game)) = self.inner.local.find(id) else {
            return Err(SyncError::NotFound(format!("game `{id}` not found")));
        };

        if family != RecordFamily::Guest {
            return self.mutate(id, |game, now| {
                game.set_share_public(share_public, now);
                Ok(())
            });
        }
        if !share_public {
            return Ok(game);
        }

        let now = self.now();
        game.set_share_public(true, now);
        if !self
            .inner
            .local
            .save_exclusive(RecordFamily::Hybrid, &mut game, now)
        {
            return Err(SyncError::DataError(format!(
                "game `{id}` could not be stored on this device"
            )));
        }
        info!(game_id = %id, "guest game upgraded to hybrid");

        match self.push_inner(id, true).await {
            Ok(outcome) => debug!(game_id = %id, ?outcome, "shared game written remotely"),
            Err(err) => warn!(game_id = %id, error = %err, "shared game could not be written remotely"),
        }
        Ok(self
            .inner
            .local
            .find(id)
            .map(|(_, latest)| latest)
            .unwrap_or(game))
    }

    /// Make the game publicly readable by id.
    pub async fn share_game(&self, id: &str) -> Result<Game, SyncError> {
        self.set_share_public(id, true).await
    }

    /// Delete the game everywhere.
    ///
    /// The remote copy goes first; if that fails the local copy is kept and the error surfaces.
    pub async fn delete_game(&self, id: &str) -> Result<(), SyncError> {
        let lock = self.push_lock(id);
        let _guard = lock.lock().await;
        self.inner.scheduler.cancel_game(id);

        let remote_backed = match self.inner.local.find(id) {
            Some((RecordFamily::Guest, _)) => false,
            Some((family, game)) => {
                self.check_owner(family, &game)?;
                true
            }
            None => {
                if self.inner.identity.current_user().is_none() {
                    return Err(SyncError::AuthenticationRequired);
                }
                true
            }
        };

        if remote_backed {
            match self.inner.remote.delete(GAMES_COLLECTION, id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(err) => {
                    warn!(game_id = %id, error = %err, "remote delete failed; keeping local copy");
                    return Err(err.into());
                }
            }
        }

        self.inner.local.remove_everywhere(id);
        self.inner.queue.remove(id);
        self.inner.push_locks.remove(id);
        info!(game_id = %id, "deleted game");
        Ok(())
    }

    /// Push the latest local state now, bypassing the debounce window.
    pub async fn sync_now(&self, id: &str) -> Result<PushOutcome, SyncError> {
        self.inner.scheduler.cancel(id, TaskKind::Debounce);
        self.push_inner(id, true).await
    }

    /// Deliver queued mutations owned by the current identity.
    ///
    /// Device-owned items queued before any session existed start an anonymous session first.
    pub async fn drain_sync_queue(&self) -> Result<DrainReport, SyncError> {
        let items = self.inner.queue.items();
        if items.is_empty() {
            return Ok(DrainReport::default());
        }

        let user = match self.inner.identity.current_user() {
            Some(user) => user,
            None if items.iter().any(is_device_owned) => {
                self.inner.identity.sign_in_anonymously().await.map_err(|err| {
                    warn!(error = %err, "anonymous sign-in for queued device games failed");
                    SyncError::AuthenticationRequired
                })?
            }
            None => return Err(SyncError::AuthenticationRequired),
        };

        let report = self
            .inner
            .queue
            .drain(|item| {
                let this = self.clone();
                let uid = user.uid.clone();
                async move { this.deliver(item, &uid).await }
            })
            .await;
        Ok(report)
    }

    /// Record a connectivity transition from the host environment.
    ///
    /// Network access of the remote store follows the signal; coming back online drains the
    /// sync queue and returns the drain report.
    pub async fn set_online(&self, online: bool) -> Option<DrainReport> {
        let restored = self.inner.connectivity.set_online(online);
        let toggle = if online {
            self.inner.remote.enable_network()
        } else {
            self.inner.remote.disable_network()
        };
        if let Err(err) = toggle.await {
            warn!(online, error = %err, "failed to toggle remote network access");
        }

        if !restored {
            return None;
        }
        match self.drain_sync_queue().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "sync queue drain failed");
                None
            }
        }
    }

    /// Forward connectivity signals from `signal` until its sender goes away.
    pub fn spawn_connectivity_listener(&self, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = self.downgrade();
        tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.set_online(online).await;
            }
        })
    }

    /// Summaries visible to the current identity, most recently updated first.
    ///
    /// Registered users see their local records merged with the remote owner query; guests see
    /// the device's hybrid and guest records.
    pub async fn list_games(&self) -> Vec<GameSummaryEntity> {
        let local = &self.inner.local;
        let mut merged: HashMap<GameId, GameSummaryEntity> = HashMap::new();
        let mut absorb = |entries: Vec<GameSummaryEntity>| {
            for entry in entries {
                match merged.get(&entry.id) {
                    Some(existing) if existing.version >= entry.version => {}
                    _ => {
                        merged.insert(entry.id.clone(), entry);
                    }
                }
            }
        };

        match self.inner.identity.current_user() {
            Some(user) if !user.is_anonymous => {
                absorb(local.family(RecordFamily::Local).list());
                absorb(self.remote_games_of(&user).await);
            }
            _ => {
                absorb(local.family(RecordFamily::Hybrid).list());
                absorb(local.family(RecordFamily::Guest).list());
            }
        }

        let mut games: Vec<_> = merged.into_values().collect();
        games.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        games
    }

    /// Finished games on this device for the current identity.
    pub fn list_completed(&self) -> Vec<GameSummaryEntity> {
        let families: &[RecordFamily] = match self.inner.identity.current_user() {
            Some(user) if !user.is_anonymous => &[RecordFamily::Local],
            _ => &[RecordFamily::Hybrid, RecordFamily::Guest],
        };
        families
            .iter()
            .flat_map(|family| self.inner.local.family(*family).list_completed())
            .collect()
    }

    /// Open a scoring session: periodic resync and clock polling until the handle drops.
    pub fn open_session(&self, id: &str) -> Result<GameSession, SyncError> {
        GameSession::open(self.clone(), id)
    }

    async fn remote_games_of(&self, user: &Identity) -> Vec<GameSummaryEntity> {
        let query = self.inner.remote.query(
            GAMES_COLLECTION,
            QueryFilter::eq("owner.userId", user.uid.clone()),
            Some(OrderBy::desc("createdAt")),
        );
        match query.await {
            Ok(documents) => documents
                .into_iter()
                .filter_map(|document| match Game::from_document(document) {
                    Ok(game) => Some(GameSummaryEntity::from(&game)),
                    Err(err) => {
                        warn!(error = %err, "skipping malformed remote game");
                        None
                    }
                })
                .collect(),
            Err(err) => {
                debug!(error = %err, "remote listing unavailable; showing local games only");
                Vec::new()
            }
        }
    }

    fn mutate<F>(&self, id: &str, op: F) -> Result<Game, SyncError>
    where
        F: FnOnce(&mut Game, TimestampMs) -> Result<(), MatchError>,
    {
        self.mutate_if(id, |game, now| op(game, now).map(|()| true))
    }

    /// Run `op` on the local copy; persist and schedule a remote write when it reports a change.
    fn mutate_if<F>(&self, id: &str, op: F) -> Result<Game, SyncError>
    where
        F: FnOnce(&mut Game, TimestampMs) -> Result<bool, MatchError>,
    {
        let Some((family, mut game)) = self.inner.local.find(id) else {
            return Err(SyncError::NotFound(format!("game `{id}` not found")));
        };
        self.check_owner(family, &game)?;

        let now = self.now();
        let version = game.version;
        if !op(&mut game, now)? || game.version == version {
            return Ok(game);
        }

        if !self.inner.local.family(family).save(&mut game, now) {
            return Err(SyncError::DataError(format!(
                "game `{id}` could not be stored on this device"
            )));
        }
        debug!(game_id = %id, version = game.version, "saved local mutation");
        self.schedule_push(family, id);
        Ok(game)
    }

    fn check_owner(&self, family: RecordFamily, game: &Game) -> Result<(), SyncError> {
        if family != RecordFamily::Local {
            return Ok(());
        }
        let user = self
            .inner
            .identity
            .current_user()
            .ok_or(SyncError::AuthenticationRequired)?;
        if game.owner.user_id() == Some(user.uid.as_str()) {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "game `{}` belongs to another user",
                game.id
            )))
        }
    }

    fn schedule_push(&self, family: RecordFamily, id: &str) {
        let delay = match family {
            RecordFamily::Guest => return,
            RecordFamily::Hybrid => self.inner.config.debounce(),
            RecordFamily::Local => {
                std::time::Duration::from_millis(self.inner.config.registered_mirror_delay_ms)
            }
        };
        self.inner.scheduler.schedule_once(
            id,
            TaskKind::Debounce,
            delay,
            push_task(self.downgrade(), id.to_string()),
        );
    }

    fn push_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner
            .push_locks
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Push the latest local copy of `id`, serialized per game.
    pub(crate) async fn push_inner(
        &self,
        id: &str,
        queue_on_failure: bool,
    ) -> Result<PushOutcome, SyncError> {
        let lock = self.push_lock(id);
        let _guard = lock.lock().await;

        let Some((family, mut game)) = self.inner.local.find(id) else {
            return Err(SyncError::NotFound(format!("game `{id}` not found")));
        };
        if !family.is_remote_backed() {
            return Ok(PushOutcome::LocalOnly);
        }

        match self.push_locked(family, &mut game).await {
            Ok(outcome) => {
                self.inner.queue.remove(id);
                Ok(outcome)
            }
            Err(err) if queue_on_failure && self.should_queue(family, &err) => {
                debug!(game_id = %id, error = %err, "remote write deferred to sync queue");
                self.enqueue(&game);
                Ok(PushOutcome::Queued)
            }
            Err(err) => Err(err),
        }
    }

    fn should_queue(&self, family: RecordFamily, err: &SyncError) -> bool {
        err.is_transient()
            || (family == RecordFamily::Hybrid && matches!(err, SyncError::AuthenticationRequired))
    }

    async fn push_locked(
        &self,
        family: RecordFamily,
        game: &mut Game,
    ) -> Result<PushOutcome, SyncError> {
        if !self.is_online() {
            return Err(SyncError::RemoteUnavailable(StorageError::Offline));
        }
        self.authorize(family, game).await?;

        let remote = self.inner.remote.get(GAMES_COLLECTION, &game.id).await?;
        match resolve(Some(&*game), remote.as_ref()).action {
            ConflictAction::PushLocal => {
                let document = game
                    .to_document()
                    .map_err(|err| SyncError::DataError(err.to_string()))?;
                self.inner
                    .remote
                    .set(GAMES_COLLECTION, &game.id, document, SetOptions::REPLACE)
                    .await?;
                self.mark_synced(family, &game.id);
                info!(game_id = %game.id, version = game.version, "pushed game to remote store");
                Ok(PushOutcome::Synced)
            }
            ConflictAction::Nothing => {
                self.mark_synced(family, &game.id);
                Ok(PushOutcome::AlreadyCurrent)
            }
            ConflictAction::OverwriteLocal => match remote {
                Some(document) => {
                    self.adopt_remote(family, Game::from_document(document)?);
                    Ok(PushOutcome::RemoteNewer)
                }
                None => Ok(PushOutcome::AlreadyCurrent),
            },
        }
    }

    /// Make sure the caller may write `game` remotely, binding anonymous games to a session.
    async fn authorize(&self, family: RecordFamily, game: &mut Game) -> Result<(), SyncError> {
        let user = match self.inner.identity.current_user() {
            Some(user) => user,
            None if family == RecordFamily::Hybrid => self
                .inner
                .identity
                .sign_in_anonymously()
                .await
                .map_err(|err| {
                    debug!(error = %err, "anonymous sign-in failed");
                    SyncError::AuthenticationRequired
                })?,
            None => return Err(SyncError::AuthenticationRequired),
        };

        match game.owner.user_id() {
            Some(owner) if owner != user.uid => Err(SyncError::PermissionDenied(format!(
                "game `{}` belongs to another user",
                game.id
            ))),
            Some(_) => Ok(()),
            None => {
                if let Owner::Device { user_id, .. } = &mut game.owner {
                    *user_id = Some(user.uid.clone());
                }
                let owner = serde_json::to_value(&game.owner)
                    .map_err(|err| SyncError::DataError(err.to_string()))?;
                self.inner
                    .local
                    .family(family)
                    .update(&game.id, &json!({ "owner": owner }));
                debug!(game_id = %game.id, uid = %user.uid, "bound game to anonymous session");
                Ok(())
            }
        }
    }

    fn mark_synced(&self, family: RecordFamily, id: &str) {
        let stamp = json!({ "lastSyncedAt": self.now() });
        if self.inner.local.family(family).update(id, &stamp).is_none() {
            debug!(game_id = %id, "game vanished locally before sync stamp");
        }
    }

    /// Replace the local copy with a strictly newer remote one.
    fn adopt_remote(&self, family: RecordFamily, mut remote: Game) -> Game {
        let store = self.inner.local.family(family);
        if let Some(current) = store.load(&remote.id) {
            if current.version >= remote.version {
                return current;
            }
        }

        let now = self.now();
        remote.last_synced_at = Some(now);
        store.save(&mut remote, now);
        info!(game_id = %remote.id, version = remote.version, "conflict resolved: remote copy is newer");
        remote
    }

    fn reconcile(&self, family: RecordFamily, local: Game, remote: Option<Game>) -> Game {
        match resolve(Some(&local), remote.as_ref()).action {
            ConflictAction::OverwriteLocal => match remote {
                Some(remote) => self.adopt_remote(family, remote),
                None => local,
            },
            ConflictAction::PushLocal => {
                info!(
                    game_id = %local.id,
                    version = local.version,
                    "conflict resolved: local copy is newer"
                );
                self.enqueue(&local);
                local
            }
            ConflictAction::Nothing => {
                self.mark_synced(family, &local.id);
                self.inner
                    .local
                    .family(family)
                    .load(&local.id)
                    .unwrap_or(local)
            }
        }
    }

    /// Point-read the remote copy, re-fetching once when the snapshot is incomplete.
    async fn fetch_remote(&self, id: &str) -> Result<Option<Game>, SyncError> {
        let mut last_error = None;
        for attempt in 0..2 {
            let Some(document) = self.inner.remote.get(GAMES_COLLECTION, id).await? else {
                return Ok(None);
            };
            match Game::from_document(document) {
                Ok(game) => return Ok(Some(game)),
                Err(err) => {
                    warn!(game_id = %id, attempt, error = %err, "remote game is incomplete");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .map(SyncError::from)
            .unwrap_or_else(|| SyncError::DataError(format!("game `{id}` is unreadable"))))
    }

    fn cache_family_for(&self, game: &Game) -> Option<RecordFamily> {
        let user = self.inner.identity.current_user()?;
        match &game.owner {
            Owner::Registered { user_id, .. } if *user_id == user.uid => Some(RecordFamily::Local),
            Owner::Device {
                user_id: Some(user_id),
                ..
            } if *user_id == user.uid => Some(RecordFamily::Hybrid),
            _ => None,
        }
    }

    fn enqueue(&self, game: &Game) {
        let payload = match game.to_document() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(game_id = %game.id, error = %err, "failed to encode game for sync queue");
                return;
            }
        };
        let operation = if game.last_synced_at.is_none() {
            QueueOperation::Create
        } else {
            QueueOperation::Update
        };
        self.inner.queue.enqueue(QueueItem {
            operation,
            game_id: game.id.clone(),
            timestamp: self.now(),
            version: game.version,
            payload,
        });
    }

    async fn deliver(&self, item: QueueItem, uid: &str) -> Result<Delivery, SyncError> {
        let owner = document::field(&item.payload, "owner.userId").and_then(Value::as_str);
        if owner.is_some_and(|owner| owner != uid) {
            return Ok(Delivery::Skipped);
        }

        if self.inner.local.find(&item.game_id).is_some() {
            self.push_inner(&item.game_id, false).await?;
            return Ok(Delivery::Delivered);
        }

        // The device copy is gone; deliver the queued payload as-is.
        let remote = self
            .inner
            .remote
            .get(GAMES_COLLECTION, &item.game_id)
            .await?;
        if resolve(Some(&item.payload), remote.as_ref()).action == ConflictAction::PushLocal {
            self.inner
                .remote
                .set(GAMES_COLLECTION, &item.game_id, item.payload, SetOptions::REPLACE)
                .await?;
        }
        Ok(Delivery::Delivered)
    }
}

/// Weak counterpart of [`SyncCoordinator`].
#[derive(Clone)]
pub(crate) struct WeakCoordinator(Weak<Inner>);

impl WeakCoordinator {
    pub(crate) fn upgrade(&self) -> Option<SyncCoordinator> {
        self.0.upgrade().map(|inner| SyncCoordinator { inner })
    }
}

pub(crate) fn push_task(
    coordinator: WeakCoordinator,
    id: GameId,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        match coordinator.push_inner(&id, true).await {
            Ok(outcome) => debug!(game_id = %id, ?outcome, "scheduled remote write finished"),
            Err(err) => warn!(game_id = %id, error = %err, "scheduled remote write failed"),
        }
    }
}

fn is_device_owned(item: &QueueItem) -> bool {
    document::field(&item.payload, "owner.type").and_then(Value::as_str) == Some("device")
}

fn warn_on_zero_duration(game: &Game) {
    if !game.is_finished() && state_machine::phase_duration_ms(&game.state.phase, &game.settings) == 0 {
        warn!(
            game_id = %game.id,
            phase = ?game.state.phase,
            "phase has no configured duration; clock treats it as already elapsed"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::{
        auth::MemoryIdentityProvider,
        clock::ManualClock,
        dao::{kv::MemoryKeyValueStore, remote::memory::MemoryRemoteStore},
        state::game::tests::sample_setup,
    };

    pub(crate) struct Harness {
        pub coordinator: SyncCoordinator,
        pub remote: MemoryRemoteStore,
        pub identity: MemoryIdentityProvider,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn harness_with(identity: Option<Identity>, config: SyncConfig) -> Harness {
        let identity = match identity {
            Some(identity) => MemoryIdentityProvider::signed_in(identity),
            None => MemoryIdentityProvider::new(),
        };
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let remote = MemoryRemoteStore::new(Arc::new(identity.clone()), clock.clone());
        let coordinator = SyncCoordinator::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(remote.clone()),
            Arc::new(identity.clone()),
            clock.clone(),
            config,
        );
        Harness {
            coordinator,
            remote,
            identity,
            clock,
        }
    }

    pub(crate) fn harness(identity: Option<Identity>) -> Harness {
        harness_with(identity, SyncConfig::default())
    }

    pub(crate) fn coach() -> Identity {
        Identity::registered("coach", "coach@example.com")
    }

    fn shared_setup() -> GameSetup {
        GameSetup {
            share_public: true,
            ..sample_setup()
        }
    }

    fn spectator(h: &Harness) -> MemoryRemoteStore {
        h.remote.connect_as(Arc::new(MemoryIdentityProvider::new()))
    }

    #[tokio::test]
    async fn guest_games_never_touch_the_remote_store() {
        let h = harness(None);
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        for _ in 0..3 {
            h.coordinator.score(&game.id, TeamSide::A).unwrap();
        }

        let (family, stored) = h.coordinator.local_games().find(&game.id).unwrap();
        assert_eq!(family, RecordFamily::Guest);
        assert_eq!(stored.version, 4);
        assert_eq!(stored.state.scores, Scores::new(3, 0));
        assert_eq!(h.remote.write_count(), 0);
        assert_eq!(h.coordinator.queue_status().pending, 0);
    }

    #[tokio::test]
    async fn invalid_setup_is_rejected() {
        let h = harness(None);
        let setup = GameSetup {
            num_quarters: 3,
            ..sample_setup()
        };
        assert!(matches!(
            h.coordinator.create_game(setup).await,
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hybrid_updates_are_debounced_into_one_write() {
        let h = harness(None);
        let game = h.coordinator.create_game(shared_setup()).await.unwrap();
        assert_eq!(h.remote.write_count(), 1);
        assert!(h.identity.current_user().is_some_and(|user| user.is_anonymous));

        for _ in 0..5 {
            h.coordinator.score(&game.id, TeamSide::B).unwrap();
            sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(h.remote.write_count(), 1);

        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(h.remote.write_count(), 2);
        let remote = h.remote.peek(GAMES_COLLECTION, &game.id).unwrap();
        assert_eq!(remote["version"], 6);
        assert_eq!(remote["state"]["scores"]["B"], 5);
    }

    #[tokio::test]
    async fn offline_registered_create_is_queued_then_drained() {
        let h = harness(Some(coach()));
        assert_eq!(h.coordinator.set_online(false).await, None);

        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        let loaded = h.coordinator.load_game(&game.id).await.unwrap();
        assert_eq!(loaded.id, game.id);
        let queued = h.coordinator.queued_items();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, QueueOperation::Create);
        assert!(h.remote.peek(GAMES_COLLECTION, &game.id).is_none());

        let report = h.coordinator.set_online(true).await.unwrap();
        assert_eq!(report.delivered, vec![game.id.clone()]);
        assert_eq!(h.coordinator.queue_status().pending, 0);
        let remote = h.remote.peek(GAMES_COLLECTION, &game.id).unwrap();
        assert_eq!(remote["version"], 1);
        assert_eq!(remote["owner"]["userId"], "coach");

        let (_, local) = h.coordinator.local_games().find(&game.id).unwrap();
        assert!(local.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn offline_shared_guest_game_reaches_the_remote_once_back_online() {
        let h = harness(None);
        assert_eq!(h.coordinator.set_online(false).await, None);

        let game = h.coordinator.create_game(shared_setup()).await.unwrap();
        assert_eq!(h.coordinator.queue_status().pending, 1);
        assert!(h.identity.current_user().is_none());
        assert!(h.remote.peek(GAMES_COLLECTION, &game.id).is_none());

        let report = h.coordinator.set_online(true).await.unwrap();
        assert_eq!(report.delivered, vec![game.id.clone()]);
        assert_eq!(h.coordinator.queue_status().pending, 0);

        let uid = h.identity.current_user().unwrap().uid;
        let remote = h.remote.peek(GAMES_COLLECTION, &game.id).unwrap();
        assert_eq!(remote["owner"]["type"], "device");
        assert_eq!(remote["owner"]["userId"], uid.as_str());
        assert_eq!(remote["sharePublic"], true);
    }

    #[tokio::test]
    async fn unreachable_remote_queues_instead_of_failing() {
        let h = harness(Some(coach()));
        h.remote.disable_network().await.unwrap();

        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        assert_eq!(game.version, 1);
        assert_eq!(h.coordinator.queue_status().pending, 1);
        assert_eq!(h.coordinator.sync_now(&game.id).await.unwrap(), PushOutcome::Queued);
    }

    #[tokio::test]
    async fn stale_local_copy_adopts_newer_remote() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        let mut elsewhere = Game::from_document(h.remote.peek(GAMES_COLLECTION, &game.id).unwrap()).unwrap();
        elsewhere.version = 5;
        elsewhere.state.scores = Scores::new(4, 1);
        h.remote
            .set(
                GAMES_COLLECTION,
                &game.id,
                elsewhere.to_document().unwrap(),
                SetOptions::REPLACE,
            )
            .await
            .unwrap();

        h.clock.advance(31_000);
        let loaded = h.coordinator.load_game(&game.id).await.unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.state.scores, Scores::new(4, 1));

        let (_, cached) = h.coordinator.local_games().find(&game.id).unwrap();
        assert_eq!(cached.version, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_remote_copy_is_queued_for_push() {
        let config = SyncConfig {
            registered_mirror_delay_ms: 60_000,
            ..SyncConfig::default()
        };
        let h = harness_with(Some(coach()), config);
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        h.coordinator.score(&game.id, TeamSide::A).unwrap();

        h.clock.advance(31_000);
        let loaded = h.coordinator.load_game(&game.id).await.unwrap();
        assert_eq!(loaded.version, 2);
        let queued = h.coordinator.queued_items();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, QueueOperation::Update);
        assert_eq!(queued[0].version, 2);
    }

    #[tokio::test]
    async fn push_never_overwrites_a_newer_remote_record() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        h.remote
            .update(GAMES_COLLECTION, &game.id, json!({"version": 10}))
            .await
            .unwrap();

        h.coordinator.score(&game.id, TeamSide::A).unwrap();
        assert_eq!(
            h.coordinator.sync_now(&game.id).await.unwrap(),
            PushOutcome::RemoteNewer
        );
        assert_eq!(h.remote.peek(GAMES_COLLECTION, &game.id).unwrap()["version"], 10);
        let (_, local) = h.coordinator.local_games().find(&game.id).unwrap();
        assert_eq!(local.version, 10);
    }

    #[tokio::test]
    async fn sharing_a_guest_game_makes_it_publicly_readable() {
        let h = harness(None);
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        let viewer = spectator(&h);
        assert!(viewer.get(GAMES_COLLECTION, &game.id).await.unwrap().is_none());

        let shared = h.coordinator.set_share_public(&game.id, true).await.unwrap();
        assert!(shared.share_public);
        let public = viewer.get(GAMES_COLLECTION, &game.id).await.unwrap().unwrap();
        assert_eq!(public["sharePublic"], true);

        let local = h.coordinator.local_games();
        assert!(!local.family(RecordFamily::Guest).contains(&game.id));
        assert!(local.family(RecordFamily::Hybrid).contains(&game.id));

        let unshared = h.coordinator.set_share_public(&game.id, false).await.unwrap();
        assert!(!unshared.share_public);
        assert!(local.family(RecordFamily::Hybrid).contains(&game.id));
    }

    #[tokio::test]
    async fn only_the_owner_may_mutate_registered_games() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();

        h.identity
            .set_current(Some(Identity::registered("rival", "rival@example.com")));
        assert!(matches!(
            h.coordinator.score(&game.id, TeamSide::A),
            Err(SyncError::PermissionDenied(_))
        ));

        h.identity.set_current(None);
        assert!(matches!(
            h.coordinator.score(&game.id, TeamSide::A),
            Err(SyncError::AuthenticationRequired)
        ));
    }

    #[tokio::test]
    async fn finished_games_reject_goals() {
        let h = harness(None);
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        for _ in 0..7 {
            h.coordinator.advance_phase(&game.id).unwrap();
        }
        assert!(matches!(
            h.coordinator.score(&game.id, TeamSide::A),
            Err(SyncError::InvalidState(_))
        ));
        assert_eq!(h.coordinator.list_completed().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_both_copies() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        assert!(h.remote.peek(GAMES_COLLECTION, &game.id).is_some());

        h.coordinator.delete_game(&game.id).await.unwrap();
        assert!(h.remote.peek(GAMES_COLLECTION, &game.id).is_none());
        assert!(h.coordinator.local_games().find(&game.id).is_none());
        assert!(matches!(
            h.coordinator.load_game(&game.id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_remote_delete_keeps_the_local_copy() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        h.remote.disable_network().await.unwrap();

        let err = h.coordinator.delete_game(&game.id).await.unwrap_err();
        assert!(err.is_transient());
        assert!(h.coordinator.local_games().find(&game.id).is_some());
    }

    #[tokio::test]
    async fn out_of_band_remote_delete_is_recreated_by_the_next_push() {
        let h = harness(None);
        let game = h.coordinator.create_game(shared_setup()).await.unwrap();
        h.remote.purge(GAMES_COLLECTION, &game.id);

        assert_eq!(h.coordinator.sync_now(&game.id).await.unwrap(), PushOutcome::Synced);
        assert!(h.remote.peek(GAMES_COLLECTION, &game.id).is_some());
    }

    #[tokio::test]
    async fn registered_listing_merges_remote_games() {
        let h = harness(Some(coach()));
        let local_game = h.coordinator.create_game(sample_setup()).await.unwrap();

        let mut elsewhere = Game::new(
            sample_setup(),
            Owner::Registered {
                user_id: "coach".into(),
                email: "coach@example.com".into(),
            },
            1_000,
        );
        elsewhere.id = "from_other_device".into();
        h.remote
            .set(
                GAMES_COLLECTION,
                &elsewhere.id,
                elsewhere.to_document().unwrap(),
                SetOptions::REPLACE,
            )
            .await
            .unwrap();

        let ids: Vec<_> = h
            .coordinator
            .list_games()
            .await
            .into_iter()
            .map(|summary| summary.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&local_game.id));
        assert!(ids.contains(&elsewhere.id));
    }

    #[tokio::test]
    async fn remote_only_games_are_cached_for_their_owner() {
        let h = harness(Some(coach()));
        let mut game = Game::new(
            sample_setup(),
            Owner::Registered {
                user_id: "coach".into(),
                email: "coach@example.com".into(),
            },
            1_000,
        );
        game.id = "remote_only".into();
        h.remote
            .set(GAMES_COLLECTION, &game.id, game.to_document().unwrap(), SetOptions::REPLACE)
            .await
            .unwrap();

        let loaded = h.coordinator.load_game("remote_only").await.unwrap();
        assert!(loaded.last_synced_at.is_some());
        let (family, _) = h.coordinator.local_games().find("remote_only").unwrap();
        assert_eq!(family, RecordFamily::Local);
    }

    #[tokio::test]
    async fn incomplete_remote_snapshot_is_a_data_error() {
        let h = harness(Some(coach()));
        h.remote
            .set(
                GAMES_COLLECTION,
                "partial",
                json!({"owner": {"type": "registered", "userId": "coach", "email": "c"}, "version": 1}),
                SetOptions::REPLACE,
            )
            .await
            .unwrap();
        assert!(matches!(
            h.coordinator.load_game("partial").await,
            Err(SyncError::DataError(_))
        ));
    }
}
