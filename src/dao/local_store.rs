//! Same-device game storage split into three record families sharing one implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    clock::TimestampMs,
    config::SyncConfig,
    dao::{
        device::DeviceIdentity,
        document::merge_patch,
        kv::{KeyValueStore, LocalStoreError},
        models::GameSummaryEntity,
    },
    state::game::{Game, Owner},
};

/// Namespace a record lives in on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFamily {
    /// Anonymous game that never leaves the device.
    Guest,
    /// Anonymous game mirrored remotely so it can be shared.
    Hybrid,
    /// Registered user's local cache of a remote game.
    Local,
}

impl RecordFamily {
    /// Every family, in lookup order (most authoritative first).
    pub const ALL: [RecordFamily; 3] = [RecordFamily::Local, RecordFamily::Hybrid, RecordFamily::Guest];

    /// Key prefix for full records.
    pub fn record_prefix(self) -> &'static str {
        match self {
            RecordFamily::Guest => "guest_game_",
            RecordFamily::Hybrid => "hybrid_guest_game_",
            RecordFamily::Local => "local_game_",
        }
    }

    /// Key of the full record for `id`.
    pub fn record_key(self, id: &str) -> String {
        format!("{}{id}", self.record_prefix())
    }

    /// Key of the summary list.
    pub fn list_key(self) -> &'static str {
        match self {
            RecordFamily::Guest => "guest_games_list",
            RecordFamily::Hybrid => "hybrid_guest_games_list",
            RecordFamily::Local => "local_games_list",
        }
    }

    /// Whether loads must match the stored device tag against this device.
    pub fn checks_device(self) -> bool {
        !matches!(self, RecordFamily::Local)
    }

    /// Whether records of this family also exist in the remote store.
    pub fn is_remote_backed(self) -> bool {
        !matches!(self, RecordFamily::Guest)
    }

    /// Summary list cap from configuration.
    pub fn list_cap(self, config: &SyncConfig) -> usize {
        match self {
            RecordFamily::Guest => config.guest_list_cap,
            RecordFamily::Hybrid => config.hybrid_list_cap,
            RecordFamily::Local => config.local_list_cap,
        }
    }
}

/// CRUD over one record family.
///
/// Storage failures are logged and reported as "no data" or a failed save; they never
/// propagate as errors.
pub struct LocalGameStore {
    family: RecordFamily,
    storage: Arc<dyn KeyValueStore>,
    device: Arc<DeviceIdentity>,
    cap: usize,
}

impl LocalGameStore {
    /// Build the store for `family`.
    pub fn new(
        family: RecordFamily,
        storage: Arc<dyn KeyValueStore>,
        device: Arc<DeviceIdentity>,
        cap: usize,
    ) -> Self {
        Self {
            family,
            storage,
            device,
            cap: cap.max(1),
        }
    }

    /// Family served by this store.
    pub fn family(&self) -> RecordFamily {
        self.family
    }

    /// Upsert the full record and move its summary to the front of the list.
    ///
    /// Anonymous records are stamped with this device's tag. Returns whether the record was
    /// persisted.
    pub fn save(&self, game: &mut Game, now: TimestampMs) -> bool {
        if self.family.checks_device() {
            if let Owner::Device { device_id, .. } = &mut game.owner {
                let current = self.device.get_or_create(now);
                if device_id.as_str() != current {
                    *device_id = current.to_string();
                }
            }
        }

        match self.try_save(game) {
            Ok(()) => true,
            Err(err) => {
                warn!(family = ?self.family, game_id = %game.id, error = %err, "failed to save game locally");
                false
            }
        }
    }

    /// Load the full record; a record stamped by another device reads as absent.
    pub fn load(&self, id: &str) -> Option<Game> {
        let document = self.load_document(id)?;
        match Game::from_document(document) {
            Ok(game) => self.check_device(game),
            Err(err) => {
                warn!(family = ?self.family, game_id = %id, error = %err, "stored game is malformed");
                None
            }
        }
    }

    /// Shallow-merge `patch` into the stored record, merging `state` field by field.
    ///
    /// Returns the merged record, or `None` when the record is absent or the merge would
    /// produce an invalid game.
    pub fn update(&self, id: &str, patch: &Value) -> Option<Game> {
        let current = self.load(id)?;
        let mut document = match current.to_document() {
            Ok(document) => document,
            Err(err) => {
                warn!(game_id = %id, error = %err, "failed to encode stored game");
                return None;
            }
        };

        merge_patch(&mut document, patch, &["state"]);

        let merged = match Game::from_document(document) {
            Ok(game) => game,
            Err(err) => {
                warn!(family = ?self.family, game_id = %id, error = %err, "rejected update producing an invalid game");
                return None;
            }
        };

        match self.try_save(&merged) {
            Ok(()) => Some(merged),
            Err(err) => {
                warn!(family = ?self.family, game_id = %id, error = %err, "failed to persist game update");
                None
            }
        }
    }

    /// Remove the record and its summary entry. Idempotent.
    pub fn delete(&self, id: &str) {
        if let Err(err) = self.storage.remove_item(&self.family.record_key(id)) {
            warn!(family = ?self.family, game_id = %id, error = %err, "failed to remove stored game");
        }

        let mut list = self.list();
        let before = list.len();
        list.retain(|entry| entry.id != id);
        if list.len() != before {
            if let Err(err) = self.write_list(&list) {
                warn!(family = ?self.family, error = %err, "failed to rewrite game list");
            }
        }
    }

    /// Whether a record is stored for `id` on this device.
    pub fn contains(&self, id: &str) -> bool {
        self.load(id).is_some()
    }

    /// Summary list, most recent first.
    pub fn list(&self) -> Vec<GameSummaryEntity> {
        let raw = match self.storage.get_item(self.family.list_key()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(family = ?self.family, error = %err, "failed to read game list");
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(family = ?self.family, error = %err, "game list is malformed; ignoring it");
            Vec::new()
        })
    }

    /// Summaries whose full record has reached full time.
    pub fn list_completed(&self) -> Vec<GameSummaryEntity> {
        self.list()
            .into_iter()
            .filter(|entry| {
                self.load(&entry.id)
                    .is_some_and(|game| game.state.phase.is_fulltime())
            })
            .collect()
    }

    fn load_document(&self, id: &str) -> Option<Value> {
        let raw = match self.storage.get_item(&self.family.record_key(id)) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(family = ?self.family, game_id = %id, error = %err, "failed to read stored game");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(document) => Some(document),
            Err(err) => {
                warn!(family = ?self.family, game_id = %id, error = %err, "stored game is not valid JSON");
                None
            }
        }
    }

    fn check_device(&self, game: Game) -> Option<Game> {
        if !self.family.checks_device() {
            return Some(game);
        }

        let current = self.device.current();
        match (game.owner.device_id(), current.as_deref()) {
            (Some(stored), Some(current)) if stored == current => Some(game),
            (stored, current) => {
                debug!(
                    family = ?self.family,
                    game_id = %game.id,
                    stored = ?stored,
                    current = ?current,
                    "ignoring game stamped by another device"
                );
                None
            }
        }
    }

    fn try_save(&self, game: &Game) -> Result<(), SaveError> {
        let encoded = serde_json::to_string(game)?;
        self.storage
            .set_item(&self.family.record_key(&game.id), &encoded)?;

        let mut list = self.list();
        list.retain(|entry| entry.id != game.id);
        list.insert(0, GameSummaryEntity::from(game));
        list.truncate(self.cap);
        self.write_list(&list)
    }

    fn write_list(&self, list: &[GameSummaryEntity]) -> Result<(), SaveError> {
        let encoded = serde_json::to_string(list)?;
        self.storage.set_item(self.family.list_key(), &encoded)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum SaveError {
    #[error(transparent)]
    Storage(#[from] LocalStoreError),
    #[error("failed to encode game")]
    Encode(#[from] serde_json::Error),
}

/// The three record families of one device, keeping at most one representation per id.
pub struct LocalGames {
    guest: LocalGameStore,
    hybrid: LocalGameStore,
    local: LocalGameStore,
    device: Arc<DeviceIdentity>,
}

impl LocalGames {
    /// Build all three families over the same device storage.
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &SyncConfig) -> Self {
        let device = Arc::new(DeviceIdentity::new(storage.clone()));
        let build = |family: RecordFamily| {
            LocalGameStore::new(
                family,
                storage.clone(),
                device.clone(),
                family.list_cap(config),
            )
        };

        Self {
            guest: build(RecordFamily::Guest),
            hybrid: build(RecordFamily::Hybrid),
            local: build(RecordFamily::Local),
            device,
        }
    }

    /// Store serving `family`.
    pub fn family(&self, family: RecordFamily) -> &LocalGameStore {
        match family {
            RecordFamily::Guest => &self.guest,
            RecordFamily::Hybrid => &self.hybrid,
            RecordFamily::Local => &self.local,
        }
    }

    /// This device's identity.
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Locate a record in any family.
    pub fn find(&self, id: &str) -> Option<(RecordFamily, Game)> {
        RecordFamily::ALL
            .into_iter()
            .find_map(|family| self.family(family).load(id).map(|game| (family, game)))
    }

    /// Save into `family` and drop copies held by the other families.
    ///
    /// A hybrid game never goes back to being guest-only; such a save is refused.
    pub fn save_exclusive(&self, family: RecordFamily, game: &mut Game, now: TimestampMs) -> bool {
        if family == RecordFamily::Guest && self.hybrid.contains(&game.id) {
            warn!(game_id = %game.id, "refusing to downgrade a shared game to guest-only");
            return false;
        }

        if !self.family(family).save(game, now) {
            return false;
        }

        for other in RecordFamily::ALL.into_iter().filter(|f| *f != family) {
            let store = self.family(other);
            if store.contains(&game.id) {
                debug!(game_id = %game.id, from = ?other, to = ?family, "dropping superseded local copy");
                store.delete(&game.id);
            }
        }
        true
    }

    /// Remove the record from every family.
    pub fn remove_everywhere(&self, id: &str) {
        for family in RecordFamily::ALL {
            self.family(family).delete(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        dao::kv::MemoryKeyValueStore,
        state::game::{Scores, TeamSide, tests::sample_game},
        state::state_machine::Phase,
    };

    fn games() -> (Arc<MemoryKeyValueStore>, LocalGames) {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let games = LocalGames::new(storage.clone(), &SyncConfig::default());
        (storage, games)
    }

    #[test]
    fn keys_match_existing_layout() {
        assert_eq!(RecordFamily::Guest.record_key("x1"), "guest_game_x1");
        assert_eq!(RecordFamily::Hybrid.record_key("x1"), "hybrid_guest_game_x1");
        assert_eq!(RecordFamily::Local.record_key("x1"), "local_game_x1");
        assert_eq!(RecordFamily::Guest.list_key(), "guest_games_list");
        assert_eq!(RecordFamily::Hybrid.list_key(), "hybrid_guest_games_list");
        assert_eq!(RecordFamily::Local.list_key(), "local_games_list");
    }

    #[test]
    fn save_then_load_round_trips_in_every_family() {
        let (_, games) = games();
        for family in RecordFamily::ALL {
            let store = games.family(family);
            let mut game = sample_game();
            assert!(store.save(&mut game, 5));
            assert_eq!(store.load(&game.id), Some(game.clone()));
        }
    }

    #[test]
    fn records_from_another_device_are_invisible() {
        let (storage, games) = games();
        let mut game = sample_game();
        games.family(RecordFamily::Guest).save(&mut game, 5);

        let mut foreign = game.clone();
        foreign.owner = Owner::Device {
            device_id: "device_elsewhere".into(),
            user_id: None,
        };
        storage
            .set_item(
                &RecordFamily::Guest.record_key(&game.id),
                &serde_json::to_string(&foreign).unwrap(),
            )
            .unwrap();

        assert_eq!(games.family(RecordFamily::Guest).load(&game.id), None);
    }

    #[test]
    fn partial_state_update_preserves_other_fields() {
        let (_, games) = games();
        let store = games.family(RecordFamily::Hybrid);
        let mut game = sample_game();
        game.state.centre_pass = TeamSide::B;
        store.save(&mut game, 5);

        let merged = store
            .update(&game.id, &json!({"state": {"scores": {"A": 5, "B": 3}}}))
            .unwrap();
        assert_eq!(merged.state.scores, Scores::new(5, 3));
        assert_eq!(merged.state.centre_pass, TeamSide::B);
        assert_eq!(merged.state.phase, Phase::OPENING);
        assert_eq!(store.load(&game.id), Some(merged));

        assert!(store.update("missing", &json!({"sharePublic": true})).is_none());
    }

    #[test]
    fn update_rejects_patches_that_break_the_record() {
        let (_, games) = games();
        let store = games.family(RecordFamily::Local);
        let mut game = sample_game();
        store.save(&mut game, 5);

        assert!(store.update(&game.id, &json!({"state": null})).is_none());
        assert_eq!(store.load(&game.id), Some(game));
    }

    #[test]
    fn delete_is_idempotent_and_clears_summary() {
        let (_, games) = games();
        let store = games.family(RecordFamily::Guest);
        let mut game = sample_game();
        store.save(&mut game, 5);
        assert_eq!(store.list().len(), 1);

        store.delete(&game.id);
        store.delete(&game.id);
        assert!(store.load(&game.id).is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn summary_list_is_most_recent_first_and_capped() {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let config = SyncConfig {
            guest_list_cap: 3,
            ..SyncConfig::default()
        };
        let games = LocalGames::new(storage, &config);
        let store = games.family(RecordFamily::Guest);

        for n in 0..5 {
            let mut game = sample_game();
            game.id = format!("game{n}");
            store.save(&mut game, n);
        }

        let mut again = store.load("game1").unwrap();
        store.save(&mut again, 10);

        let listed: Vec<_> = store.list().into_iter().map(|e| e.id).collect();
        assert_eq!(listed, vec!["game1", "game4", "game3"]);
    }

    #[test]
    fn list_completed_reads_full_records() {
        let (_, games) = games();
        let store = games.family(RecordFamily::Local);

        let mut done = sample_game();
        done.id = "done".into();
        done.state.phase = Phase::Fulltime;
        store.save(&mut done, 1);

        let mut live = sample_game();
        live.id = "live".into();
        store.save(&mut live, 2);

        let completed: Vec<_> = store.list_completed().into_iter().map(|e| e.id).collect();
        assert_eq!(completed, vec!["done"]);
    }

    #[test]
    fn exclusive_save_moves_guest_to_hybrid_once() {
        let (_, games) = games();
        let mut game = sample_game();
        assert!(games.save_exclusive(RecordFamily::Guest, &mut game, 1));

        game.share_public = true;
        assert!(games.save_exclusive(RecordFamily::Hybrid, &mut game, 2));
        assert!(!games.family(RecordFamily::Guest).contains(&game.id));
        assert_eq!(games.find(&game.id).map(|(f, _)| f), Some(RecordFamily::Hybrid));

        assert!(!games.save_exclusive(RecordFamily::Guest, &mut game, 3));
        assert_eq!(games.find(&game.id).map(|(f, _)| f), Some(RecordFamily::Hybrid));
    }
}
