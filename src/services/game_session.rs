//! Lifetime of a game open on the scoring screen.

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
    error::SyncError,
    services::{
        scheduler::TaskKind,
        sync_coordinator::{PushOutcome, SyncCoordinator, push_task},
    },
    state::game::{Game, GameId},
};

/// Keeps the background work of one open game running: the clock poll that applies automatic
/// phase changes and, for remote-backed games, the periodic resync.
///
/// Dropping the session stops both and flushes a pending debounced write immediately.
pub struct GameSession {
    coordinator: SyncCoordinator,
    game_id: GameId,
}

impl GameSession {
    pub(crate) fn open(coordinator: SyncCoordinator, id: &str) -> Result<Self, SyncError> {
        let Some((family, _)) = coordinator.local_games().find(id) else {
            return Err(SyncError::NotFound(format!("game `{id}` is not on this device")));
        };
        let config = coordinator.config().clone();
        let scheduler = coordinator.scheduler();

        let weak = coordinator.downgrade();
        let game_id = id.to_string();
        scheduler.schedule_interval(id, TaskKind::ClockPoll, config.clock_poll(), move || {
            let weak = weak.clone();
            let game_id = game_id.clone();
            async move {
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = coordinator.tick_clock(&game_id) {
                    debug!(game_id = %game_id, error = %err, "clock poll skipped");
                }
            }
        });

        if family.is_remote_backed() {
            let weak = coordinator.downgrade();
            let game_id = id.to_string();
            scheduler.schedule_interval(id, TaskKind::Resync, config.resync_interval(), move || {
                push_task(weak.clone(), game_id.clone())
            });
        }

        info!(game_id = %id, ?family, "opened game session");
        Ok(Self {
            coordinator,
            game_id: id.to_string(),
        })
    }

    /// Id of the open game.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Latest device copy.
    pub fn game(&self) -> Option<Game> {
        self.coordinator
            .local_games()
            .find(&self.game_id)
            .map(|(_, game)| game)
    }

    /// Push now instead of waiting for the debounce window.
    pub async fn sync_now(&self) -> Result<PushOutcome, SyncError> {
        self.coordinator.sync_now(&self.game_id).await
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        let scheduler = self.coordinator.scheduler();
        scheduler.cancel(&self.game_id, TaskKind::ClockPoll);
        scheduler.cancel(&self.game_id, TaskKind::Resync);

        if scheduler.cancel(&self.game_id, TaskKind::Debounce) {
            match Handle::try_current() {
                Ok(handle) => {
                    debug!(game_id = %self.game_id, "flushing pending write on close");
                    handle.spawn(push_task(self.coordinator.downgrade(), self.game_id.clone()));
                }
                Err(_) => debug!(game_id = %self.game_id, "no runtime to flush pending write"),
            }
        }
        info!(game_id = %self.game_id, "closed game session");
    }
}
