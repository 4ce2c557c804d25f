//! Read-only public projections of shared games.

use serde_json::Value;
use tracing::warn;

use crate::{
    dao::remote::GAMES_COLLECTION,
    dto::public::PublicGameResponse,
    error::SyncError,
    state::{SharedState, game::Game},
};

/// Point-read a shared game and project it for spectators.
///
/// Private games are reported as missing. An incomplete snapshot is read once more before
/// the game is reported unreadable.
pub async fn get_game(state: &SharedState, id: &str) -> Result<PublicGameResponse, SyncError> {
    let remote = state.require_remote_store().await?;
    let not_found = || SyncError::NotFound(format!("game `{id}` not found"));

    let mut attempt = 0;
    let game = loop {
        let document = remote
            .get(GAMES_COLLECTION, id)
            .await?
            .ok_or_else(not_found)?;
        if document.get("sharePublic").and_then(Value::as_bool) != Some(true) {
            return Err(not_found());
        }

        match Game::from_document(document) {
            Ok(game) => break game,
            Err(err) if attempt == 0 => {
                warn!(game_id = %id, error = %err, "incomplete public snapshot; reading again");
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    };

    Ok(PublicGameResponse::from_game(&game, state.clock().now_ms()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        auth::MemoryIdentityProvider,
        config::SyncConfig,
        dao::remote::{RemoteStore, SetOptions},
        dto::setup::GameSetup,
        services::sync_coordinator::tests::{Harness, coach, harness},
        state::{AppState, game::tests::sample_setup},
    };

    async fn relay(h: &Harness) -> SharedState {
        let state = AppState::new(h.clock.clone(), SyncConfig::default());
        let spectator = h.remote.connect_as(Arc::new(MemoryIdentityProvider::new()));
        state.install_remote_store(Arc::new(spectator)).await;
        state
    }

    #[tokio::test]
    async fn shared_games_are_readable_without_identity() {
        let h = harness(None);
        let setup = GameSetup {
            share_public: true,
            ..sample_setup()
        };
        let game = h.coordinator.create_game(setup).await.unwrap();
        h.coordinator.resume(&game.id).unwrap();
        h.coordinator.sync_now(&game.id).await.unwrap();
        h.clock.advance(90_000);

        let response = get_game(&relay(&h).await, &game.id).await.unwrap();
        assert_eq!(response.id, game.id);
        assert!(response.is_running);
        assert_eq!(response.remaining_ms, 510_000);
    }

    #[tokio::test]
    async fn private_and_unknown_games_are_not_found() {
        let h = harness(Some(coach()));
        let game = h.coordinator.create_game(sample_setup()).await.unwrap();
        let state = relay(&h).await;

        assert!(matches!(
            get_game(&state, &game.id).await,
            Err(SyncError::PermissionDenied(_))
        ));
        assert!(matches!(
            get_game(&state, "unknown").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn incomplete_snapshot_is_read_twice_before_failing() {
        let h = harness(Some(coach()));
        h.remote
            .set(
                GAMES_COLLECTION,
                "partial",
                json!({
                    "owner": {"type": "registered", "userId": "coach", "email": "c"},
                    "sharePublic": true,
                    "version": 1
                }),
                SetOptions::REPLACE,
            )
            .await
            .unwrap();
        let state = relay(&h).await;
        let reads = h.remote.read_count();

        assert!(matches!(
            get_game(&state, "partial").await,
            Err(SyncError::DataError(_))
        ));
        assert_eq!(h.remote.read_count() - reads, 2);
    }

    #[tokio::test]
    async fn degraded_relay_is_unavailable() {
        let h = harness(None);
        let state = AppState::new(h.clock.clone(), SyncConfig::default());
        let err = get_game(&state, "any").await.unwrap_err();
        assert!(err.is_transient());
    }
}
