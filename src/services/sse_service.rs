use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    dto::{
        public::PublicGameResponse,
        sse::{GameNotFoundEvent, Handshake, ServerEvent, SystemStatus},
    },
    error::SyncError,
    services::live_view::{LiveView, LiveViewState},
    state::SharedState,
};

/// Open a live view of `id` for an SSE client.
pub async fn subscribe_game(state: &SharedState, id: &str) -> Result<LiveView, SyncError> {
    let subscriber = state.live_views().await?;
    Ok(subscriber.open(id))
}

/// Translate a live view state into the event sent to spectators.
pub fn event_for(game_id: &str, view: &LiveViewState, clock: &dyn Clock) -> Option<ServerEvent> {
    let encoded = match view {
        LiveViewState::Loading => return None,
        LiveViewState::Live { game, .. } => ServerEvent::json(
            Some("game".to_string()),
            &PublicGameResponse::from_game(game, clock.now_ms()),
        ),
        LiveViewState::NotFound => ServerEvent::json(
            Some("not_found".to_string()),
            &GameNotFoundEvent {
                game_id: game_id.to_string(),
            },
        ),
    };
    match encoded {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(game_id, error = %err, "failed to encode live view event");
            None
        }
    }
}

fn handshake(state: &SharedState, game_id: &str) -> Option<ServerEvent> {
    ServerEvent::json(
        Some("handshake".to_string()),
        &Handshake {
            game_id: game_id.to_string(),
            message: "live view connected".into(),
            degraded: state.is_degraded(),
        },
    )
    .ok()
}

fn system_status(degraded: bool) -> Option<ServerEvent> {
    ServerEvent::json(Some("system_status".to_string()), &SystemStatus { degraded }).ok()
}

fn into_event(payload: ServerEvent) -> Event {
    let event = Event::default().data(payload.data);
    match payload.event {
        Some(name) => event.event(name),
        None => event,
    }
}

/// Forward a live view into an SSE response until the client disconnects.
///
/// Every change of the view becomes a `game` or `not_found` event; degraded mode toggles are
/// reported as `system_status`.
pub fn to_sse_stream(
    state: SharedState,
    game_id: String,
    mut view: LiveView,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);
    let clock: Arc<dyn Clock> = state.clock();
    let mut degraded = state.degraded_watcher();

    tokio::spawn(async move {
        let mut pending: Vec<ServerEvent> = handshake(&state, &game_id).into_iter().collect();
        pending.extend(event_for(&game_id, &view.take_current(), clock.as_ref()));

        'forward: loop {
            for payload in pending.drain(..) {
                if tx.send(Ok(into_event(payload))).await.is_err() {
                    break 'forward;
                }
            }

            tokio::select! {
                _ = tx.closed() => break,
                change = view.changed() => match change {
                    Some(next) => pending.extend(event_for(&game_id, &next, clock.as_ref())),
                    None => {
                        debug!(game_id = %game_id, "live view ended");
                        break;
                    }
                },
                changed = degraded.changed() => match changed {
                    Ok(()) => pending.extend(system_status(*degraded.borrow_and_update())),
                    Err(_) => break,
                },
            }
        }

        info!(game_id = %game_id, "live SSE stream disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{clock::ManualClock, state::game::tests::sample_game};

    #[test]
    fn live_states_become_named_events() {
        let clock = ManualClock::new(1_000);
        let game = sample_game();
        let live = LiveViewState::Live {
            game: Box::new(game.clone()),
            source: crate::services::live_view::ViewSource::Remote,
        };

        let event = event_for(&game.id, &live, &clock).unwrap();
        assert_eq!(event.event.as_deref(), Some("game"));
        let body: Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(body["remainingMs"], 600_000);

        let missing = event_for("gone", &LiveViewState::NotFound, &clock).unwrap();
        assert_eq!(missing.event.as_deref(), Some("not_found"));
        assert_eq!(missing.data, r#"{"gameId":"gone"}"#);

        assert!(event_for("x", &LiveViewState::Loading, &clock).is_none());
    }
}
