use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{error::AppError, services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/games/{id}",
    tag = "sse",
    params(("id" = String, Path, description = "Game identifier")),
    responses(
        (status = 200, description = "Live game stream", content_type = "text/event-stream", body = String),
        (status = 503, description = "Remote store unavailable")
    )
)]
/// Stream live updates of a shared game to spectators.
pub async fn game_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let view = sse_service::subscribe_game(&state, &id).await?;
    info!(game_id = %id, "new live SSE connection");
    Ok(sse_service::to_sse_stream(state, id, view))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/games/{id}", get(game_stream))
}
