use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::{
    dto::public::PublicGameResponse, error::AppError, services::public_service, state::SharedState,
};

/// Public read-only endpoints exposing shared games.
pub fn router() -> Router<SharedState> {
    Router::new().route("/public/games/{id}", get(get_game))
}

#[utoipa::path(
    get,
    path = "/public/games/{id}",
    tag = "public",
    params(("id" = String, Path, description = "Game identifier")),
    responses(
        (status = 200, description = "Shared game snapshot", body = PublicGameResponse),
        (status = 404, description = "Game missing or not shared"),
        (status = 503, description = "Remote store unavailable")
    )
)]
/// Return the current snapshot of a shared game, including the time left in the phase.
pub async fn get_game(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<PublicGameResponse>, AppError> {
    let payload = public_service::get_game(&state, &id).await?;
    Ok(Json(payload))
}
