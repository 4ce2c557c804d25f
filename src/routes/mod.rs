use axum::Router;

use crate::state::SharedState;

/// Swagger UI.
pub mod docs;
/// Liveness endpoint.
pub mod health;
/// Read-only game snapshots.
pub mod public;
/// Live game streams.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(public::router())
        .merge(sse::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
