use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification of the spectator relay.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::public::get_game,
        crate::routes::sse::game_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::public::PublicGameResponse,
            crate::dto::public::ScoreLine,
            crate::dto::public::QuarterScoreLine,
            crate::dto::public::PublicPhase,
            crate::dto::public::PublicPhaseKind,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::GameNotFoundEvent,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "public", description = "Read-only snapshots of shared games"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        assert!(paths.contains(&"/healthcheck".to_string()));
        assert!(paths.contains(&"/public/games/{id}".to_string()));
        assert!(paths.contains(&"/sse/games/{id}".to_string()));
    }
}
