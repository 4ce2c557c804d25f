/// Version-based reconciliation of local and remote copies.
pub mod conflict;
/// Online/offline signal.
pub mod connectivity;
/// OpenAPI documentation generation.
pub mod documentation;
/// Background work of a game open for scoring.
pub mod game_session;
/// Health check service.
pub mod health_service;
/// Spectator live views.
pub mod live_view;
/// Public service for read-only game snapshots.
pub mod public_service;
/// Per-game timers.
pub mod scheduler;
/// Server-Sent Events streaming of live views.
pub mod sse_service;
/// Remote store connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// Offline-first sync between device storage and the remote store.
pub mod sync_coordinator;
