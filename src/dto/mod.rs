/// Health check payloads.
pub mod health;
/// Read-only projections of shared games.
pub mod public;
/// Match setup input.
pub mod setup;
/// Server-sent event payloads.
pub mod sse;
/// Custom validators for setup input.
pub mod validation;
