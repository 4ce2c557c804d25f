use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    auth::AuthError,
    dao::storage::StorageError,
    state::game::{MatchError, RecordError},
};

/// Errors surfaced by the sync coordinator and the services built on it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote-touching operation was attempted without any identity.
    #[error("authentication required")]
    AuthenticationRequired,
    /// The game exists neither locally nor remotely.
    #[error("not found: {0}")]
    NotFound(String),
    /// The remote store refused the operation, or the caller does not own the game.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Network failure or timeout; recovered locally wherever a fallback exists.
    #[error("remote store unavailable")]
    RemoteUnavailable(#[source] StorageError),
    /// Stored or fetched data is incomplete even after a re-fetch.
    #[error("data error: {0}")]
    DataError(String),
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current match state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SyncError {
    /// Whether the failure is a connectivity problem that warrants queuing.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PermissionDenied(message) => SyncError::PermissionDenied(message),
            StorageError::NotFound(id) => SyncError::NotFound(format!("game `{id}` not found")),
            StorageError::Serialization(source) => SyncError::DataError(source.to_string()),
            other => SyncError::RemoteUnavailable(other),
        }
    }
}

impl From<MatchError> for SyncError {
    fn from(err: MatchError) -> Self {
        SyncError::InvalidState(err.to_string())
    }
}

impl From<RecordError> for SyncError {
    fn from(err: RecordError) -> Self {
        SyncError::DataError(err.to_string())
    }
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotSignedIn => SyncError::AuthenticationRequired,
            other => SyncError::PermissionDenied(other.to_string()),
        }
    }
}

impl From<ValidationErrors> for SyncError {
    fn from(err: ValidationErrors) -> Self {
        SyncError::InvalidInput(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AuthenticationRequired => {
                AppError::Unauthorized("authentication required".into())
            }
            // Private games are reported as missing so ids cannot be probed.
            SyncError::NotFound(message) | SyncError::PermissionDenied(message) => {
                AppError::NotFound(message)
            }
            SyncError::RemoteUnavailable(source) => {
                AppError::ServiceUnavailable(source.to_string())
            }
            SyncError::DataError(message) => AppError::Internal(message),
            SyncError::InvalidInput(message) => AppError::BadRequest(message),
            SyncError::InvalidState(message) => AppError::Conflict(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}
