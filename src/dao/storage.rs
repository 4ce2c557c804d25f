use std::error::Error;
use thiserror::Error;

/// Result alias for remote store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by remote document stores regardless of the underlying backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Network failure, timeout or backend outage.
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Network access was switched off on the client.
    #[error("storage offline")]
    Offline,
    /// The store refused the operation for the current caller.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The document targeted by an update or delete does not exist.
    #[error("document `{0}` not found")]
    NotFound(String),
    /// A document could not be encoded or decoded.
    #[error("invalid document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the failure is transient and the operation can be queued for later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. } | StorageError::Offline)
    }
}
