//! Errors returned by the sync engine's public API
//!
//! Conflicts are not errors; they surface as [`crate::ConflictItem`]s.

use thiserror::Error;

use crate::config::ConfigError;
use crate::models::{EntityKey, ValidationError};
use crate::remote::RemoteError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Device is offline; nothing was sent
    #[error("Offline: changes stay queued until the connection returns")]
    Offline,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote did not answer in time")]
    Timeout,

    /// The remote refused the request; it will not be retried
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    #[error("Local storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid change: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(EntityKey),

    /// Create for an entity that is already live locally
    #[error("{0} already exists")]
    AlreadyExists(EntityKey),

    #[error("Conflict '{0}' not found")]
    ConflictNotFound(String),

    /// No remote URL is configured
    #[error("No remote configured. Set remote_url in the config file or PANTRY_REMOTE_URL.")]
    NoRemote,

    /// The sync service has shut down
    #[error("Sync service is not running")]
    ServiceStopped,
}

impl SyncError {
    /// Failure a later cycle may get past
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Offline | SyncError::Network(_) | SyncError::Timeout | SyncError::Storage(_)
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout => SyncError::Timeout,
            RemoteError::Rejected { .. } => SyncError::Rejected(err.to_string()),
            RemoteError::Network(_) | RemoteError::Server { .. } | RemoteError::InvalidResponse(_) => {
                SyncError::Network(err.to_string())
            }
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
