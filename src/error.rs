//! Error taxonomy for the offline core.
//!
//! Storage failures propagate to the caller. Network failures are contained
//! inside the sync engine and the cache refresher and only ever show up in
//! logs or on the affected sale record.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OfflineError {
    /// The local database cannot be opened, read or written.
    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A sale could not be durably recorded. The caller must not assume the
    /// sale exists.
    #[error("sale not saved: {0}")]
    IntakeFailed(String),

    #[error("invalid sale payload: {0}")]
    InvalidPayload(String),

    /// No definitive answer from the server (connect error, timeout,
    /// unreadable response). Always retried on a later pass.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The server answered with an explicit `success: false`.
    #[error("rejected by server: {0}")]
    ServerRejected(String),

    #[error("reference cache refresh failed: {0}")]
    RefreshFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl OfflineError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        OfflineError::StorageUnavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for OfflineError {
    fn from(err: rusqlite::Error) -> Self {
        OfflineError::StorageUnavailable(err.to_string())
    }
}

pub type Result<T, E = OfflineError> = std::result::Result<T, E>;
