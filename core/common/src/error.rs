//! Error taxonomy for sync operations.

use std::time::Duration;
use thiserror::Error;

use crate::record::RemoteRecord;

/// Top-level error type for tapedeck sync operations.
///
/// Variants map one-to-one onto the failure kinds the sync engine reacts to,
/// so callers can pattern-match instead of decoding platform error codes.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable account is signed in on the remote store.
    #[error("Account unavailable: {0}")]
    AccountUnavailable(String),

    /// The network is unreachable.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The remote storage quota is exhausted.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The server asked us to slow down.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Transient server-side failure (busy zone, 5xx).
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The change token is no longer accepted by the server.
    #[error("Change token expired")]
    TokenExpired,

    /// The namespace (zone) no longer exists on the server.
    #[error("Namespace deleted: {0}")]
    NamespaceDeleted(String),

    /// A write raced with another writer.
    #[error("Version conflict on record {record}")]
    VersionConflict {
        record: String,
        /// Current server version, when the store attached one.
        server_record: Option<Box<RemoteRecord>>,
    },

    /// A single record could not be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Copying a binary asset into local storage failed.
    #[error("Asset copy failed: {0}")]
    AssetCopyFailed(String),

    /// An inbound asset exceeded the download ceiling.
    #[error("Asset too large: {size} bytes exceeds limit of {limit} bytes")]
    AssetTooLarge { size: u64, limit: u64 },

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether an in-line retry with backoff can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::ServiceUnavailable(_))
    }

    /// Whether this failure aborts the whole sync cycle.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            Error::AccountUnavailable(_) | Error::NetworkUnavailable(_) | Error::QuotaExceeded(_)
        )
    }

    /// Whether this failure only concerns a single entity or record.
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. }
                | Error::CorruptRecord(_)
                | Error::AssetCopyFailed(_)
                | Error::AssetTooLarge { .. }
                | Error::NotFound(_)
        )
    }

    /// Server-provided wait duration, if this is a rate-limit response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Build a conflict error without server metadata.
    pub fn conflict(record: impl Into<String>) -> Self {
        Error::VersionConflict {
            record: record.into(),
            server_record: None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
