//! Error types for the quota manager.

use std::path::PathBuf;
use thiserror::Error;

/// Quota manager error type.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Another process holds the exclusive cache database lock.
    #[error("cache database locked by another process")]
    Locked,

    /// Pinning the object would exhaust the pinned quota budget.
    #[error("pinned quota exhausted")]
    PinLimit,

    /// A cache file could not be deleted during cleanup; the cleanup run
    /// stopped at this entry.
    #[error("failed to unlink {path} during cleanup: {source}")]
    UnlinkFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cache index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("malformed protocol frame: {0}")]
    ProtocolFrame(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] cairn_core::Error),
}

/// Result type alias for quota operations.
pub type QuotaResult<T> = std::result::Result<T, QuotaError>;
