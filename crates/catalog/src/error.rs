//! Error types for catalog fetching and traversal.

use std::path::PathBuf;
use thiserror::Error;

/// Failure modes of the external object fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("object not found")]
    NotFound,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("catalog open failed: {0}")]
    CatalogOpenFailed(String),
}

impl FetchError {
    /// Stable machine-readable code name, used in log lines.
    pub fn code_name(&self) -> &'static str {
        match self {
            FetchError::NotFound => "not_found",
            FetchError::Transport(_) => "transport",
            FetchError::SignatureInvalid(_) => "signature_invalid",
            FetchError::CatalogOpenFailed(_) => "catalog_open_failed",
        }
    }
}

/// Result type alias for fetcher operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Failure modes of a traversal run.
#[derive(Debug, Error)]
pub enum TraversalError {
    /// The repository manifest could not be loaded; nothing was traversed.
    #[error("failed to load manifest: {0}")]
    Manifest(FetchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A registered listener returned `false`.
    #[error("listener aborted traversal")]
    Aborted,

    #[error("failed to unlink catalog file {path}: {source}")]
    Unlink {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result type alias for traversal operations.
pub type Result<T> = std::result::Result<T, TraversalError>;
