//! Torrent web cache core
//!
//! Read-through cache for torrent piece data. Byte ranges of files inside a
//! torrent are served from a durable object store when the piece has been
//! committed there, or from a live HTTP origin otherwise. Pools coalesce
//! concurrent fetches, pieces are warmed ahead of readers into an on-disk
//! preload cache, and readers stream through a bounded buffer pool.

pub mod cache;
pub mod config;
pub mod pieces;
pub mod preload;
pub mod services;
pub mod store;
pub mod streaming;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod torrent;
pub mod tracing_setup;

use std::sync::Arc;

// Re-export main types for convenient access
pub use config::CacheConfig;
pub use services::CacheServices;
pub use store::StoreError;
pub use torrent::{InfoHash, PieceHash, TorrentError};

/// Errors that can surface from any stage of the caching pipeline.
///
/// Cloneable so that a single memoized failure can be handed to every
/// caller waiting on the same pool entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Malformed completed pieces record: {length} bytes is not a multiple of 20")]
    MalformedCacheRecord { length: usize },

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Origin request to {url} failed: {reason}")]
    Origin { url: String, reason: String },

    #[error("Failed to fetch piece {piece_hash} of torrent {info_hash}: {reason}")]
    PieceFetch {
        info_hash: InfoHash,
        piece_hash: PieceHash,
        reason: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("File not found path={path} infohash={info_hash}")]
    FileNotFound { info_hash: InfoHash, path: String },

    #[error("Piece {piece_hash} not found in torrent {info_hash}")]
    PieceNotFound {
        info_hash: InfoHash,
        piece_hash: PieceHash,
    },

    #[error("Invalid source url {url:?}: {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        CacheError::Io(Arc::new(error))
    }
}

impl CacheError {
    /// Returns a short message suitable for an HTTP response body.
    pub fn user_message(&self) -> String {
        match self {
            CacheError::FileNotFound { path, .. } => format!("File not found: {path}"),
            CacheError::PieceNotFound { piece_hash, .. } => {
                format!("Piece {piece_hash} not found")
            }
            CacheError::InvalidSourceUrl { url, .. } => format!("Invalid source url: {url}"),
            CacheError::Torrent(TorrentError::InvalidHashEncoding { input, .. }) => {
                format!("Invalid hash: {input}")
            }
            CacheError::Cancelled => "Request cancelled".to_string(),
            CacheError::Configuration { .. } => "Server misconfigured".to_string(),
            _ => "Failed to load torrent data".to_string(),
        }
    }

    /// Checks if this error was caused by the request rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CacheError::FileNotFound { .. }
                | CacheError::PieceNotFound { .. }
                | CacheError::InvalidSourceUrl { .. }
                | CacheError::Torrent(TorrentError::InvalidHashEncoding { .. })
        )
    }

    /// Cancellation is never retried and never falls back to another source.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_shared_between_clones() {
        let error = CacheError::from(std::io::Error::other("disk full"));
        let cloned = error.clone();
        assert_eq!(error.to_string(), cloned.to_string());
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn test_user_errors() {
        let not_found = CacheError::FileNotFound {
            info_hash: InfoHash::new([0u8; 20]),
            path: "a/b".to_string(),
        };
        assert!(not_found.is_user_error());
        assert_eq!(not_found.user_message(), "File not found: a/b");

        assert!(!CacheError::Cancelled.is_user_error());
        assert!(CacheError::Cancelled.is_cancelled());
    }
}
