//! Object store access: the generic client seam and the torrent key layout.
//!
//! The store is authoritative for torrent metadata, completed-piece records
//! and committed piece data. An absent object is never an error: it is
//! reported as `Ok(None)` so callers can fall back or report "not ready".

pub mod memory;
pub mod s3;
pub mod torrent_store;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;
pub use torrent_store::TorrentStore;

/// Owned, sendable byte stream returned by every piece source.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Inclusive byte range, rendered as `bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Value for an HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Failures talking to the object store. Absence is not represented here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Request for {bucket}/{key} failed: {reason}")]
    Request {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Store client misconfigured: {reason}")]
    Configuration { reason: String },
}

/// Minimal client surface the cache needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches an object, or the inclusive `range` of it.
    ///
    /// Returns `Ok(None)` when the object does not exist.
    ///
    /// # Errors
    ///
    /// - `StoreError::Request` - If the store could not be reached or rejected the request
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ByteStream>, StoreError>;

    /// Writes an object, replacing any previous content.
    ///
    /// # Errors
    ///
    /// - `StoreError::Request` - If the store could not be reached or rejected the request
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;
}
