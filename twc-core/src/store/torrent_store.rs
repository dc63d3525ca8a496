//! Torrent-specific object layout on top of an [`ObjectStore`].

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ByteRange, ByteStream, ObjectStore, StoreError};
use crate::torrent::{InfoHash, PieceHash};
use crate::{CacheError, Result};

/// Maps torrents, completed-piece records, touch markers and pieces onto
/// buckets and keys.
///
/// Layout:
/// - `torrents/<infohash>` holds the metadata document
/// - `completed_pieces/<infohash>` holds the concatenated 20-byte hashes
/// - `touch/<infohash>` holds the unix time of the last access
/// - `<infohash>/<piecehash>` holds piece data, in `<bucket>` or, with
///   bucket spread, in `<bucket>-<first two hex chars of infohash>`
#[derive(Clone)]
pub struct TorrentStore {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    bucket_spread: bool,
}

impl TorrentStore {
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>, bucket_spread: bool) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            bucket_spread,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Bucket holding the pieces of `info_hash`.
    pub fn piece_bucket(&self, info_hash: &InfoHash) -> String {
        if self.bucket_spread {
            let hex = info_hash.to_hex();
            format!("{}-{}", self.bucket, &hex[..2])
        } else {
            self.bucket.clone()
        }
    }

    pub fn torrent_key(info_hash: &InfoHash) -> String {
        format!("torrents/{info_hash}")
    }

    pub fn completed_pieces_key(info_hash: &InfoHash) -> String {
        format!("completed_pieces/{info_hash}")
    }

    pub fn touch_key(info_hash: &InfoHash) -> String {
        format!("touch/{info_hash}")
    }

    pub fn piece_key(info_hash: &InfoHash, piece_hash: &PieceHash) -> String {
        format!("{info_hash}/{piece_hash}")
    }

    /// Fetches the metadata document, `None` if the torrent is unknown.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the store request failed
    /// - `CacheError::Cancelled` - If `cancel` fired first
    pub async fn get_torrent(
        &self,
        info_hash: &InfoHash,
        cancel: &CancellationToken,
    ) -> Result<Option<ByteStream>> {
        let key = Self::torrent_key(info_hash);
        cancellable(cancel, self.objects.get_object(&self.bucket, &key, None)).await
    }

    /// Fetches the completed-pieces record, `None` if none was written yet.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the store request failed
    /// - `CacheError::Cancelled` - If `cancel` fired first
    pub async fn get_completed_pieces(
        &self,
        info_hash: &InfoHash,
        cancel: &CancellationToken,
    ) -> Result<Option<ByteStream>> {
        let key = Self::completed_pieces_key(info_hash);
        cancellable(cancel, self.objects.get_object(&self.bucket, &key, None)).await
    }

    /// Fetches a committed piece, or the inclusive `range` of it.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the store request failed
    /// - `CacheError::Cancelled` - If `cancel` fired first
    pub async fn get_piece(
        &self,
        info_hash: &InfoHash,
        piece_hash: &PieceHash,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<Option<ByteStream>> {
        let bucket = self.piece_bucket(info_hash);
        let key = Self::piece_key(info_hash, piece_hash);
        cancellable(cancel, self.objects.get_object(&bucket, &key, range)).await
    }

    /// Records that the torrent was just read.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the store request failed
    /// - `CacheError::Cancelled` - If `cancel` fired first
    pub async fn touch_torrent(&self, info_hash: &InfoHash, cancel: &CancellationToken) -> Result<()> {
        let key = Self::touch_key(info_hash);
        let body = Bytes::from(chrono::Utc::now().timestamp().to_string());
        debug!("Touching torrent {}", info_hash);
        cancellable(cancel, self.objects.put_object(&self.bucket, &key, body)).await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = std::result::Result<T, StoreError>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CacheError::Cancelled),
        result = request => result.map_err(CacheError::from),
    }
}
