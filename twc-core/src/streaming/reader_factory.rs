//! Turning a source URL into a ready-to-stream [`RangeReader`].

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::buffer_pool::BufferPool;
use super::range_reader::{PieceOriginRef, PieceStreamSource, RangeReader};
use super::token_bucket::RateLimiter;
use crate::config::LookaheadPolicy;
use crate::pieces::{MetadataCache, TorrentTouchCache};
use crate::preload::PrefetchQueuePool;
use crate::torrent::{InfoHash, PieceHash};
use crate::{CacheError, Result};

/// A parsed `scheme://host[:port]/<infohash>/<path>?<query>` source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    pub url: Url,
    /// `scheme://host[:port]` of the origin
    pub origin: String,
    pub info_hash: InfoHash,
    /// Decoded path inside the torrent, without a leading slash
    pub path: String,
    pub query: Option<String>,
}

impl SourceUrl {
    /// # Errors
    ///
    /// - `CacheError::InvalidSourceUrl` - If the URL or its info-hash is malformed
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: String| CacheError::InvalidSourceUrl {
            url: input.to_string(),
            reason,
        };

        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let origin = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };

        let mut parts = url.path().trim_start_matches('/').splitn(2, '/');
        let hash = parts.next().unwrap_or_default();
        if hash.is_empty() {
            return Err(invalid("missing info-hash".to_string()));
        }
        let info_hash = InfoHash::from_hex(hash).map_err(|e| invalid(e.to_string()))?;
        let path = urlencoding::decode(parts.next().unwrap_or_default())
            .map_err(|e| invalid(e.to_string()))?
            .into_owned();

        Ok(Self {
            origin,
            info_hash,
            path,
            query: url.query().map(str::to_string),
            url,
        })
    }

    pub fn origin_ref(&self) -> PieceOriginRef {
        PieceOriginRef {
            source: self.origin.clone(),
            query: self.query.clone(),
        }
    }
}

/// What a reader should expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderTarget {
    /// The file named by the source URL path.
    File,
    /// A single raw piece, served as a pseudo-file.
    Piece(PieceHash),
}

/// Outcome of opening a reader.
pub enum ReaderResolution {
    /// The torrent's metadata is not published yet. Clients should fetch
    /// `redirect` from the origin instead.
    NotReady { redirect: String },
    Ready(Box<OpenedReader>),
}

/// A reader together with its session identity.
pub struct OpenedReader {
    pub reader: RangeReader,
    /// Stable id of the (torrent, path) pair, keys the prefetch queue
    pub session: String,
}

/// Builds readers wired to the shared caches.
pub struct ReaderFactory {
    metadata: Arc<MetadataCache>,
    pieces: Arc<dyn PieceStreamSource>,
    buffers: Arc<BufferPool>,
    queues: Option<Arc<PrefetchQueuePool>>,
    touch: Option<Arc<TorrentTouchCache>>,
    lookahead: LookaheadPolicy,
}

impl ReaderFactory {
    pub fn new(
        metadata: Arc<MetadataCache>,
        pieces: Arc<dyn PieceStreamSource>,
        buffers: Arc<BufferPool>,
        lookahead: LookaheadPolicy,
    ) -> Self {
        Self {
            metadata,
            pieces,
            buffers,
            queues: None,
            touch: None,
            lookahead,
        }
    }

    pub fn with_prefetch(mut self, queues: Arc<PrefetchQueuePool>) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn with_touch(mut self, touch: Arc<TorrentTouchCache>) -> Self {
        self.touch = Some(touch);
        self
    }

    /// Resolves `target` within the torrent named by `source`.
    ///
    /// `rate` caps the reader's throughput in bytes per second. All fetches
    /// of the reader are bound to `cancel`.
    ///
    /// # Errors
    ///
    /// - `CacheError::FileNotFound` - If the torrent has no such file
    /// - `CacheError::PieceNotFound` - If the torrent has no such piece
    /// - `CacheError::Cancelled` - If `cancel` fired while loading metadata
    /// - Any error of loading or decoding the metadata
    pub async fn open(
        &self,
        source: &SourceUrl,
        target: ReaderTarget,
        rate: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<ReaderResolution> {
        let Some(layout) = self.metadata.get(&source.info_hash, cancel).await? else {
            debug!("Torrent {} not ready, redirecting", source.info_hash);
            return Ok(ReaderResolution::NotReady {
                redirect: source.url.to_string(),
            });
        };

        let (name, offset, length) = match target {
            ReaderTarget::File => {
                let file = layout
                    .find_file(&source.path)
                    .ok_or_else(|| CacheError::FileNotFound {
                        info_hash: source.info_hash,
                        path: source.path.clone(),
                    })?;
                (layout.file_path(file), file.offset, file.length)
            }
            ReaderTarget::Piece(piece_hash) => {
                let piece = layout
                    .piece_by_hash(&piece_hash)
                    .ok_or(CacheError::PieceNotFound {
                        info_hash: source.info_hash,
                        piece_hash,
                    })?;
                (format!("/{piece_hash}"), piece.offset, piece.length)
            }
        };

        let session = session_id(&source.info_hash, &name);
        let mut reader = RangeReader::new(
            Arc::clone(&layout),
            source.origin_ref(),
            name,
            offset,
            length,
            Arc::clone(&self.pieces),
            Arc::clone(&self.buffers),
            cancel.clone(),
        );
        if let Some(queues) = &self.queues {
            let pieces = self.lookahead.piece_count(length, layout.piece_length);
            reader = reader.with_prefetch(Arc::clone(queues), session.clone(), pieces);
        }
        if let Some(touch) = &self.touch {
            reader = reader.with_touch(Arc::clone(touch));
        }
        if let Some(rate) = rate {
            reader = reader.with_rate_limiter(Arc::new(RateLimiter::new(rate)));
        }

        Ok(ReaderResolution::Ready(Box::new(OpenedReader { reader, session })))
    }
}

/// Hex SHA-1 of the info-hash followed by the served path.
pub fn session_id(info_hash: &InfoHash, path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(info_hash.to_hex().as_bytes());
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}
