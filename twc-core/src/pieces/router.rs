//! Store-or-origin resolution of piece bytes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::completed_cache::CompletedPieceSetCache;
use super::origin::PieceOrigin;
use super::{PieceRequest, PieceWindow};
use crate::store::{ByteStream, TorrentStore};
use crate::{CacheError, Result};

/// One place a piece can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSource {
    /// Durable object store, authoritative for completed pieces.
    Store,
    /// Live HTTP origin.
    Origin,
}

/// Ordered sources to try, depending on whether the piece is completed.
///
/// A source that misses or fails hands over to the next one. Cancellation
/// stops the walk immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub completed: Vec<PieceSource>,
    pub incomplete: Vec<PieceSource>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            completed: vec![PieceSource::Store, PieceSource::Origin],
            incomplete: vec![PieceSource::Origin],
        }
    }
}

impl FetchPolicy {
    pub fn sources(&self, completed: bool) -> &[PieceSource] {
        if completed {
            &self.completed
        } else {
            &self.incomplete
        }
    }
}

/// Fetches raw piece bytes from whichever source the policy selects.
pub struct PieceSourceRouter {
    completed: Arc<CompletedPieceSetCache>,
    store: TorrentStore,
    origin: Arc<dyn PieceOrigin>,
    policy: FetchPolicy,
}

impl PieceSourceRouter {
    pub fn new(
        completed: Arc<CompletedPieceSetCache>,
        store: TorrentStore,
        origin: Arc<dyn PieceOrigin>,
    ) -> Self {
        Self {
            completed,
            store,
            origin,
            policy: FetchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Streams `window` of the requested piece.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If `cancel` fired; no further source is tried
    /// - `CacheError::MalformedCacheRecord` / `CacheError::Store` - If the
    ///   completed-piece record cannot be loaded
    /// - `CacheError::PieceFetch` - If every source missed or failed
    pub async fn get(
        &self,
        request: &PieceRequest,
        window: PieceWindow,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let completed = self.completed.get(&request.info_hash, cancel).await?;
        let is_completed = completed.has(&request.piece_hash);
        let range = window.byte_range();

        let mut last_failure: Option<String> = None;
        for source in self.policy.sources(is_completed) {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let attempt = match source {
                PieceSource::Store => self
                    .store
                    .get_piece(&request.info_hash, &request.piece_hash, range, cancel)
                    .await
                    .map(|stream| stream.ok_or_else(|| "not found in store".to_string())),
                PieceSource::Origin => self
                    .origin
                    .fetch_piece(request, range, cancel)
                    .await
                    .map(Ok),
            };

            match attempt {
                Ok(Ok(stream)) => {
                    debug!(
                        "Piece {} of torrent {} served from {:?}",
                        request.piece_hash, request.info_hash, source
                    );
                    return Ok(stream);
                }
                Ok(Err(miss)) => {
                    debug!(
                        "Piece {} of torrent {} missed {:?}: {}",
                        request.piece_hash, request.info_hash, source, miss
                    );
                    last_failure = Some(miss);
                }
                Err(CacheError::Cancelled) => return Err(CacheError::Cancelled),
                Err(e) => {
                    warn!(
                        "Piece {} of torrent {} failed from {:?}: {}",
                        request.piece_hash, request.info_hash, source, e
                    );
                    last_failure = Some(e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Err(CacheError::PieceFetch {
            info_hash: request.info_hash,
            piece_hash: request.piece_hash,
            reason: last_failure.unwrap_or_else(|| "no piece source configured".to_string()),
        })
    }
}
