//! Short-lived cache of completed-piece records per torrent.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::completed::CompletedPieceSet;
use crate::cache::{Clock, Expiry, Pool, spawn_reaper};
use crate::store::TorrentStore;
use crate::torrent::InfoHash;
use crate::{CacheError, Result};

type Entry = Result<Arc<CompletedPieceSet>>;

/// Completed-piece sets keyed by info-hash.
///
/// One store fetch per info-hash per TTL window, measured from the first
/// load. A torrent with no record yet yields an empty set.
pub struct CompletedPieceSetCache {
    store: TorrentStore,
    pool: Arc<Pool<InfoHash, Entry>>,
    loads: CancellationToken,
    reaper: JoinHandle<()>,
}

impl CompletedPieceSetCache {
    pub fn new(store: TorrentStore, ttl: Duration, reap_interval: Duration) -> Self {
        Self::with_pool(store, Pool::new("completed_pieces", Expiry::Fixed(ttl)), reap_interval)
    }

    /// Same as [`CompletedPieceSetCache::new`] with deadlines driven by `clock`.
    pub fn with_clock(
        store: TorrentStore,
        ttl: Duration,
        reap_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = Pool::new("completed_pieces", Expiry::Fixed(ttl)).with_clock(clock);
        Self::with_pool(store, pool, reap_interval)
    }

    fn with_pool(store: TorrentStore, pool: Pool<InfoHash, Entry>, reap_interval: Duration) -> Self {
        let pool = Arc::new(pool.discard_when(|entry| matches!(entry, Err(CacheError::Cancelled))));
        let reaper = spawn_reaper(&pool, reap_interval, |_, _| {});
        Self {
            store,
            pool,
            loads: CancellationToken::new(),
            reaper,
        }
    }

    /// Returns the completed-piece set of `info_hash`.
    ///
    /// Concurrent callers share one in-flight load. A caller whose `cancel`
    /// fires stops waiting without affecting the others.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If `cancel` fired first
    /// - `CacheError::MalformedCacheRecord` - If the stored record is corrupt
    /// - `CacheError::Store` - If the store request failed
    pub async fn get(&self, info_hash: &InfoHash, cancel: &CancellationToken) -> Entry {
        let load = self.pool.get_or_load(info_hash, None, || self.load(*info_hash));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            entry = load => entry,
        }
    }

    async fn load(&self, info_hash: InfoHash) -> Entry {
        debug!("Loading completed pieces for torrent {}", info_hash);
        let set = match self.store.get_completed_pieces(&info_hash, &self.loads).await? {
            Some(stream) => CompletedPieceSet::read_from(stream).await?,
            None => CompletedPieceSet::default(),
        };
        debug!("Torrent {} has {} completed pieces", info_hash, set.len());
        Ok(Arc::new(set))
    }

    /// Aborts in-flight loads.
    pub fn close(&self) {
        self.loads.cancel();
    }
}

impl Drop for CompletedPieceSetCache {
    fn drop(&mut self) {
        self.loads.cancel();
        self.reaper.abort();
    }
}
