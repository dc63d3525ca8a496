//! Coalesced "last accessed" markers written to the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{Clock, Expiry, Pool, spawn_reaper};
use crate::store::TorrentStore;
use crate::torrent::InfoHash;
use crate::{CacheError, Result};

/// Writes at most one touch marker per torrent per window.
pub struct TorrentTouchCache {
    store: TorrentStore,
    pool: Arc<Pool<InfoHash, Result<()>>>,
    writes: CancellationToken,
    reaper: JoinHandle<()>,
}

impl TorrentTouchCache {
    pub fn new(store: TorrentStore, window: Duration, reap_interval: Duration) -> Self {
        Self::with_pool(store, Pool::new("touch", Expiry::Fixed(window)), reap_interval)
    }

    pub fn with_clock(
        store: TorrentStore,
        window: Duration,
        reap_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = Pool::new("touch", Expiry::Fixed(window)).with_clock(clock);
        Self::with_pool(store, pool, reap_interval)
    }

    fn with_pool(store: TorrentStore, pool: Pool<InfoHash, Result<()>>, reap_interval: Duration) -> Self {
        let pool = Arc::new(pool.discard_when(|entry| matches!(entry, Err(CacheError::Cancelled))));
        let reaper = spawn_reaper(&pool, reap_interval, |_, _| {});
        Self {
            store,
            pool,
            writes: CancellationToken::new(),
            reaper,
        }
    }

    /// Records an access to `info_hash`, writing to the store only on the
    /// first touch of the window. Later touches in the window return the
    /// first outcome.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the marker could not be written
    pub async fn touch(&self, info_hash: &InfoHash) -> Result<()> {
        self.pool
            .get_or_load(info_hash, None, || {
                self.store.touch_torrent(info_hash, &self.writes)
            })
            .await
    }

    pub fn close(&self) {
        self.writes.cancel();
    }
}

impl Drop for TorrentTouchCache {
    fn drop(&mut self) {
        self.writes.cancel();
        self.reaper.abort();
    }
}
