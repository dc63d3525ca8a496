//! Decoded torrent metadata keyed by info-hash.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{Expiry, Pool, spawn_reaper};
use crate::config::MetadataLifetime;
use crate::store::TorrentStore;
use crate::torrent::{InfoHash, MetadataDecoder, TorrentMetadata};
use crate::{CacheError, Result};

type Entry = Result<Option<Arc<TorrentMetadata>>>;

/// Lazily fetched, decoded-once torrent metadata.
///
/// `Ok(None)` means the store does not know the torrent yet. That answer is
/// not memoized, so a torrent becomes visible as soon as it is published.
pub struct MetadataCache {
    store: TorrentStore,
    decoder: Arc<dyn MetadataDecoder>,
    lifetime: MetadataLifetime,
    pool: Arc<Pool<InfoHash, Entry>>,
    loads: CancellationToken,
    reaper: JoinHandle<()>,
}

impl MetadataCache {
    pub fn new(
        store: TorrentStore,
        decoder: Arc<dyn MetadataDecoder>,
        lifetime: MetadataLifetime,
        reap_interval: Duration,
    ) -> Self {
        let expiry = match lifetime {
            MetadataLifetime::Request => Expiry::Never,
            MetadataLifetime::Idle(ttl) => Expiry::Sliding(ttl),
        };
        let pool = Arc::new(
            Pool::new("metadata", expiry)
                .discard_when(|entry| matches!(entry, Ok(None) | Err(CacheError::Cancelled))),
        );
        let reaper = spawn_reaper(&pool, reap_interval, |info_hash, _| {
            debug!("Evicted metadata of torrent {}", info_hash);
        });

        Self {
            store,
            decoder,
            lifetime,
            pool,
            loads: CancellationToken::new(),
            reaper,
        }
    }

    /// Returns the metadata of `info_hash`, or `None` if it is not ready.
    ///
    /// With [`MetadataLifetime::Request`] a newly loaded entry lives until
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If `cancel` fired first
    /// - `CacheError::Torrent` - If the document fails to decode
    /// - `CacheError::Store` - If the store request failed
    pub async fn get(&self, info_hash: &InfoHash, cancel: &CancellationToken) -> Entry {
        let scope = match self.lifetime {
            MetadataLifetime::Request => Some(cancel),
            MetadataLifetime::Idle(_) => None,
        };
        let load = self.pool.get_or_load(info_hash, scope, || self.load(*info_hash));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            entry = load => entry,
        }
    }

    async fn load(&self, info_hash: InfoHash) -> Entry {
        let Some(mut stream) = self.store.get_torrent(&info_hash, &self.loads).await? else {
            debug!("Torrent {} is not known to the store yet", info_hash);
            return Ok(None);
        };

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        let metadata = self.decoder.decode(info_hash, &bytes)?;
        info!(
            "Loaded metadata of torrent {}: {} pieces of {} bytes, {} files",
            info_hash,
            metadata.num_pieces(),
            metadata.piece_length,
            metadata.files.len()
        );
        Ok(Some(Arc::new(metadata)))
    }

    /// Number of cached torrents.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Aborts in-flight loads.
    pub fn close(&self) {
        self.loads.cancel();
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        self.loads.cancel();
        self.reaper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use crate::testing::TorrentFixture;
    use crate::torrent::{BencodeMetadataDecoder, TorrentError};

    fn create_test_cache(
        objects: &Arc<MemoryObjectStore>,
        lifetime: MetadataLifetime,
    ) -> MetadataCache {
        MetadataCache::new(
            TorrentStore::new(objects.clone(), "bucket", false),
            Arc::new(BencodeMetadataDecoder),
            lifetime,
            Duration::from_millis(10),
        )
    }

    fn fixture() -> TorrentFixture {
        TorrentFixture::new("movie.mkv", 16384).with_file(&[], 40000)
    }

    #[tokio::test]
    async fn test_unknown_torrent_is_not_ready_and_not_memoized() {
        let objects = Arc::new(MemoryObjectStore::new());
        let cache = create_test_cache(&objects, MetadataLifetime::Idle(Duration::from_secs(60)));
        let fixture = fixture();
        let cancel = CancellationToken::new();

        assert!(cache.get(&fixture.info_hash(), &cancel).await.unwrap().is_none());

        objects.insert(
            "bucket",
            &TorrentStore::torrent_key(&fixture.info_hash()),
            fixture.to_torrent_bytes(),
        );
        let metadata = cache.get(&fixture.info_hash(), &cancel).await.unwrap().unwrap();
        assert_eq!(metadata.num_pieces(), 3);
    }

    #[tokio::test]
    async fn test_decodes_once_per_window() {
        let objects = Arc::new(MemoryObjectStore::new());
        let fixture = fixture();
        let key = TorrentStore::torrent_key(&fixture.info_hash());
        objects.insert("bucket", &key, fixture.to_torrent_bytes());
        let cache = create_test_cache(&objects, MetadataLifetime::Idle(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let first = cache.get(&fixture.info_hash(), &cancel).await.unwrap().unwrap();
        let second = cache.get(&fixture.info_hash(), &cancel).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(objects.get_count("bucket", &key), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported() {
        let objects = Arc::new(MemoryObjectStore::new());
        let info_hash = InfoHash::new([4u8; 20]);
        objects.insert("bucket", &TorrentStore::torrent_key(&info_hash), b"garbage".to_vec());
        let cache = create_test_cache(&objects, MetadataLifetime::Idle(Duration::from_secs(60)));

        let result = cache.get(&info_hash, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(CacheError::Torrent(TorrentError::MetadataDecode { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_scoped_entry_ends_with_request() {
        let objects = Arc::new(MemoryObjectStore::new());
        let fixture = fixture();
        objects.insert(
            "bucket",
            &TorrentStore::torrent_key(&fixture.info_hash()),
            fixture.to_torrent_bytes(),
        );
        let cache = create_test_cache(&objects, MetadataLifetime::Request);

        let request = CancellationToken::new();
        cache.get(&fixture.info_hash(), &request).await.unwrap().unwrap();
        assert_eq!(cache.len(), 1);

        request.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !cache.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
