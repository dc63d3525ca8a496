//! Wiring of the caching pipeline for dependency injection.
//!
//! Production builds talk to S3 and a live HTTP origin. Tests hand in
//! in-memory backends through [`CacheServices::with_backends`].

use std::sync::Arc;

use tracing::info;

use crate::config::CacheConfig;
use crate::pieces::{
    CompletedPieceSetCache, HttpOrigin, MetadataCache, PieceOrigin, PieceSourceRouter,
    TorrentTouchCache,
};
use crate::preload::{OnDiskPreloadCache, PrefetchQueuePool};
use crate::store::{ObjectStore, S3ObjectStore, TorrentStore};
use crate::streaming::{BufferPool, ReaderFactory};
use crate::torrent::BencodeMetadataDecoder;
use crate::Result;

/// Every long-lived component the web layer needs.
///
/// Components are shared through `Arc`s so handlers can clone what they use
/// into spawned streaming tasks.
pub struct CacheServices {
    pub config: CacheConfig,
    pub store: TorrentStore,
    pub completed: Arc<CompletedPieceSetCache>,
    pub metadata: Arc<MetadataCache>,
    pub touch: Arc<TorrentTouchCache>,
    pub router: Arc<PieceSourceRouter>,
    pub preload: Arc<OnDiskPreloadCache>,
    pub prefetch: Arc<PrefetchQueuePool>,
    pub buffers: Arc<BufferPool>,
    pub readers: Arc<ReaderFactory>,
}

impl CacheServices {
    /// Builds the pipeline against S3 and the HTTP origin.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` - If the S3 client cannot be configured
    /// - `CacheError::Configuration` - If the HTTP client cannot be built
    /// - `CacheError::Io` - If the preload directory cannot be prepared
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let objects = Arc::new(S3ObjectStore::from_config(&config.store)?);
        let origin = Arc::new(HttpOrigin::new(&config.network)?);
        Self::with_backends(config, objects, origin).await
    }

    /// Builds the pipeline on top of the given object store and origin.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the preload directory cannot be prepared
    pub async fn with_backends(
        config: CacheConfig,
        objects: Arc<dyn ObjectStore>,
        origin: Arc<dyn PieceOrigin>,
    ) -> Result<Self> {
        let pools = &config.pools;
        let store = TorrentStore::new(objects, config.store.bucket.clone(), config.store.bucket_spread);

        let completed = Arc::new(CompletedPieceSetCache::new(
            store.clone(),
            pools.completed_pieces_ttl,
            pools.reap_interval,
        ));
        let metadata = Arc::new(MetadataCache::new(
            store.clone(),
            Arc::new(BencodeMetadataDecoder),
            pools.metadata_lifetime,
            pools.reap_interval,
        ));
        let touch = Arc::new(TorrentTouchCache::new(
            store.clone(),
            pools.touch_window,
            pools.reap_interval,
        ));
        let router = Arc::new(PieceSourceRouter::new(
            Arc::clone(&completed),
            store.clone(),
            origin,
        ));
        let preload = Arc::new(
            OnDiskPreloadCache::new(Arc::clone(&router), config.preload.clone(), pools.reap_interval)
                .await?,
        );
        let prefetch = Arc::new(PrefetchQueuePool::new(
            preload.clone(),
            config.streaming.prefetch_workers,
            pools.prefetch_queue_ttl,
            pools.reap_interval,
        ));
        let buffers = BufferPool::new(config.streaming.buffer_count, config.streaming.buffer_size);
        let readers = Arc::new(
            ReaderFactory::new(
                Arc::clone(&metadata),
                preload.clone(),
                Arc::clone(&buffers),
                config.streaming.lookahead,
            )
            .with_prefetch(Arc::clone(&prefetch))
            .with_touch(Arc::clone(&touch)),
        );

        info!(
            "Cache services ready: bucket={}, preload_dir={}, lookahead={:?}",
            config.store.bucket,
            config.preload.dir.display(),
            config.streaming.lookahead
        );

        Ok(Self {
            config,
            store,
            completed,
            metadata,
            touch,
            router,
            preload,
            prefetch,
            buffers,
            readers,
        })
    }

    /// Stops background work and releases on-disk state.
    pub async fn shutdown(&self) {
        info!("Shutting down cache services");
        self.prefetch.close_all();
        self.completed.close();
        self.metadata.close();
        self.touch.close();
        self.buffers.close();
        self.preload.shutdown().await;
    }
}
