//! Whole pieces warmed onto local disk ahead of readers.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Preloader;
use super::eviction::{self, TEMP_PREFIX};
use crate::cache::{Expiry, Pool, spawn_reaper};
use crate::config::PreloadConfig;
use crate::pieces::{PieceRequest, PieceSourceRouter, PieceWindow};
use crate::store::ByteStream;
use crate::torrent::PieceHash;
use crate::{CacheError, Result};

type ReaderCounts = DashMap<PieceHash, usize>;

/// Disk-backed piece cache fed through the [`PieceSourceRouter`].
///
/// Each piece lives in `<dir>/<piece hash hex>`. Downloads land in a
/// `_`-prefixed temp file first and are renamed into place once complete,
/// so a final-named file is always whole. The in-memory pool remembers the
/// outcome of each preload for a short sliding TTL; files outlive their
/// pool entries and are reclaimed by the size-bounded sweep.
pub struct OnDiskPreloadCache {
    router: Arc<PieceSourceRouter>,
    config: PreloadConfig,
    pool: Arc<Pool<PieceHash, Result<()>>>,
    readers: Arc<ReaderCounts>,
    shutdown: CancellationToken,
    temp_counter: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl OnDiskPreloadCache {
    /// Creates the cache directory and starts the reaper and sweep tasks.
    ///
    /// Temp files left behind by a previous run are removed.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the directory cannot be created or listed
    pub async fn new(
        router: Arc<PieceSourceRouter>,
        config: PreloadConfig,
        reap_interval: Duration,
    ) -> Result<Self> {
        fs::create_dir_all(&config.dir).await?;
        remove_stale_temp_files(&config.dir).await?;

        let pool = Arc::new(
            Pool::new("preload", Expiry::Sliding(config.entry_ttl))
                .discard_when(|entry| matches!(entry, Err(CacheError::Cancelled))),
        );
        let readers: Arc<ReaderCounts> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let reaper = {
            let dir = config.dir.clone();
            let readers = Arc::clone(&readers);
            let evict = config.evict_on_expiry;
            spawn_reaper(&pool, reap_interval, move |piece_hash: PieceHash, _| {
                if evict && !has_readers(&readers, &piece_hash) {
                    let path = dir.join(piece_hash.to_hex());
                    tokio::spawn(async move {
                        match fs::remove_file(&path).await {
                            Ok(()) => debug!("Removed expired preload {}", path.display()),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                        }
                    });
                }
            })
        };

        let sweeper = tokio::spawn(sweep_loop(
            config.clone(),
            Arc::downgrade(&pool),
            Arc::clone(&readers),
            shutdown.clone(),
        ));

        info!(
            "Preload cache at {} (max {} bytes, entry ttl {:?})",
            config.dir.display(),
            config.max_size,
            config.entry_ttl
        );

        Ok(Self {
            router,
            config,
            pool,
            readers,
            shutdown,
            temp_counter: AtomicU64::new(0),
            tasks: vec![reaper, sweeper],
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Final location of a piece on disk.
    pub fn piece_path(&self, piece_hash: &PieceHash) -> PathBuf {
        self.config.dir.join(piece_hash.to_hex())
    }

    /// Whether the pool currently knows `piece_hash`.
    pub fn is_registered(&self, piece_hash: &PieceHash) -> bool {
        self.pool.contains(piece_hash)
    }

    /// Number of open readers of `piece_hash`.
    pub fn active_readers(&self, piece_hash: &PieceHash) -> usize {
        self.readers.get(piece_hash).map_or(0, |count| *count)
    }

    /// Makes the piece available on disk.
    ///
    /// The first call per piece downloads it through the router; concurrent
    /// and later calls within the entry TTL share that outcome, including a
    /// failure. A piece already on disk is only touched so the sweep treats
    /// it as recently used.
    ///
    /// # Errors
    ///
    /// - `CacheError::PieceFetch` - If no source could deliver the piece
    /// - `CacheError::Io` - If writing the piece to disk failed
    /// - `CacheError::Cancelled` - If the cache is shutting down
    pub async fn preload(&self, request: &PieceRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let mut initiated = false;
        let outcome = self
            .pool
            .get_or_load(&request.piece_hash, None, || {
                initiated = true;
                self.fetch_to_disk(request)
            })
            .await;

        if !initiated && outcome.is_ok() {
            if let Err(e) = touch_mtime(self.piece_path(&request.piece_hash)).await {
                debug!("Could not refresh mtime of piece {}: {}", request.piece_hash, e);
            }
        }
        outcome
    }

    /// Opens `window` of a preloaded piece.
    ///
    /// Waits for an in-flight preload of the piece. Returns `None` when the
    /// piece is not registered or its file has been evicted.
    ///
    /// # Errors
    ///
    /// - Any error the preload of this piece ended with
    /// - `CacheError::Io` - If the file exists but cannot be read
    pub async fn get(&self, request: &PieceRequest, window: PieceWindow) -> Result<Option<ByteStream>> {
        let piece_hash = request.piece_hash;
        if !self.pool.contains(&piece_hash) {
            return Ok(None);
        }
        self.pool
            .get_or_load(&piece_hash, None, || self.fetch_to_disk(request))
            .await?;

        match self.open_file(piece_hash, window).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Preloaded piece {} was evicted", piece_hash);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Streams `window` of a piece, from disk when it is or was preloaded
    /// and through the router otherwise.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If `cancel` fired first
    /// - Any error of the preload or of the router
    pub async fn open(
        &self,
        request: &PieceRequest,
        window: PieceWindow,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let piece_hash = request.piece_hash;
        let on_disk = self.pool.contains(&piece_hash)
            || fs::try_exists(self.piece_path(&piece_hash))
                .await
                .unwrap_or(false);

        if on_disk {
            let local = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                local = self.read_local(request, window) => local?,
            };
            if let Some(stream) = local {
                return Ok(stream);
            }
            debug!("Piece {} left the preload cache, reading through", piece_hash);
        }

        self.router.get(request, window, cancel).await
    }

    async fn read_local(&self, request: &PieceRequest, window: PieceWindow) -> Result<Option<ByteStream>> {
        self.preload(request).await?;
        self.get(request, window).await
    }

    async fn fetch_to_disk(&self, request: &PieceRequest) -> Result<()> {
        let path = self.piece_path(&request.piece_hash);
        if fs::try_exists(&path).await? {
            touch_mtime(path).await?;
            debug!("Piece {} already on disk", request.piece_hash);
            return Ok(());
        }

        let mut temp = TempFile::new(self.config.dir.join(format!(
            "{}{}.{}",
            TEMP_PREFIX,
            request.piece_hash.to_hex(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        )));
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CacheError::Cancelled),
            result = self.download(request, &mut temp, &path) => result,
        }
    }

    async fn download(&self, request: &PieceRequest, temp: &mut TempFile, path: &Path) -> Result<()> {
        let mut stream = self
            .router
            .get(request, PieceWindow::whole(), &self.shutdown)
            .await?;

        let mut file = fs::File::create(temp.path()).await?;
        let written = tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        drop(file);
        fs::rename(temp.path(), path).await?;
        temp.persist();

        debug!("Preloaded piece {} ({} bytes)", request.piece_hash, written);
        Ok(())
    }

    async fn open_file(&self, piece_hash: PieceHash, window: PieceWindow) -> io::Result<ByteStream> {
        let mut file = fs::File::open(self.piece_path(&piece_hash)).await?;
        let guard = ReaderGuard::new(Arc::clone(&self.readers), piece_hash);

        if window.full {
            return Ok(Box::pin(TrackedReader { inner: file, _guard: guard }));
        }
        file.seek(SeekFrom::Start(window.start)).await?;
        let length = window.end.saturating_sub(window.start).saturating_add(1);
        Ok(Box::pin(TrackedReader {
            inner: file.take(length),
            _guard: guard,
        }))
    }

    /// Stops background work and forgets every entry. Removes the cache
    /// directory when configured to.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
        self.pool.drain();

        if !self.config.remove_on_shutdown {
            return;
        }
        match fs::remove_dir_all(&self.config.dir).await {
            Ok(()) => info!("Removed preload cache {}", self.config.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.config.dir.display(), e),
        }
    }
}

#[async_trait]
impl Preloader for OnDiskPreloadCache {
    async fn preload(&self, request: &PieceRequest) -> Result<()> {
        OnDiskPreloadCache::preload(self, request).await
    }
}

impl Drop for OnDiskPreloadCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn has_readers(readers: &ReaderCounts, piece_hash: &PieceHash) -> bool {
    readers.get(piece_hash).is_some_and(|count| *count > 0)
}

async fn sweep_loop(
    config: PreloadConfig,
    pool: std::sync::Weak<Pool<PieceHash, Result<()>>>,
    readers: Arc<ReaderCounts>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };

        let is_active = |name: &str| {
            PieceHash::from_hex(name)
                .map(|hash| pool.is_registered(&hash) || has_readers(&readers, &hash))
                .unwrap_or(false)
        };
        match eviction::sweep(&config.dir, config.max_size, is_active).await {
            Ok(report) if !report.removed.is_empty() => info!(
                "Evicted {} preloaded pieces, {} of {} bytes remain",
                report.removed.len(),
                report.remaining_bytes,
                report.total_bytes
            ),
            Ok(_) => {}
            Err(e) => warn!("Preload sweep of {} failed: {}", config.dir.display(), e),
        }
    }
}

async fn remove_stale_temp_files(dir: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("Failed to remove stale {}: {}", entry.path().display(), e);
            }
        }
    }
    Ok(())
}

async fn touch_mtime(path: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await
    .map_err(io::Error::other)?
}

/// Partially written download, removed on drop unless it was renamed into place.
///
/// Covers a failed copy as well as the fetching future being dropped mid-download.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, persisted: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&mut self) {
        self.persisted = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial download {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

/// Counts an open reader of a piece for as long as it lives.
struct ReaderGuard {
    readers: Arc<ReaderCounts>,
    piece_hash: PieceHash,
}

impl ReaderGuard {
    fn new(readers: Arc<ReaderCounts>, piece_hash: PieceHash) -> Self {
        *readers.entry(piece_hash).or_insert(0) += 1;
        Self { readers, piece_hash }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.readers.get_mut(&self.piece_hash) {
            *count = count.saturating_sub(1);
        }
        self.readers.remove_if(&self.piece_hash, |_, count| *count == 0);
    }
}

struct TrackedReader<R> {
    inner: R,
    _guard: ReaderGuard,
}

impl<R: AsyncRead + Unpin> AsyncRead for TrackedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
