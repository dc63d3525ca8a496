//! Sequential reader over one file of a torrent, piece by piece.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::buffer_pool::BufferPool;
use super::span::{PieceSpan, span_for};
use super::token_bucket::RateLimiter;
use crate::pieces::{PieceRequest, PieceSourceRouter, PieceWindow, TorrentTouchCache};
use crate::preload::{OnDiskPreloadCache, PrefetchQueuePool};
use crate::store::ByteStream;
use crate::torrent::{PieceHash, TorrentMetadata};
use crate::{CacheError, Result};

/// Where a reader gets its piece streams from.
#[async_trait]
pub trait PieceStreamSource: Send + Sync {
    async fn open_piece(
        &self,
        request: &PieceRequest,
        window: PieceWindow,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;
}

#[async_trait]
impl PieceStreamSource for OnDiskPreloadCache {
    async fn open_piece(
        &self,
        request: &PieceRequest,
        window: PieceWindow,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.open(request, window, cancel).await
    }
}

#[async_trait]
impl PieceStreamSource for PieceSourceRouter {
    async fn open_piece(
        &self,
        request: &PieceRequest,
        window: PieceWindow,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.get(request, window, cancel).await
    }
}

/// Origin coordinates shared by every piece request of a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceOriginRef {
    pub source: String,
    pub query: Option<String>,
}

struct OpenPiece {
    index: u32,
    stream: ByteStream,
    /// Bytes left in the window the stream was opened for
    remaining: u64,
}

struct Prefetch {
    queues: Arc<PrefetchQueuePool>,
    session: String,
    pieces: u32,
    /// Highest piece index handed to the feed so far
    queued_through: Option<u32>,
    /// Started on the first lookahead; closed when the reader drops
    feed: Option<mpsc::UnboundedSender<PieceRequest>>,
}

/// Streams a window of bytes of one file, opening one piece at a time.
///
/// The read position only moves forward on reads. Any seek to a different
/// position closes the open piece stream. Every copy goes through a buffer
/// checked out of the shared [`BufferPool`] for that copy alone.
pub struct RangeReader {
    layout: Arc<TorrentMetadata>,
    origin: PieceOriginRef,
    name: String,
    file_offset: u64,
    file_length: u64,
    position: u64,
    pieces: Arc<dyn PieceStreamSource>,
    buffers: Arc<BufferPool>,
    cancel: CancellationToken,
    open: Option<OpenPiece>,
    last_index: Option<u32>,
    prefetch: Option<Prefetch>,
    touch: Option<Arc<TorrentTouchCache>>,
    touched: bool,
    limiter: Option<Arc<RateLimiter>>,
}

impl RangeReader {
    /// Reader over `file_length` bytes starting `file_offset` bytes into the
    /// torrent data. Every fetch is bound to `cancel`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: Arc<TorrentMetadata>,
        origin: PieceOriginRef,
        name: impl Into<String>,
        file_offset: u64,
        file_length: u64,
        pieces: Arc<dyn PieceStreamSource>,
        buffers: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            layout,
            origin,
            name: name.into(),
            file_offset,
            file_length,
            position: 0,
            pieces,
            buffers,
            cancel,
            open: None,
            last_index: None,
            prefetch: None,
            touch: None,
            touched: false,
            limiter: None,
        }
    }

    /// Queues up to `pieces` following pieces on the session's prefetch
    /// queue whenever the reader enters a new piece.
    pub fn with_prefetch(mut self, queues: Arc<PrefetchQueuePool>, session: impl Into<String>, pieces: u32) -> Self {
        self.prefetch = Some(Prefetch {
            queues,
            session: session.into(),
            pieces,
            queued_through: None,
            feed: None,
        });
        self
    }

    /// Marks the torrent as accessed after the first successful read.
    pub fn with_touch(mut self, touch: Arc<TorrentTouchCache>) -> Self {
        self.touch = Some(touch);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Display name of the file being read.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the file in bytes.
    pub fn len(&self) -> u64 {
        self.file_length
    }

    pub fn is_empty(&self) -> bool {
        self.file_length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.file_length
    }

    /// Moves the read position.
    ///
    /// Seeking anywhere but the current position closes the open piece
    /// stream; the next read opens a fresh one.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the target position would be negative
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64> {
        let position = match target {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.file_length.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file"))?;

        if position != self.position {
            if position < self.position {
                trace!("Backward seek in {} from {} to {}", self.name, self.position, position);
                if let Some(prefetch) = self.prefetch.as_mut() {
                    prefetch.queued_through = None;
                }
            }
            self.close();
            self.position = position;
        }
        Ok(position)
    }

    /// Copies up to `limit` bytes from the read position into `sink`.
    ///
    /// Returns the number of bytes copied. Fewer than `limit` bytes means the
    /// end of the file was reached.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If the reader's token fired
    /// - `CacheError::PieceFetch` - If a piece could not be fetched
    /// - `CacheError::Io` - If a piece stream ended early or the sink failed
    pub async fn write_to<W>(&mut self, sink: &mut W, limit: u64) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut remaining = limit.min(self.file_length.saturating_sub(self.position));
        let mut written = 0;

        while remaining > 0 {
            if self.cancel.is_cancelled() {
                self.close();
                return Err(CacheError::Cancelled);
            }
            let copied = match self.step(sink, remaining).await {
                Ok(copied) => copied,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            if copied == 0 {
                break;
            }
            written += copied;
            remaining -= copied;
        }

        if self.is_eof() {
            self.close();
        }
        Ok(written)
    }

    /// Reads `length` bytes starting at `offset`, fewer at the end of file.
    ///
    /// # Errors
    ///
    /// Same as [`RangeReader::write_to`].
    pub async fn read_range(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset))?;
        let capacity = length.min(self.file_length.saturating_sub(offset));
        let mut body = Vec::with_capacity(capacity as usize);
        self.write_to(&mut body, length).await?;
        Ok(body)
    }

    /// Releases the open piece stream, if any.
    pub fn close(&mut self) {
        if let Some(open) = self.open.take() {
            trace!("Closed stream of piece {} for {}", open.index, self.name);
        }
    }

    async fn step<W>(&mut self, sink: &mut W, limit: u64) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let absolute = self.file_offset + self.position;
        let Some(span) = span_for(&self.layout, absolute, limit) else {
            return Ok(0);
        };

        if self.last_index != Some(span.piece.index) {
            self.last_index = Some(span.piece.index);
            self.queue_lookahead(span.piece.index);
        }

        let reusable = self
            .open
            .as_ref()
            .is_some_and(|open| open.index == span.piece.index && open.remaining > 0);
        if !reusable {
            self.close();
            self.open = Some(self.open_span(&span).await?);
        }

        let cancel = self.cancel.clone();
        let mut buffer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            buffer = self.buffers.acquire() => buffer?,
        };

        let Some(open) = self.open.as_mut() else {
            return Ok(0);
        };
        let want = (buffer.len() as u64).min(open.remaining).min(limit) as usize;
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            read = open.stream.read(&mut buffer[..want]) => read?,
        };
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("piece {} ended {} bytes early", open.index, open.remaining),
            )
            .into());
        }
        open.remaining -= read as u64;
        if open.remaining == 0 {
            self.close();
        }

        if let Some(limiter) = &self.limiter {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = limiter.acquire(read as u64) => {}
            }
        }
        sink.write_all(&buffer[..read]).await?;
        drop(buffer);

        self.position += read as u64;
        self.signal_touch();
        Ok(read as u64)
    }

    async fn open_span(&mut self, span: &PieceSpan) -> Result<OpenPiece> {
        let request = self.piece_request(span.piece.hash);
        debug!(
            "Opening piece {} [{}..={}] for {}",
            span.piece.index, span.start, span.end, self.name
        );
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CacheError::Cancelled),
            stream = self.pieces.open_piece(&request, span.window(), &self.cancel) => stream?,
        };
        Ok(OpenPiece {
            index: span.piece.index,
            stream,
            remaining: span.byte_count(),
        })
    }

    fn piece_request(&self, piece_hash: PieceHash) -> PieceRequest {
        PieceRequest {
            source: self.origin.source.clone(),
            info_hash: self.layout.info_hash,
            piece_hash,
            query: self.origin.query.clone(),
        }
    }

    /// Hands the pieces after `index` that were not queued yet, up to the
    /// end of the file, to the reader's feed task.
    fn queue_lookahead(&mut self, index: u32) {
        if self.file_length == 0 || self.layout.piece_length == 0 {
            return;
        }
        let file_last_byte = self.file_offset + self.file_length - 1;
        let file_last_index = (file_last_byte / self.layout.piece_length) as u32;

        let Some(prefetch) = &self.prefetch else {
            return;
        };
        if prefetch.pieces == 0 {
            return;
        }
        let first = match prefetch.queued_through {
            Some(queued) => queued.max(index).saturating_add(1),
            None => index.saturating_add(1),
        };
        let last = index.saturating_add(prefetch.pieces).min(file_last_index);
        if first > last {
            return;
        }
        let requests: Vec<PieceRequest> = (first..=last)
            .filter_map(|next| self.layout.piece(next))
            .map(|piece| self.piece_request(piece.hash))
            .collect();

        trace!("Prefetching pieces {}..={} for {}", first, last, self.name);
        let cancel = self.cancel.clone();
        let Some(prefetch) = self.prefetch.as_mut() else {
            return;
        };
        prefetch.queued_through = Some(last);
        if prefetch.feed.is_none() {
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(feed_prefetch(
                Arc::clone(&prefetch.queues),
                prefetch.session.clone(),
                receiver,
                cancel,
            ));
            prefetch.feed = Some(sender);
        }
        let Some(feed) = &prefetch.feed else {
            return;
        };
        for request in requests {
            if feed.send(request).is_err() {
                break;
            }
        }
    }

    fn signal_touch(&mut self) {
        if self.touched {
            return;
        }
        self.touched = true;
        let Some(touch) = self.touch.clone() else {
            return;
        };
        let info_hash = self.layout.info_hash;
        tokio::spawn(async move {
            if let Err(e) = touch.touch(&info_hash).await {
                warn!("Failed to touch torrent {}: {}", info_hash, e);
            }
        });
    }
}

/// Pushes lookahead requests onto the session queue in order, waiting for
/// room, until the reader is dropped or its token fires.
async fn feed_prefetch(
    queues: Arc<PrefetchQueuePool>,
    session: String,
    mut requests: mpsc::UnboundedReceiver<PieceRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let pushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pushed = queues.push(&session, request) => pushed,
        };
        if !pushed {
            break;
        }
    }
    trace!("Prefetch feed for session {} stopped", session);
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::preload::Preloader;
    use crate::store::TorrentStore;
    use crate::testing::{RouterHarness, TorrentFixture};

    /// Records every window opened and delegates to the router.
    struct RecordingSource {
        router: Arc<PieceSourceRouter>,
        opened: Mutex<Vec<(PieceHash, PieceWindow)>>,
    }

    #[async_trait]
    impl PieceStreamSource for RecordingSource {
        async fn open_piece(
            &self,
            request: &PieceRequest,
            window: PieceWindow,
            cancel: &CancellationToken,
        ) -> Result<ByteStream> {
            self.opened.lock().push((request.piece_hash, window));
            self.router.get(request, window, cancel).await
        }
    }

    #[derive(Default)]
    struct RecordingPreloader {
        seen: Mutex<Vec<PieceHash>>,
    }

    #[async_trait]
    impl Preloader for RecordingPreloader {
        async fn preload(&self, request: &PieceRequest) -> Result<()> {
            self.seen.lock().push(request.piece_hash);
            Ok(())
        }
    }

    /// Completes a preload only once the test hands out a permit.
    struct GatedPreloader {
        gate: Semaphore,
        seen: Mutex<Vec<PieceHash>>,
    }

    #[async_trait]
    impl Preloader for GatedPreloader {
        async fn preload(&self, request: &PieceRequest) -> Result<()> {
            self.gate
                .acquire()
                .await
                .map_err(|_| CacheError::Cancelled)?
                .forget();
            self.seen.lock().push(request.piece_hash);
            Ok(())
        }
    }

    struct Setup {
        harness: RouterHarness,
        source: Arc<RecordingSource>,
        layout: Arc<TorrentMetadata>,
    }

    /// Two files; the second spans all three pieces.
    fn create_test_setup() -> Setup {
        let fixture = TorrentFixture::new("album", 16384)
            .with_file(&["a.bin"], 10000)
            .with_file(&["b.bin"], 30000);
        let layout = Arc::new(fixture.metadata());
        let harness = RouterHarness::new(fixture, &[0, 1]);
        let source = Arc::new(RecordingSource {
            router: harness.router.clone(),
            opened: Mutex::new(Vec::new()),
        });
        Setup {
            harness,
            source,
            layout,
        }
    }

    /// One file over sixteen small pieces.
    fn create_many_piece_setup() -> Setup {
        let fixture = TorrentFixture::new("tape.raw", 1024).with_file(&[], 16 * 1024);
        let layout = Arc::new(fixture.metadata());
        let harness = RouterHarness::new(fixture, &[]);
        let source = Arc::new(RecordingSource {
            router: harness.router.clone(),
            opened: Mutex::new(Vec::new()),
        });
        Setup {
            harness,
            source,
            layout,
        }
    }

    fn create_reader(setup: &Setup, file: usize, cancel: CancellationToken) -> RangeReader {
        let entry = &setup.layout.files[file];
        RangeReader::new(
            setup.layout.clone(),
            PieceOriginRef {
                source: "http://origin.test".to_string(),
                query: None,
            },
            setup.layout.file_path(entry),
            entry.offset,
            entry.length,
            setup.source.clone(),
            BufferPool::new(4, 4096),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_write_to_copies_file_across_pieces() {
        let setup = create_test_setup();
        let mut reader = create_reader(&setup, 1, CancellationToken::new());
        let mut sink = Vec::new();

        let written = reader.write_to(&mut sink, 30000).await.unwrap();

        assert_eq!(written, 30000);
        assert_eq!(sink, setup.harness.fixture.data()[10000..40000].to_vec());
        assert!(reader.is_eof());
        assert_eq!(reader.write_to(&mut sink, 100).await.unwrap(), 0);

        let opened: Vec<PieceHash> = setup.source.opened.lock().iter().map(|(hash, _)| *hash).collect();
        let expected: Vec<PieceHash> = (0..3).map(|i| setup.harness.fixture.piece_hash(i)).collect();
        assert_eq!(opened, expected);
    }

    #[tokio::test]
    async fn test_range_within_one_piece_opens_one_window() {
        let fixture = TorrentFixture::new("movie.mkv", 16384).with_file(&[], 40000);
        let layout = Arc::new(fixture.metadata());
        let harness = RouterHarness::new(fixture, &[0, 1, 2]);
        let source = Arc::new(RecordingSource {
            router: harness.router.clone(),
            opened: Mutex::new(Vec::new()),
        });
        let setup = Setup {
            harness,
            source,
            layout,
        };
        let mut reader = create_reader(&setup, 0, CancellationToken::new());

        let body = reader.read_range(20000, 10000).await.unwrap();

        assert_eq!(body, setup.harness.fixture.data()[20000..30000].to_vec());
        let opened = setup.source.opened.lock().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, setup.harness.fixture.piece_hash(1));
        assert_eq!((opened[0].1.start, opened[0].1.end), (3616, 13615));
        assert!(!opened[0].1.full);
    }

    #[tokio::test]
    async fn test_backward_seek_reopens_piece() {
        let setup = create_test_setup();
        let mut reader = create_reader(&setup, 1, CancellationToken::new());
        let data = setup.harness.fixture.data();

        let first = reader.read_range(100, 50).await.unwrap();
        assert_eq!(first, data[10100..10150].to_vec());
        assert_eq!(reader.position(), 150);

        let mut more = Vec::new();
        reader.seek(SeekFrom::Start(0)).unwrap();
        assert!(reader.open.is_none());
        reader.write_to(&mut more, 10).await.unwrap();

        assert_eq!(more, data[10000..10010].to_vec());
        assert_eq!(setup.source.opened.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_continued_reads_reopen_exhausted_window() {
        let setup = create_test_setup();
        let mut reader = create_reader(&setup, 1, CancellationToken::new());
        let data = setup.harness.fixture.data();

        let mut sink = Vec::new();
        reader.write_to(&mut sink, 1000).await.unwrap();
        reader.write_to(&mut sink, 1000).await.unwrap();

        assert_eq!(sink, data[10000..12000].to_vec());
        let opened = setup.source.opened.lock().clone();
        assert_eq!(opened.len(), 2);
        assert_eq!((opened[1].1.start, opened[1].1.end), (11000, 11999));
    }

    #[tokio::test]
    async fn test_seek_positions() {
        let setup = create_test_setup();
        let mut reader = create_reader(&setup, 1, CancellationToken::new());

        assert_eq!(reader.seek(SeekFrom::End(-10)).unwrap(), 29990);
        assert_eq!(reader.seek(SeekFrom::Current(5)).unwrap(), 29995);
        assert!(reader.seek(SeekFrom::Current(-40000)).is_err());
        assert_eq!(reader.position(), 29995);
    }

    #[tokio::test]
    async fn test_cancelled_reader_stops() {
        let setup = create_test_setup();
        let cancel = CancellationToken::new();
        let mut reader = create_reader(&setup, 1, cancel.clone());
        cancel.cancel();

        let result = reader.write_to(&mut Vec::new(), 100).await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert!(setup.source.opened.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lookahead_and_touch() {
        let setup = create_test_setup();
        let preloader = Arc::new(RecordingPreloader::default());
        let queues = Arc::new(PrefetchQueuePool::new(
            preloader.clone(),
            1,
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let touch = Arc::new(TorrentTouchCache::new(
            setup.harness.store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let mut reader = create_reader(&setup, 1, CancellationToken::new())
            .with_prefetch(queues, "session", 1)
            .with_touch(touch);

        reader.read_range(0, 10).await.unwrap();

        let touch_key = TorrentStore::touch_key(&setup.layout.info_hash);
        tokio::time::timeout(Duration::from_secs(2), async {
            while preloader.seen.lock().is_empty()
                || setup.harness.objects.object("bucket", &touch_key).is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            preloader.seen.lock().clone(),
            vec![setup.harness.fixture.piece_hash(1)]
        );
    }

    #[tokio::test]
    async fn test_lookahead_queues_each_piece_once() {
        let setup = create_many_piece_setup();
        let preloader = Arc::new(RecordingPreloader::default());
        let queues = Arc::new(PrefetchQueuePool::new(
            preloader.clone(),
            1,
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let mut reader = create_reader(&setup, 0, CancellationToken::new()).with_prefetch(queues, "session", 4);

        let body = reader.read_range(0, 16 * 1024).await.unwrap();
        assert_eq!(body, setup.harness.fixture.data());

        tokio::time::timeout(Duration::from_secs(2), async {
            while preloader.seen.lock().len() < 15 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let expected: Vec<PieceHash> = (1..16).map(|i| setup.harness.fixture.piece_hash(i)).collect();
        assert_eq!(preloader.seen.lock().clone(), expected);
    }

    #[tokio::test]
    async fn test_lookahead_stops_when_cancelled() {
        let setup = create_many_piece_setup();
        let preloader = Arc::new(GatedPreloader {
            gate: Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let queues = Arc::new(PrefetchQueuePool::new(
            preloader.clone(),
            1,
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let cancel = CancellationToken::new();
        let mut reader = create_reader(&setup, 0, cancel.clone()).with_prefetch(queues, "session", 4);

        reader.read_range(0, 16 * 1024).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        preloader.gate.add_permits(64);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // One request held by the worker plus one waiting in the queue.
        assert!(preloader.seen.lock().len() <= 2);
    }

    #[tokio::test]
    async fn test_rate_limited_read_is_throttled() {
        let setup = create_test_setup();
        let mut reader = create_reader(&setup, 1, CancellationToken::new())
            .with_rate_limiter(Arc::new(RateLimiter::new(4096)));

        let started = Instant::now();
        let body = reader.read_range(0, 6000).await.unwrap();

        assert_eq!(body, setup.harness.fixture.data()[10000..16000].to_vec());
        // The first 4096 bytes drain the initial burst; the rest waits for refill.
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
