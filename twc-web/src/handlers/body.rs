//! Response bodies fed by background copy tasks.
//!
//! A spawned task writes into one end of an in-memory pipe and the other end
//! becomes the response body. When the client goes away the pipe breaks, the
//! copy fails and the task ends, which cancels the request scope.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use twc_core::store::ByteStream;
use twc_core::streaming::{BufferPool, RangeReader, RateLimiter};
use twc_core::{CacheError, Result};

/// Capacity of the pipe between a copy task and its response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Cancellation scope of one request. Every fetch made on behalf of the
/// request is bound to its token, which fires when the scope is dropped.
pub struct RequestScope {
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestScope {
    pub fn new() -> Self {
        let token = CancellationToken::new();
        Self {
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams `length` bytes of `reader` starting at `start`.
pub fn reader_body(mut reader: RangeReader, start: u64, length: u64, scope: RequestScope) -> Body {
    let (mut writer, body) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(async move {
        let _scope = scope;
        let result = copy_range(&mut reader, &mut writer, start, length).await;
        reader.close();
        finish(&mut writer, reader.name(), result).await;
    });

    Body::from_stream(ReaderStream::new(body))
}

async fn copy_range(
    reader: &mut RangeReader,
    writer: &mut DuplexStream,
    start: u64,
    length: u64,
) -> Result<u64> {
    reader.seek(SeekFrom::Start(start))?;
    reader.write_to(writer, length).await
}

/// Streams a raw piece, throttled by `limiter` when present.
pub fn piece_body(
    mut stream: ByteStream,
    buffers: Arc<BufferPool>,
    limiter: Option<RateLimiter>,
    name: String,
    scope: RequestScope,
) -> Body {
    let (mut writer, body) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(async move {
        let cancel = scope.token().clone();
        let result = copy_piece(&mut stream, &mut writer, &buffers, limiter.as_ref(), &cancel).await;
        drop(scope);
        finish(&mut writer, &name, result).await;
    });

    Body::from_stream(ReaderStream::new(body))
}

async fn copy_piece(
    stream: &mut ByteStream,
    writer: &mut DuplexStream,
    buffers: &Arc<BufferPool>,
    limiter: Option<&RateLimiter>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut written = 0;
    loop {
        let mut buffer = buffers.acquire().await?;
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            read = stream.read(&mut buffer[..]) => read?,
        };
        if read == 0 {
            return Ok(written);
        }
        if let Some(limiter) = limiter {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = limiter.acquire(read as u64) => {}
            }
        }
        writer.write_all(&buffer[..read]).await?;
        written += read as u64;
    }
}

async fn finish(writer: &mut DuplexStream, name: &str, result: Result<u64>) {
    match result {
        Ok(written) => {
            debug!("Streamed {} bytes of {}", written, name);
            if let Err(e) = writer.shutdown().await {
                debug!("Failed to close body of {}: {}", name, e);
            }
        }
        Err(CacheError::Cancelled) => debug!("Streaming of {} cancelled", name),
        Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("Client went away while streaming {}", name);
        }
        Err(e) => warn!("Streaming of {} failed: {}", name, e),
    }
}
