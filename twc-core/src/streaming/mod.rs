//! Streaming file bytes out of pieces: readers, buffers and throttling.

pub mod buffer_pool;
pub mod byte_size;
pub mod range_reader;
pub mod reader_factory;
pub mod span;
pub mod token_bucket;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use byte_size::{InvalidByteSize, parse_byte_size};
pub use range_reader::{PieceOriginRef, PieceStreamSource, RangeReader};
pub use reader_factory::{OpenedReader, ReaderFactory, ReaderResolution, ReaderTarget, SourceUrl, session_id};
pub use span::{PieceSpan, piece_indices, span_for};
pub use token_bucket::{RateLimiter, TokenBucket};
