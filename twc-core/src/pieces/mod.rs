//! Piece-level resolution: which pieces are committed, where their bytes
//! come from, and the torrent-scoped caches in front of the store.

pub mod completed;
pub mod completed_cache;
pub mod metadata_cache;
pub mod origin;
pub mod router;
pub mod touch;

pub use completed::CompletedPieceSet;
pub use completed_cache::CompletedPieceSetCache;
pub use metadata_cache::MetadataCache;
#[cfg(any(test, feature = "test-utils"))]
pub use origin::StaticOrigin;
pub use origin::{HttpOrigin, PieceOrigin};
pub use router::{FetchPolicy, PieceSource, PieceSourceRouter};
pub use touch::TorrentTouchCache;

use crate::store::ByteRange;
use crate::torrent::{InfoHash, PieceHash};

/// Everything needed to fetch one piece from any source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceRequest {
    /// Origin base URL, `scheme://host[:port]`
    pub source: String,
    pub info_hash: InfoHash,
    pub piece_hash: PieceHash,
    /// Query string forwarded to the origin
    pub query: Option<String>,
}

/// Inclusive byte window within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWindow {
    pub start: u64,
    pub end: u64,
    /// The window covers the entire piece
    pub full: bool,
}

impl PieceWindow {
    /// Window `[start, end]` of a piece that is `piece_length` bytes long.
    pub fn new(start: u64, end: u64, piece_length: u64) -> Self {
        Self {
            start,
            end,
            full: start == 0 && end + 1 >= piece_length,
        }
    }

    /// The whole piece, whatever its length.
    pub fn whole() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
            full: true,
        }
    }

    /// Range to request from a source, `None` for the whole piece.
    pub fn byte_range(&self) -> Option<ByteRange> {
        (!self.full).then(|| ByteRange::new(self.start, self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_window_requests_whole_piece() {
        let window = PieceWindow::new(0, 16383, 16384);
        assert!(window.full);
        assert_eq!(window.byte_range(), None);
    }

    #[test]
    fn test_partial_window() {
        let window = PieceWindow::new(3616, 13615, 16384);
        assert!(!window.full);
        assert_eq!(window.byte_range(), Some(ByteRange::new(3616, 13615)));
    }
}
