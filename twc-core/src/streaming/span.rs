//! Mapping byte offsets of the torrent data onto piece windows.

use crate::pieces::PieceWindow;
use crate::torrent::{PieceInfo, TorrentMetadata};

/// The part of one piece covered by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpan {
    pub piece: PieceInfo,
    /// First byte within the piece
    pub start: u64,
    /// Last byte within the piece, inclusive
    pub end: u64,
    /// The span covers the entire piece
    pub full: bool,
}

impl PieceSpan {
    /// Number of bytes covered, never zero.
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn window(&self) -> PieceWindow {
        PieceWindow {
            start: self.start,
            end: self.end,
            full: self.full,
        }
    }
}

/// Span of the piece holding `absolute_offset`, covering at most `limit`
/// bytes. `None` past the end of the data or for an empty read.
pub fn span_for(layout: &TorrentMetadata, absolute_offset: u64, limit: u64) -> Option<PieceSpan> {
    if limit == 0 {
        return None;
    }
    let piece = layout.piece_at_offset(absolute_offset)?;
    let start = absolute_offset - piece.offset;
    let end = (piece.length - 1).min(start.saturating_add(limit - 1));
    Some(PieceSpan {
        piece,
        start,
        end,
        full: end - start == piece.length - 1,
    })
}

/// Indices of the pieces a byte range touches, inclusive.
pub fn piece_indices(layout: &TorrentMetadata, offset: u64, length: u64) -> Option<(u32, u32)> {
    if length == 0 || layout.piece_length == 0 {
        return None;
    }
    let last_byte = offset.checked_add(length - 1)?.min(layout.total_length.checked_sub(1)?);
    if offset > last_byte {
        return None;
    }
    Some((
        (offset / layout.piece_length) as u32,
        (last_byte / layout.piece_length) as u32,
    ))
}
