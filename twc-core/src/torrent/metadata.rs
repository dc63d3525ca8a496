//! Decoded torrent layout: pieces, files and the offsets between them.

use super::{InfoHash, PieceHash};

/// One file inside the torrent's concatenated data blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components below the torrent name. Empty for single-file torrents.
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of the file's first byte within the concatenated data.
    pub offset: u64,
}

/// Location and identity of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: u32,
    pub hash: PieceHash,
    /// Byte offset of the piece within the concatenated data.
    pub offset: u64,
    pub length: u64,
}

/// Immutable torrent layout shared by every reader of a torrent.
///
/// Invariant: the file lengths sum to
/// `piece_length * (num_pieces - 1) + last_piece_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<PieceHash>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Size of the final piece, which may be shorter than `piece_length`.
    pub fn last_piece_length(&self) -> u64 {
        if self.piece_hashes.is_empty() {
            return 0;
        }
        let last_offset = (self.piece_hashes.len() as u64 - 1) * self.piece_length;
        self.total_length - last_offset
    }

    /// Returns the piece at `index`, or `None` past the end of the torrent.
    pub fn piece(&self, index: u32) -> Option<PieceInfo> {
        let hash = *self.piece_hashes.get(index as usize)?;
        let offset = index as u64 * self.piece_length;
        let length = if index + 1 == self.num_pieces() {
            self.last_piece_length()
        } else {
            self.piece_length
        };

        Some(PieceInfo {
            index,
            hash,
            offset,
            length,
        })
    }

    /// Returns the piece containing the absolute byte `offset`.
    pub fn piece_at_offset(&self, offset: u64) -> Option<PieceInfo> {
        if self.piece_length == 0 || offset >= self.total_length {
            return None;
        }
        self.piece((offset / self.piece_length) as u32)
    }

    /// Linear lookup of a piece by its content hash.
    pub fn piece_by_hash(&self, hash: &PieceHash) -> Option<PieceInfo> {
        self.piece_hashes
            .iter()
            .position(|candidate| candidate == hash)
            .and_then(|index| self.piece(index as u32))
    }

    /// Display path of a file: the torrent name, followed by the file's
    /// path components for multi-file torrents.
    pub fn file_path(&self, file: &FileEntry) -> String {
        if file.path.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.name, file.path.join("/"))
        }
    }

    /// Finds a file by its display path (see [`TorrentMetadata::file_path`]).
    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        let path = path.trim_start_matches('/');
        self.files.iter().find(|file| self.file_path(file) == path)
    }
}
