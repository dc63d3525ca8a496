//! Torrent identifiers, metadata layout and decoding.

pub mod decoder;
pub mod metadata;

use std::fmt;
use std::str::FromStr;

pub use decoder::{BencodeMetadataDecoder, MetadataDecoder};
pub use metadata::{FileEntry, PieceInfo, TorrentMetadata};

/// Length in bytes of every info-hash and piece hash.
pub const HASH_LEN: usize = 20;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file. Used as
/// the cache key for every torrent-scoped pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; HASH_LEN]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidHashEncoding` - If input is not exactly 20 hex-encoded bytes
    pub fn from_hex(input: &str) -> Result<Self, TorrentError> {
        decode_hash(input).map(Self)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex form used in object keys and URLs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Content hash of a single piece, as listed in the torrent metadata.
///
/// Piece hashes key the completed-piece set, the on-disk preload cache and
/// the object store layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceHash([u8; HASH_LEN]);

impl PieceHash {
    /// Creates PieceHash from raw bytes.
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidHashEncoding` - If input is not exactly 20 hex-encoded bytes
    pub fn from_hex(input: &str) -> Result<Self, TorrentError> {
        decode_hash(input).map(Self)
    }

    /// Builds a hash from a 20 byte slice.
    ///
    /// Returns `None` when the slice has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex form used for file names, object keys and URLs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for PieceHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

fn decode_hash(input: &str) -> Result<[u8; HASH_LEN], TorrentError> {
    let bytes = hex::decode(input).map_err(|e| TorrentError::InvalidHashEncoding {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    <[u8; HASH_LEN]>::try_from(bytes.as_slice()).map_err(|_| TorrentError::InvalidHashEncoding {
        input: input.to_string(),
        reason: format!("expected {HASH_LEN} bytes, got {}", bytes.len()),
    })
}

/// Errors raised while interpreting torrent identifiers and metadata.
///
/// Both variants are permanent input-format failures and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid hash encoding {input:?}: {reason}")]
    InvalidHashEncoding { input: String, reason: String },

    #[error("Failed to decode torrent metadata: {reason}")]
    MetadataDecode { reason: String },
}
