//! Membership record of pieces committed to the object store.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::torrent::{HASH_LEN, PieceHash, TorrentError};
use crate::{CacheError, Result};

/// Snapshot of the pieces of one torrent that are durably stored.
///
/// Serialized as a plain concatenation of 20-byte piece hashes. Once
/// loaded the set is never mutated; freshness is bounded by the cache that
/// holds it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedPieceSet {
    pieces: HashSet<PieceHash>,
}

impl CompletedPieceSet {
    /// Parses a concatenation of 20-byte hashes.
    ///
    /// # Errors
    ///
    /// - `CacheError::MalformedCacheRecord` - If the length is not a multiple of 20
    pub fn load(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % HASH_LEN != 0 {
            return Err(CacheError::MalformedCacheRecord {
                length: bytes.len(),
            });
        }

        let pieces = bytes
            .chunks_exact(HASH_LEN)
            .filter_map(PieceHash::from_slice)
            .collect();
        Ok(Self { pieces })
    }

    /// Reads the whole stream and parses it with [`CompletedPieceSet::load`].
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If reading the stream fails
    /// - `CacheError::MalformedCacheRecord` - If the length is not a multiple of 20
    pub async fn read_from<R>(mut reader: R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        Self::load(&bytes)
    }

    pub fn has(&self, piece_hash: &PieceHash) -> bool {
        self.pieces.contains(piece_hash)
    }

    /// Membership test for a hex-encoded piece hash.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidHashEncoding` - If `hex` is not a 40 character hex string
    pub fn has_hex(&self, hex: &str) -> std::result::Result<bool, TorrentError> {
        PieceHash::from_hex(hex).map(|hash| self.has(&hash))
    }

    pub fn insert(&mut self, piece_hash: PieceHash) {
        self.pieces.insert(piece_hash);
    }

    /// Serialized form. Hashes are sorted so equal sets encode identically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut hashes: Vec<&PieceHash> = self.pieces.iter().collect();
        hashes.sort();

        let mut bytes = Vec::with_capacity(hashes.len() * HASH_LEN);
        for hash in hashes {
            bytes.extend_from_slice(hash.as_bytes());
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn hash(byte: u8) -> PieceHash {
        PieceHash::new([byte; 20])
    }

    #[test]
    fn test_has_hex() {
        let set = CompletedPieceSet::load(&[[0xab; 20], [0x01; 20]].concat()).unwrap();
        assert_eq!(set.has_hex(&"ab".repeat(20)), Ok(true));
        assert_eq!(set.has_hex(&"cd".repeat(20)), Ok(false));
    }

    #[test]
    fn test_has_hex_rejects_malformed_input() {
        let set = CompletedPieceSet::default();
        assert!(matches!(
            set.has_hex("not-hex!"),
            Err(TorrentError::InvalidHashEncoding { .. })
        ));
    }

    #[test]
    fn test_empty_record_is_empty_set() {
        let set = CompletedPieceSet::load(&[]).unwrap();
        assert!(set.is_empty());
        assert!(set.to_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let bytes = [[1u8; 20], [2u8; 20], [3u8; 20]].concat();
        let set = CompletedPieceSet::read_from(std::io::Cursor::new(bytes)).await.unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.has(&hash(2)));
        assert!(!set.has(&hash(4)));
    }

    #[tokio::test]
    async fn test_read_from_chunked_stream() {
        // Records arrive split at arbitrary points, not on hash boundaries.
        let reader = tokio_test::io::Builder::new()
            .read(&[7u8; 13])
            .read(&[[7u8; 7], [8u8; 7]].concat())
            .read(&[8u8; 13])
            .build();
        let set = CompletedPieceSet::read_from(reader).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.has(&hash(7)) && set.has(&hash(8)));
    }

    #[tokio::test]
    async fn test_read_from_truncated_stream() {
        let reader = tokio_test::io::Builder::new().read(&[1u8; 30]).build();
        assert!(matches!(
            CompletedPieceSet::read_from(reader).await,
            Err(CacheError::MalformedCacheRecord { length: 30 })
        ));
    }

    proptest! {
        #[test]
        fn prop_load_then_to_bytes_keeps_the_same_hashes(
            hashes in proptest::collection::vec(proptest::array::uniform20(any::<u8>()), 0..64)
        ) {
            let bytes: Vec<u8> = hashes.iter().flatten().copied().collect();
            let set = CompletedPieceSet::load(&bytes).unwrap();
            let reloaded = CompletedPieceSet::load(&set.to_bytes()).unwrap();

            prop_assert_eq!(&reloaded, &set);
            for raw in &hashes {
                prop_assert!(reloaded.has(&PieceHash::new(*raw)));
            }
        }

        #[test]
        fn prop_partial_records_are_malformed(len in 0usize..400) {
            prop_assume!(len % 20 != 0);
            let result = CompletedPieceSet::load(&vec![0u8; len]);
            let is_malformed = matches!(
                result,
                Err(CacheError::MalformedCacheRecord { length }) if length == len
            );
            prop_assert!(is_malformed);
        }
    }
}
