//! Deterministic torrent fixtures shared by unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::pieces::{CompletedPieceSet, CompletedPieceSetCache, PieceRequest, PieceSourceRouter, StaticOrigin};
use crate::store::{MemoryObjectStore, TorrentStore};
use crate::torrent::{BencodeMetadataDecoder, InfoHash, MetadataDecoder, PieceHash, TorrentMetadata};

/// Builder for a synthetic torrent whose content bytes are a pure function
/// of their absolute offset.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    name: String,
    piece_length: u64,
    files: Vec<(Vec<String>, u64)>,
    piece_count_override: Option<usize>,
}

impl TorrentFixture {
    pub fn new(name: &str, piece_length: u64) -> Self {
        Self {
            name: name.to_string(),
            piece_length,
            files: Vec::new(),
            piece_count_override: None,
        }
    }

    /// Adds a file. An empty path marks a single-file torrent.
    pub fn with_file(mut self, path: &[&str], length: u64) -> Self {
        self.files
            .push((path.iter().map(|c| c.to_string()).collect(), length));
        self
    }

    /// Advertises a wrong number of piece hashes.
    pub fn with_piece_count(mut self, count: usize) -> Self {
        self.piece_count_override = Some(count);
        self
    }

    pub fn info_hash(&self) -> InfoHash {
        InfoHash::new(sha1_bytes(self.name.as_bytes()))
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|(_, length)| length).sum()
    }

    /// Content byte at an absolute offset within the concatenated data.
    pub fn byte_at(offset: u64) -> u8 {
        ((offset * 31 + 7) % 251) as u8
    }

    /// The full concatenated torrent data.
    pub fn data(&self) -> Vec<u8> {
        (0..self.total_length()).map(Self::byte_at).collect()
    }

    pub fn num_pieces(&self) -> usize {
        self.total_length().div_ceil(self.piece_length) as usize
    }

    pub fn piece_data(&self, index: usize) -> Vec<u8> {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length());
        (start..end).map(Self::byte_at).collect()
    }

    pub fn piece_hash(&self, index: usize) -> PieceHash {
        PieceHash::new(sha1_bytes(&self.piece_data(index)))
    }

    /// Encodes the torrent as a bencoded `.torrent` document.
    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        let count = self.piece_count_override.unwrap_or_else(|| self.num_pieces());
        let mut pieces = Vec::with_capacity(count * 20);
        for index in 0..count {
            pieces.extend_from_slice(self.piece_hash(index).as_bytes());
        }

        let mut info = Vec::new();
        info.push(b'd');
        match self.files.as_slice() {
            [(path, length)] if path.is_empty() => {
                encode_str(&mut info, b"length");
                encode_int(&mut info, *length);
                encode_str(&mut info, b"name");
                encode_str(&mut info, self.name.as_bytes());
            }
            files => {
                encode_str(&mut info, b"files");
                info.push(b'l');
                for (path, length) in files {
                    info.push(b'd');
                    encode_str(&mut info, b"length");
                    encode_int(&mut info, *length);
                    encode_str(&mut info, b"path");
                    info.push(b'l');
                    for component in path {
                        encode_str(&mut info, component.as_bytes());
                    }
                    info.push(b'e');
                    info.push(b'e');
                }
                info.push(b'e');
                encode_str(&mut info, b"name");
                encode_str(&mut info, self.name.as_bytes());
            }
        }
        encode_str(&mut info, b"piece length");
        encode_int(&mut info, self.piece_length);
        encode_str(&mut info, b"pieces");
        encode_str(&mut info, &pieces);
        info.push(b'e');

        let mut document = Vec::new();
        document.push(b'd');
        encode_str(&mut document, b"announce");
        encode_str(&mut document, b"http://tracker.invalid/announce");
        encode_str(&mut document, b"info");
        document.extend_from_slice(&info);
        document.push(b'e');
        document
    }

    /// Decoded layout of this fixture.
    ///
    /// # Panics
    ///
    /// Panics if the fixture was built with an inconsistent piece count.
    pub fn metadata(&self) -> TorrentMetadata {
        BencodeMetadataDecoder
            .decode(self.info_hash(), &self.to_torrent_bytes())
            .unwrap()
    }

    /// Publishes metadata and the pieces in `completed` to the store, and
    /// records them as committed.
    pub fn seed_store(&self, store: &MemoryObjectStore, layout: &TorrentStore, completed: &[usize]) {
        let info_hash = self.info_hash();
        store.insert(
            layout.bucket(),
            &TorrentStore::torrent_key(&info_hash),
            self.to_torrent_bytes(),
        );

        let mut set = CompletedPieceSet::default();
        for &index in completed {
            let hash = self.piece_hash(index);
            store.insert(
                &layout.piece_bucket(&info_hash),
                &TorrentStore::piece_key(&info_hash, &hash),
                self.piece_data(index),
            );
            set.insert(hash);
        }
        store.insert(
            layout.bucket(),
            &TorrentStore::completed_pieces_key(&info_hash),
            set.to_bytes(),
        );
    }
}

/// A fixture wired to an in-memory store and origin behind a router.
pub struct RouterHarness {
    pub fixture: TorrentFixture,
    pub objects: Arc<MemoryObjectStore>,
    pub store: TorrentStore,
    pub origin: Arc<StaticOrigin>,
    pub router: Arc<PieceSourceRouter>,
}

impl RouterHarness {
    /// Seeds `completed` pieces into the store and every piece into the origin.
    pub fn new(fixture: TorrentFixture, completed: &[usize]) -> Self {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = TorrentStore::new(objects.clone(), "bucket", false);
        fixture.seed_store(&objects, &store, completed);

        let origin = Arc::new(StaticOrigin::new());
        for index in 0..fixture.num_pieces() {
            origin.insert(fixture.piece_hash(index), fixture.piece_data(index));
        }

        let completed = Arc::new(CompletedPieceSetCache::new(
            store.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));
        let router = Arc::new(PieceSourceRouter::new(completed, store.clone(), origin.clone()));
        Self {
            fixture,
            objects,
            store,
            origin,
            router,
        }
    }

    pub fn request(&self, index: usize) -> PieceRequest {
        PieceRequest {
            source: "http://origin.test".to_string(),
            info_hash: self.fixture.info_hash(),
            piece_hash: self.fixture.piece_hash(index),
            query: None,
        }
    }
}

fn sha1_bytes(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

fn encode_str(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value);
}

fn encode_int(out: &mut Vec<u8>, value: u64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}
