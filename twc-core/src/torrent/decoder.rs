//! Bencode decoding of `.torrent` documents into [`TorrentMetadata`].

use super::metadata::{FileEntry, TorrentMetadata};
use super::{HASH_LEN, InfoHash, PieceHash, TorrentError};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Turns raw metadata bytes fetched from the store into a torrent layout.
pub trait MetadataDecoder: Send + Sync {
    /// Decodes the metadata document for `info_hash`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataDecode` - If the document is malformed or its
    ///   piece and file sizes disagree
    fn decode(&self, info_hash: InfoHash, bytes: &[u8]) -> Result<TorrentMetadata, TorrentError>;
}

/// Decoder for standard bencoded `.torrent` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct BencodeMetadataDecoder;

impl MetadataDecoder for BencodeMetadataDecoder {
    fn decode(&self, info_hash: InfoHash, bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(bytes)
            .map_err(|e| decode_error(format!("Bencode parsing failed: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(root)) = parsed.first() else {
            return Err(decode_error("Root element must be dictionary"));
        };

        let Some(bencode_rs::Value::Dictionary(info)) = root.get(b"info".as_slice()) else {
            return Err(decode_error("Missing or invalid 'info' dictionary"));
        };

        let name = extract_string(info, b"name")?;
        let piece_length = extract_integer(info, b"piece length")?;
        if piece_length == 0 {
            return Err(decode_error("Piece length must be positive"));
        }

        let pieces = extract_bytes(info, b"pieces")?;
        if pieces.len() % HASH_LEN != 0 {
            return Err(decode_error(format!(
                "Pieces field length {} is not a multiple of {HASH_LEN}",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<PieceHash> = pieces
            .chunks_exact(HASH_LEN)
            .filter_map(PieceHash::from_slice)
            .collect();

        let files = match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
            (Some(bencode_rs::Value::Integer(length)), _) => vec![FileEntry {
                path: Vec::new(),
                length: non_negative(*length, "length")?,
                offset: 0,
            }],
            (_, Some(bencode_rs::Value::List(list))) => extract_files(list)?,
            _ => return Err(decode_error("Missing 'files' or 'length' field")),
        };

        let total_length: u64 = files.iter().map(|file| file.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(decode_error(format!(
                "Torrent of {total_length} bytes with piece length {piece_length} needs {expected_pieces} pieces, found {}",
                piece_hashes.len()
            )));
        }

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
        })
    }
}

fn decode_error(reason: impl Into<String>) -> TorrentError {
    TorrentError::MetadataDecode {
        reason: reason.into(),
    }
}

fn non_negative(value: i64, field: &str) -> ParseResult<u64> {
    u64::try_from(value).map_err(|_| decode_error(format!("Negative value in field '{field}'")))
}

fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(decode_error(format!(
            "Missing or invalid field: {:?}",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
    let bytes = extract_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        decode_error(format!(
            "Invalid UTF-8 in field: {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<u64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => {
            non_negative(*value, &String::from_utf8_lossy(key))
        }
        _ => Err(decode_error(format!(
            "Missing or invalid integer field: {:?}",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn extract_files(list: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<FileEntry>> {
    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;

    for value in list {
        let bencode_rs::Value::Dictionary(file) = value else {
            return Err(decode_error("File entry must be dictionary"));
        };

        let length = extract_integer(file, b"length")?;
        let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
            return Err(decode_error("Missing or invalid path in file"));
        };

        let mut path = Vec::with_capacity(components.len());
        for component in components {
            let bencode_rs::Value::Bytes(bytes) = component else {
                return Err(decode_error("Path component must be a string"));
            };
            let component = String::from_utf8(bytes.to_vec())
                .map_err(|_| decode_error("Invalid UTF-8 in path component"))?;
            path.push(component);
        }

        files.push(FileEntry {
            path,
            length,
            offset,
        });
        offset += length;
    }

    Ok(files)
}
