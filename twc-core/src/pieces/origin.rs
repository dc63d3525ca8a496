//! Live HTTP origin serving pieces that are not committed to the store yet.

use std::io;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::PieceRequest;
use crate::config::NetworkConfig;
use crate::store::{ByteRange, ByteStream};
use crate::{CacheError, Result};

/// Source of piece bytes reachable over the network.
#[async_trait]
pub trait PieceOrigin: Send + Sync {
    /// Streams the piece, or the inclusive `range` of it.
    ///
    /// # Errors
    ///
    /// - `CacheError::Origin` - If the origin is unreachable or answers with an error status
    /// - `CacheError::Cancelled` - If `cancel` fired before the response arrived
    async fn fetch_piece(
        &self,
        request: &PieceRequest,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;
}

/// Origin reached with plain `GET {source}/{infohash}/piece/{piecehash}`.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
}

impl HttpOrigin {
    /// # Errors
    ///
    /// - `CacheError::Configuration` - If the HTTP client cannot be built
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| CacheError::Configuration {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// URL of a piece on the origin, carrying the request's query string.
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidSourceUrl` - If the source is not a valid base URL
    pub fn piece_url(request: &PieceRequest) -> Result<Url> {
        let raw = format!(
            "{}/{}/piece/{}",
            request.source.trim_end_matches('/'),
            request.info_hash,
            request.piece_hash
        );
        let mut url = Url::parse(&raw).map_err(|e| CacheError::InvalidSourceUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        url.set_query(request.query.as_deref().filter(|query| !query.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl PieceOrigin for HttpOrigin {
    async fn fetch_piece(
        &self,
        request: &PieceRequest,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let url = Self::piece_url(request)?;
        let origin_error = |reason: String| CacheError::Origin {
            url: url.to_string(),
            reason,
        };

        let mut builder = self.client.get(url.clone());
        if let Some(range) = range {
            builder = builder.header(RANGE, range.header_value());
        }
        debug!("Origin GET {} range={:?}", url, range);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = builder.send() => response.map_err(|e| origin_error(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(origin_error(format!("unexpected status {status}")));
        }

        let body = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(Box::pin(body));

        match range {
            // Origin ignored the range and sent the whole piece.
            Some(range) if status == StatusCode::OK => {
                let skipped = tokio::io::copy(&mut (&mut reader).take(range.start), &mut tokio::io::sink())
                    .await
                    .map_err(|e| origin_error(e.to_string()))?;
                if skipped < range.start {
                    return Err(origin_error(format!(
                        "body ended after {skipped} bytes, before range start {}",
                        range.start
                    )));
                }
                Ok(Box::pin(reader.take(range.len())))
            }
            _ => Ok(Box::pin(reader)),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use static_origin::StaticOrigin;

#[cfg(any(test, feature = "test-utils"))]
mod static_origin {
    use std::collections::{HashMap, HashSet};
    use std::io::Cursor;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::torrent::PieceHash;

    /// In-memory origin with request counting and injected failures.
    #[derive(Debug, Default)]
    pub struct StaticOrigin {
        pieces: Mutex<HashMap<PieceHash, Bytes>>,
        requests: Mutex<HashMap<PieceHash, usize>>,
        failing: Mutex<HashSet<PieceHash>>,
    }

    impl StaticOrigin {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, piece_hash: PieceHash, body: impl Into<Bytes>) {
            self.pieces.lock().insert(piece_hash, body.into());
        }

        pub fn fail_requests(&self, piece_hash: PieceHash) {
            self.failing.lock().insert(piece_hash);
        }

        pub fn request_count(&self, piece_hash: &PieceHash) -> usize {
            self.requests.lock().get(piece_hash).copied().unwrap_or(0)
        }

        pub fn total_requests(&self) -> usize {
            self.requests.lock().values().sum()
        }
    }

    #[async_trait]
    impl PieceOrigin for StaticOrigin {
        async fn fetch_piece(
            &self,
            request: &PieceRequest,
            range: Option<ByteRange>,
            cancel: &CancellationToken,
        ) -> Result<ByteStream> {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            *self.requests.lock().entry(request.piece_hash).or_default() += 1;

            let url = HttpOrigin::piece_url(request)?.to_string();
            if self.failing.lock().contains(&request.piece_hash) {
                return Err(CacheError::Origin {
                    url,
                    reason: "injected failure".to_string(),
                });
            }

            let body = self.pieces.lock().get(&request.piece_hash).cloned();
            let Some(body) = body else {
                return Err(CacheError::Origin {
                    url,
                    reason: "unexpected status 404 Not Found".to_string(),
                });
            };

            let body = match range {
                Some(range) => {
                    let start = (range.start as usize).min(body.len());
                    let end = (range.end as usize).saturating_add(1).min(body.len());
                    body.slice(start..end.max(start))
                }
                None => body,
            };
            Ok(Box::pin(Cursor::new(body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::torrent::{InfoHash, PieceHash};

    fn create_test_request(source: &str) -> PieceRequest {
        PieceRequest {
            source: source.to_string(),
            info_hash: InfoHash::new([0xaa; 20]),
            piece_hash: PieceHash::new([0xbb; 20]),
            query: Some("token=abc".to_string()),
        }
    }

    fn piece_path() -> String {
        format!("/{}/piece/{}", "aa".repeat(20), "bb".repeat(20))
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        body
    }

    #[test]
    fn test_piece_url_carries_query() {
        let url = HttpOrigin::piece_url(&create_test_request("http://origin:8080/")).unwrap();
        assert_eq!(
            url.as_str(),
            format!("http://origin:8080{}?token=abc", piece_path())
        );
    }

    #[tokio::test]
    async fn test_range_request_sends_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(piece_path()))
            .and(query_param("token", "abc"))
            .and(header("range", "bytes=2-5"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"2345".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(&NetworkConfig::default()).unwrap();
        let stream = origin
            .fetch_piece(
                &create_test_request(&server.uri()),
                Some(ByteRange::new(2, 5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"2345");
    }

    #[tokio::test]
    async fn test_ignored_range_is_applied_locally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(piece_path()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(&NetworkConfig::default()).unwrap();
        let stream = origin
            .fetch_piece(
                &create_test_request(&server.uri()),
                Some(ByteRange::new(3, 6)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"3456");
    }

    #[tokio::test]
    async fn test_error_status_is_origin_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(&NetworkConfig::default()).unwrap();
        let result = origin
            .fetch_piece(&create_test_request(&server.uri()), None, &CancellationToken::new())
            .await;
        match result {
            Err(CacheError::Origin { reason, .. }) => assert!(reason.contains("503")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an origin error"),
        }
    }
}
