//! Router assembly and the HTTP server loop.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::routing::get;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use twc_core::CacheServices;
use twc_core::config::WebConfig;

use crate::handlers::{serve_completed_pieces, serve_content, serve_piece};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<CacheServices>,
    pub config: Arc<WebConfig>,
}

impl AppState {
    pub fn new(services: Arc<CacheServices>) -> Self {
        let config = Arc::new(services.config.web.clone());
        Self { services, config }
    }
}

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/completed_pieces", get(serve_completed_pieces))
        .route("/piece/{piece_hash}", get(serve_piece))
        .route("/", get(serve_content))
        .route("/{*path}", get(serve_content))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .with_state(state)
}

/// Serves the application until `shutdown` resolves.
///
/// In-flight requests are allowed to finish before this returns.
///
/// # Errors
///
/// - `std::io::Error` - If the listener cannot be bound or the server fails
pub async fn run_server<F>(services: Arc<CacheServices>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(services);
    let address = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Serving torrent web cache on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;
    use twc_core::CacheConfig;
    use twc_core::pieces::StaticOrigin;
    use twc_core::store::MemoryObjectStore;
    use twc_core::testing::TorrentFixture;

    use super::*;
    use crate::handlers::source::{DOWNLOAD_RATE_HEADER, SOURCE_URL_HEADER};

    struct TestServer {
        router: Router,
        services: Arc<CacheServices>,
        fixture: TorrentFixture,
        origin: Arc<StaticOrigin>,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        fn source_url(&self) -> String {
            format!("http://origin.test/{}/", self.fixture.info_hash())
        }

        async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> Response {
            let mut request = Request::builder()
                .uri(uri)
                .header(SOURCE_URL_HEADER, self.source_url());
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            self.router
                .clone()
                .oneshot(request.body(Body::empty()).unwrap())
                .await
                .unwrap()
        }
    }

    fn album_fixture() -> TorrentFixture {
        TorrentFixture::new("album", 16384)
            .with_file(&["a.bin"], 10000)
            .with_file(&["b.mp4"], 30000)
    }

    /// A two-file torrent with pieces 0 and 1 committed to the store and
    /// every piece available from the origin.
    async fn create_test_server(web: WebConfig) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::for_testing();
        config.preload.dir = dir.path().join("preload");
        config.web = web;

        let fixture = album_fixture();
        let objects = Arc::new(MemoryObjectStore::new());
        let origin = Arc::new(StaticOrigin::new());
        for index in 0..fixture.num_pieces() {
            origin.insert(fixture.piece_hash(index), fixture.piece_data(index));
        }

        let services = CacheServices::with_backends(config, objects.clone(), origin.clone())
            .await
            .unwrap();
        fixture.seed_store(&objects, &services.store, &[0, 1]);

        let services = Arc::new(services);
        TestServer {
            router: build_router(AppState::new(Arc::clone(&services))),
            services,
            fixture,
            origin,
            _dir: dir,
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_full_file() {
        let server = create_test_server(WebConfig::default()).await;

        let response = server.get("/album/b.mp4", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()["content-length"], "30000");

        let body = body_bytes(response).await;
        assert_eq!(body, server.fixture.data()[10000..].to_vec());
    }

    #[tokio::test]
    async fn test_partial_content_spans_pieces() {
        let server = create_test_server(WebConfig::default()).await;

        // Bytes 6000..=6767 of b.mp4 straddle the boundary of pieces 0 and 1
        let response = server.get("/album/b.mp4", &[("range", "bytes=6000-6767")]).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 6000-6767/30000");

        let body = body_bytes(response).await;
        assert_eq!(body, server.fixture.data()[16000..16768].to_vec());
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let server = create_test_server(WebConfig::default()).await;

        let response = server.get("/album/a.bin", &[("range", "bytes=-100")]).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 9900-9999/10000");
        let body = body_bytes(response).await;
        assert_eq!(body, server.fixture.data()[9900..10000].to_vec());
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let server = create_test_server(WebConfig::default()).await;

        let response = server.get("/album/a.bin", &[("range", "bytes=10000-")]).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */10000");
    }

    #[tokio::test]
    async fn test_unknown_torrent_redirects_to_origin() {
        let server = create_test_server(WebConfig::default()).await;
        let unknown = "ffffffffffffffffffffffffffffffffffffffff";

        let request = Request::builder()
            .uri("/movie.mkv?token=1")
            .header(SOURCE_URL_HEADER, format!("http://origin.test/{unknown}"))
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            format!("http://origin.test/{unknown}/movie.mkv?token=1").as_str()
        );
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_missing_file_is_internal_error() {
        let server = create_test_server(WebConfig::default()).await;
        let response = server.get("/album/c.bin", &[]).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.contains("c.bin"));
    }

    #[tokio::test]
    async fn test_missing_source_url_is_internal_error() {
        let server = create_test_server(WebConfig::default()).await;
        let request = Request::builder()
            .uri("/album/a.bin")
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.contains("X-Source-Url"));
    }

    #[tokio::test]
    async fn test_configured_source_url_wins() {
        let configured = create_test_server(WebConfig {
            source_url: Some(format!("http://origin.test/{}/", album_fixture().info_hash())),
            ..WebConfig::default()
        })
        .await;

        let request = Request::builder()
            .uri("/album/a.bin")
            .header(SOURCE_URL_HEADER, "http://elsewhere.test/0000000000000000000000000000000000000000/")
            .body(Body::empty())
            .unwrap();
        let response = configured.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, configured.fixture.data()[..10000].to_vec());
    }

    #[tokio::test]
    async fn test_completed_pieces_blob() {
        let server = create_test_server(WebConfig::default()).await;

        let response = server.get("/completed_pieces", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_bytes(response).await;
        let mut expected = server.fixture.piece_hash(0).as_bytes().to_vec();
        expected.extend_from_slice(server.fixture.piece_hash(1).as_bytes());
        assert_eq!(body.len(), 40);
        for chunk in expected.chunks(20) {
            assert!(body.chunks(20).any(|hash| hash == chunk));
        }
    }

    #[tokio::test]
    async fn test_raw_piece_from_origin() {
        let server = create_test_server(WebConfig::default()).await;
        let piece_hash = server.fixture.piece_hash(2);

        let response = server.get(&format!("/piece/{piece_hash}"), &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "7232");
        assert_eq!(body_bytes(response).await, server.fixture.piece_data(2));
        assert_eq!(server.origin.request_count(&piece_hash), 1);
    }

    #[tokio::test]
    async fn test_raw_piece_before_metadata_is_published() {
        let server = create_test_server(WebConfig::default()).await;
        let piece_hash = server.fixture.piece_hash(1);
        let unknown = "ffffffffffffffffffffffffffffffffffffffff";

        let request = Request::builder()
            .uri(format!("/piece/{piece_hash}"))
            .header(SOURCE_URL_HEADER, format!("http://origin.test/{unknown}"))
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(body_bytes(response).await, server.fixture.piece_data(1));
        assert_eq!(server.origin.request_count(&piece_hash), 1);
    }

    #[tokio::test]
    async fn test_piece_outside_torrent_is_internal_error() {
        let server = create_test_server(WebConfig::default()).await;
        let stranger = "0123456789abcdef0123456789abcdef01234567";

        let response = server.get(&format!("/piece/{stranger}"), &[]).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(server.origin.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_file_download_is_throttled() {
        let server = create_test_server(WebConfig::default()).await;

        let started = std::time::Instant::now();
        let response = server
            .get(
                "/album/b.mp4",
                &[("range", "bytes=0-5999"), (DOWNLOAD_RATE_HEADER, "4K")],
            )
            .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            body_bytes(response).await,
            server.fixture.data()[10000..16000].to_vec()
        );
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_raw_piece_is_throttled() {
        let server = create_test_server(WebConfig::default()).await;
        let piece_hash = server.fixture.piece_hash(2);

        // The last piece is 7232 bytes; at 4 KiB/s everything past the first burst waits
        let started = std::time::Instant::now();
        let response = server
            .get(&format!("/piece/{piece_hash}"), &[(DOWNLOAD_RATE_HEADER, "4K")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, server.fixture.piece_data(2));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_bad_piece_hash_and_rate() {
        let server = create_test_server(WebConfig::default()).await;

        let response = server.get("/piece/not-a-hash", &[]).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = server
            .get("/album/a.bin", &[(DOWNLOAD_RATE_HEADER, "quickly")])
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.contains("quickly"));
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let server = create_test_server(WebConfig::default()).await;
        let request = Request::builder()
            .method("HEAD")
            .uri("/album/a.bin")
            .header(SOURCE_URL_HEADER, server.source_url())
            .header(RANGE, "bytes=0-99")
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-length"], "100");
        assert!(body_bytes(response).await.is_empty());
        server.services.shutdown().await;
    }
}
