//! Raw piece bytes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Response, StatusCode, Uri};
use tracing::debug;
use twc_core::PieceHash;
use twc_core::pieces::{PieceRequest, PieceWindow};
use twc_core::streaming::{RateLimiter, ReaderResolution, ReaderTarget, SourceUrl};

use super::body::{RequestScope, piece_body, reader_body};
use super::content::build;
use super::source::{download_rate, request_source};
use crate::error::WebError;
use crate::server::AppState;

/// Streams one whole piece of the torrent named by the source URL.
///
/// Once the torrent's metadata is published the piece is read like a file,
/// through the preload directory and with a known length. Before that it is
/// fetched straight through the source router.
///
/// # Errors
///
/// - `WebError::MissingSourceUrl` - If no source URL is configured or sent
/// - `WebError::InvalidDownloadRate` - If `X-Download-Rate` is malformed
/// - `WebError::Cache` - If the hash is malformed, not part of the torrent
///   or every source failed
pub async fn serve_piece(
    State(state): State<AppState>,
    Path(piece_hash): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response<Body>, WebError> {
    let source = request_source(&state.config, &headers, &uri)?;
    let piece_hash = PieceHash::from_hex(&piece_hash)?;
    let rate = download_rate(state.config.download_rate, &headers)?;
    let scope = RequestScope::new();

    let resolution = state
        .services
        .readers
        .open(&source, ReaderTarget::Piece(piece_hash), rate, scope.token())
        .await?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream");

    match resolution {
        ReaderResolution::Ready(opened) => {
            let reader = opened.reader;
            let length = reader.len();
            debug!("Serving piece {} ({} bytes)", piece_hash, length);
            let body = if length == 0 {
                Body::empty()
            } else {
                reader_body(reader, 0, length, scope)
            };
            build(response.header(CONTENT_LENGTH, length), body)
        }
        ReaderResolution::NotReady { .. } => {
            debug!("Torrent {} not ready, fetching piece {} directly", source.info_hash, piece_hash);
            serve_unlisted_piece(&state, &source, piece_hash, rate, scope, response).await
        }
    }
}

async fn serve_unlisted_piece(
    state: &AppState,
    source: &SourceUrl,
    piece_hash: PieceHash,
    rate: Option<u64>,
    scope: RequestScope,
    response: axum::http::response::Builder,
) -> Result<Response<Body>, WebError> {
    let request = PieceRequest {
        source: source.origin.clone(),
        info_hash: source.info_hash,
        piece_hash,
        query: source.query.clone(),
    };
    let stream = state
        .services
        .router
        .get(&request, PieceWindow::whole(), scope.token())
        .await?;

    let body = piece_body(
        stream,
        Arc::clone(&state.services.buffers),
        rate.map(RateLimiter::new),
        format!("piece {piece_hash}"),
        scope,
    );
    build(response, body)
}
