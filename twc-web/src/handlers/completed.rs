use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Response, StatusCode, Uri};

use super::body::RequestScope;
use super::content::build;
use super::source::request_source;
use crate::error::WebError;
use crate::server::AppState;

/// Returns the completed-piece record of the torrent named by the source
/// URL: concatenated 20-byte piece hashes, empty when nothing is committed.
///
/// # Errors
///
/// - `WebError::MissingSourceUrl` - If no source URL is configured or sent
/// - `WebError::Cache` - If the record cannot be loaded
pub async fn serve_completed_pieces(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response<Body>, WebError> {
    let source = request_source(&state.config, &headers, &uri)?;
    let scope = RequestScope::new();

    let completed = state
        .services
        .completed
        .get(&source.info_hash, scope.token())
        .await?;
    let bytes = completed.to_bytes();

    build(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, bytes.len()),
        Body::from(bytes),
    )
}
