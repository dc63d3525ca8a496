//! File contents of a torrent, honoring Range requests.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, Method, Response, StatusCode, Uri};
use tracing::debug;
use twc_core::streaming::{OpenedReader, ReaderResolution, ReaderTarget};

use super::body::{RequestScope, reader_body};
use super::range::{RangeSelection, content_range, select_range, unsatisfied_range};
use super::source::{download_rate, request_source};
use crate::error::WebError;
use crate::server::AppState;

/// Serves the file named by the request's source URL.
///
/// Answers `302` to the source URL while the torrent's metadata is not
/// published, `416` for ranges outside the file, `206` for satisfiable
/// ranges and `200` otherwise.
///
/// # Errors
///
/// - `WebError::MissingSourceUrl` - If no source URL is configured or sent
/// - `WebError::InvalidDownloadRate` - If `X-Download-Rate` is malformed
/// - `WebError::Cache` - If the torrent or file cannot be resolved
pub async fn serve_content(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response<Body>, WebError> {
    let source = request_source(&state.config, &headers, &uri)?;
    let rate = download_rate(state.config.download_rate, &headers)?;
    let scope = RequestScope::new();

    let resolution = state
        .services
        .readers
        .open(&source, ReaderTarget::File, rate, scope.token())
        .await?;
    let OpenedReader { reader, session } = match resolution {
        ReaderResolution::NotReady { redirect } => return redirect_to(&redirect),
        ReaderResolution::Ready(opened) => *opened,
    };

    let total_size = reader.len();
    let selection = select_range(&headers, total_size);
    let content_type = mime_guess::from_path(reader.name()).first_or_octet_stream();
    debug!(
        "Serving {} ({} bytes) {:?} session={}",
        reader.name(),
        total_size,
        selection,
        session
    );

    let response = Response::builder()
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_TYPE, content_type.as_ref());

    let response = match selection {
        RangeSelection::Unsatisfiable => {
            return build(
                response
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(CONTENT_RANGE, unsatisfied_range(total_size)),
                Body::empty(),
            );
        }
        RangeSelection::Partial { start, end } => response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, content_range(start, end, total_size)),
        RangeSelection::Full => response.status(StatusCode::OK),
    };

    let (start, length) = selection.bounds(total_size);
    let response = response.header(CONTENT_LENGTH, length);
    if method == Method::HEAD || length == 0 {
        return build(response, Body::empty());
    }
    build(response, reader_body(reader, start, length, scope))
}

/// `302 Found` pointing at `location`.
pub(crate) fn redirect_to(location: &str) -> Result<Response<Body>, WebError> {
    debug!("Redirecting to {}", location);
    build(
        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, location),
        Body::empty(),
    )
}

pub(crate) fn build(
    response: axum::http::response::Builder,
    body: Body,
) -> Result<Response<Body>, WebError> {
    response.body(body).map_err(|e| WebError::Response {
        reason: e.to_string(),
    })
}
