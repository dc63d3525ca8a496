//! Mapping of pipeline failures onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};
use twc_core::{CacheError, TorrentError};

/// Failures of a single request.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("No source url: configure a default or send X-Source-Url")]
    MissingSourceUrl,

    #[error("Invalid download rate {value:?}: {reason}")]
    InvalidDownloadRate { value: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to build response: {reason}")]
    Response { reason: String },
}

impl From<TorrentError> for WebError {
    fn from(error: TorrentError) -> Self {
        WebError::Cache(CacheError::Torrent(error))
    }
}

impl WebError {
    /// Every failure is answered with 500; only the body tells them apart.
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Whether the request itself was at fault rather than the cache.
    pub fn is_user_error(&self) -> bool {
        match self {
            WebError::InvalidDownloadRate { .. } => true,
            WebError::Cache(error) => error.is_user_error(),
            WebError::MissingSourceUrl | WebError::Response { .. } => false,
        }
    }

    /// Body text sent to the client.
    pub fn user_message(&self) -> String {
        match self {
            WebError::Cache(error) => error.user_message(),
            WebError::Response { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            WebError::Cache(CacheError::Cancelled) => debug!("Request cancelled"),
            _ if self.is_user_error() => debug!("Rejected request: {}", self),
            _ => error!("Request failed: {}", self),
        }
        (status, self.user_message()).into_response()
    }
}
