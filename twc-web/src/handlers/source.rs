//! Per-request inputs carried in headers: the source URL and download rate.

use axum::http::{HeaderMap, Uri};
use twc_core::CacheError;
use twc_core::config::WebConfig;
use twc_core::streaming::{SourceUrl, parse_byte_size};
use url::Url;

use crate::error::WebError;

pub const SOURCE_URL_HEADER: &str = "x-source-url";
pub const DOWNLOAD_RATE_HEADER: &str = "x-download-rate";

/// Builds the absolute source URL of a request.
///
/// The configured source URL wins over the `X-Source-Url` header. The
/// request path is appended to the base path and the request query is
/// merged into the base query.
///
/// # Errors
///
/// - `WebError::MissingSourceUrl` - If neither a default nor a header is present
/// - `CacheError::InvalidSourceUrl` - If the base is not an absolute URL
pub fn resolve_source_url(
    configured: Option<&str>,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<String, WebError> {
    let base = configured
        .filter(|value| !value.is_empty())
        .or_else(|| {
            headers
                .get(SOURCE_URL_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
        })
        .ok_or(WebError::MissingSourceUrl)?;

    let mut url = Url::parse(base).map_err(|e| CacheError::InvalidSourceUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;

    let suffix = uri.path().trim_start_matches('/');
    if !suffix.is_empty() {
        let path = if url.path().ends_with('/') {
            format!("{}{}", url.path(), suffix)
        } else {
            format!("{}/{}", url.path(), suffix)
        };
        url.set_path(&path);
    }

    if let Some(extra) = uri.query().filter(|query| !query.is_empty()) {
        let query = match url.query().filter(|query| !query.is_empty()) {
            Some(existing) => format!("{existing}&{extra}"),
            None => extra.to_string(),
        };
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

/// Resolves and parses the source URL of a request.
///
/// # Errors
///
/// Same as [`resolve_source_url`], plus `CacheError::InvalidSourceUrl` if the
/// result does not name a torrent.
pub fn request_source(config: &WebConfig, headers: &HeaderMap, uri: &Uri) -> Result<SourceUrl, WebError> {
    let url = resolve_source_url(config.source_url.as_deref(), headers, uri)?;
    Ok(SourceUrl::parse(&url)?)
}

/// Response byte rate of a request.
///
/// The `X-Download-Rate` header wins over the configured default.
///
/// # Errors
///
/// - `WebError::InvalidDownloadRate` - If the header is not a byte size
pub fn download_rate(configured: Option<u64>, headers: &HeaderMap) -> Result<Option<u64>, WebError> {
    let Some(value) = headers.get(DOWNLOAD_RATE_HEADER) else {
        return Ok(configured);
    };
    let value = value.to_str().map_err(|e| WebError::InvalidDownloadRate {
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        reason: e.to_string(),
    })?;
    if value.trim().is_empty() {
        return Ok(configured);
    }
    parse_byte_size(value)
        .map(Some)
        .map_err(|e| WebError::InvalidDownloadRate {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_header_source_url_gets_request_path() {
        let headers = headers_with(SOURCE_URL_HEADER, &format!("http://seed.test/{HASH}/"));
        let uri: Uri = "/album/b.bin".parse().unwrap();

        let url = resolve_source_url(None, &headers, &uri).unwrap();
        assert_eq!(url, format!("http://seed.test/{HASH}/album/b.bin"));
    }

    #[test]
    fn test_configured_source_url_wins() {
        let headers = headers_with(SOURCE_URL_HEADER, "http://ignored.test/x/");
        let uri: Uri = "/a.bin?token=1".parse().unwrap();
        let configured = format!("http://seed.test:9000/{HASH}?user=7");

        let url = resolve_source_url(Some(&configured), &headers, &uri).unwrap();
        assert_eq!(url, format!("http://seed.test:9000/{HASH}/a.bin?user=7&token=1"));
    }

    #[test]
    fn test_missing_and_invalid_source_url() {
        let uri: Uri = "/a.bin".parse().unwrap();
        assert!(matches!(
            resolve_source_url(None, &HeaderMap::new(), &uri),
            Err(WebError::MissingSourceUrl)
        ));
        assert!(matches!(
            resolve_source_url(Some("not a url"), &HeaderMap::new(), &uri),
            Err(WebError::Cache(CacheError::InvalidSourceUrl { .. }))
        ));
    }

    #[test]
    fn test_request_source_parses_torrent() {
        let config = WebConfig {
            source_url: Some(format!("http://seed.test/{HASH}/")),
            ..WebConfig::default()
        };
        let uri: Uri = "/My%20Album/01.flac".parse().unwrap();

        let source = request_source(&config, &HeaderMap::new(), &uri).unwrap();
        assert_eq!(source.info_hash.to_hex(), HASH);
        assert_eq!(source.path, "My Album/01.flac");
        assert_eq!(source.origin, "http://seed.test");
    }

    #[test]
    fn test_download_rate_header_wins() {
        assert_eq!(download_rate(Some(10), &HeaderMap::new()).unwrap(), Some(10));
        assert_eq!(download_rate(None, &HeaderMap::new()).unwrap(), None);

        let headers = headers_with(DOWNLOAD_RATE_HEADER, "2K");
        assert_eq!(download_rate(Some(10), &headers).unwrap(), Some(2048));

        let headers = headers_with(DOWNLOAD_RATE_HEADER, "fast");
        assert!(matches!(
            download_rate(None, &headers),
            Err(WebError::InvalidDownloadRate { .. })
        ));
    }
}
