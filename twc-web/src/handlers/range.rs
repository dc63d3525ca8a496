//! HTTP Range request handling
//!
//! Implements the single-range subset of RFC 7233 used by media players:
//! `bytes=a-b`, `bytes=a-` and `bytes=-n`.

use axum::http::HeaderMap;
use axum::http::header::RANGE;

/// How much of a resource a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSelection {
    /// No usable Range header; serve everything with `200`.
    Full,
    /// Inclusive byte range to serve with `206`.
    Partial { start: u64, end: u64 },
    /// The range lies outside the resource; answer `416`.
    Unsatisfiable,
}

impl RangeSelection {
    /// First byte and byte count to copy for a resource of `total_size`.
    pub fn bounds(&self, total_size: u64) -> (u64, u64) {
        match *self {
            RangeSelection::Full => (0, total_size),
            RangeSelection::Partial { start, end } => (start, end - start + 1),
            RangeSelection::Unsatisfiable => (0, 0),
        }
    }
}

/// Parse a Range header value against a resource of `total_size` bytes.
///
/// Malformed headers, other units and multi-range requests are ignored and
/// yield [`RangeSelection::Full`].
///
/// # Examples
/// ```
/// use twc_web::handlers::range::{RangeSelection, parse_range_header};
/// assert_eq!(
///     parse_range_header("bytes=100-199", 1000),
///     RangeSelection::Partial { start: 100, end: 199 }
/// );
/// ```
pub fn parse_range_header(range: &str, total_size: u64) -> RangeSelection {
    let Some(range_spec) = range.trim().strip_prefix("bytes=") else {
        return RangeSelection::Full;
    };
    if range_spec.contains(',') {
        return RangeSelection::Full;
    }
    let Some((start_str, end_str)) = range_spec.split_once('-') else {
        return RangeSelection::Full;
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // Suffix range: the last n bytes
        let Ok(suffix) = end_str.parse::<u64>() else {
            return RangeSelection::Full;
        };
        if suffix == 0 || total_size == 0 {
            return RangeSelection::Unsatisfiable;
        }
        return RangeSelection::Partial {
            start: total_size.saturating_sub(suffix),
            end: total_size - 1,
        };
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeSelection::Full;
    };
    let end = if end_str.is_empty() {
        u64::MAX
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return RangeSelection::Full,
        }
    };

    if start >= total_size {
        return RangeSelection::Unsatisfiable;
    }
    RangeSelection::Partial {
        start,
        end: end.min(total_size - 1),
    }
}

/// Range selection of a request for a resource of `total_size` bytes.
pub fn select_range(headers: &HeaderMap, total_size: u64) -> RangeSelection {
    headers
        .get(RANGE)
        .and_then(|range| range.to_str().ok())
        .map(|range| parse_range_header(range, total_size))
        .unwrap_or(RangeSelection::Full)
}

/// `Content-Range` value of a partial response.
pub fn content_range(start: u64, end: u64, total_size: u64) -> String {
    format!("bytes {start}-{end}/{total_size}")
}

/// `Content-Range` value of a `416` response.
pub fn unsatisfied_range(total_size: u64) -> String {
    format!("bytes */{total_size}")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_parse_range_header_valid() {
        assert_eq!(
            parse_range_header("bytes=100-199", 1000),
            RangeSelection::Partial { start: 100, end: 199 }
        );
    }

    #[test]
    fn test_parse_range_header_open_end() {
        let selection = parse_range_header("bytes=500-", 1000);
        assert_eq!(selection, RangeSelection::Partial { start: 500, end: 999 });
        assert_eq!(selection.bounds(1000), (500, 500));
    }

    #[test]
    fn test_parse_range_header_suffix() {
        assert_eq!(
            parse_range_header("bytes=-100", 1000),
            RangeSelection::Partial { start: 900, end: 999 }
        );
        // Longer than the resource means all of it
        assert_eq!(
            parse_range_header("bytes=-5000", 1000),
            RangeSelection::Partial { start: 0, end: 999 }
        );
        assert_eq!(
            parse_range_header("bytes=-0", 1000),
            RangeSelection::Unsatisfiable
        );
    }

    #[test]
    fn test_parse_range_header_clamps_end() {
        assert_eq!(
            parse_range_header("bytes=100-999", 500),
            RangeSelection::Partial { start: 100, end: 499 }
        );
    }

    #[test]
    fn test_parse_range_header_unsatisfiable() {
        assert_eq!(
            parse_range_header("bytes=500-599", 400),
            RangeSelection::Unsatisfiable
        );
        assert_eq!(parse_range_header("bytes=0-", 0), RangeSelection::Unsatisfiable);
    }

    #[test]
    fn test_parse_range_header_invalid() {
        for header in ["invalid", "items=0-1", "bytes=abc", "bytes=5-1", "bytes=0-1,5-9"] {
            assert_eq!(parse_range_header(header, 1000), RangeSelection::Full, "{header}");
        }
        assert_eq!(RangeSelection::Full.bounds(1000), (0, 1000));
    }

    #[test]
    fn test_select_range_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(select_range(&headers, 10), RangeSelection::Full);

        headers.insert(RANGE, HeaderValue::from_static("bytes=2-3"));
        assert_eq!(
            select_range(&headers, 10),
            RangeSelection::Partial { start: 2, end: 3 }
        );
        assert_eq!(content_range(2, 3, 10), "bytes 2-3/10");
        assert_eq!(unsatisfied_range(10), "bytes */10");
    }
}
