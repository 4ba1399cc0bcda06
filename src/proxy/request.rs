//! Parsing of proxy requests and the response head computed for them.

use http::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http::{HeaderMap, Method, Request, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::error::{ProxyCacheError, Result};

/// `Range: bytes=start-[end]`, `end` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub url: String,
    pub range: Option<ByteRange>,
    pub head_only: bool,
}

pub fn encode_url(url: &str) -> String {
    utf8_percent_encode(url, NON_ALPHANUMERIC).to_string()
}

/// Inverse of [`encode_url`]; `+` is read as a space for form-encoded input.
pub fn decode_url(encoded: &str) -> Result<String> {
    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| ProxyCacheError::InvalidRequest(format!("bad url encoding: {e}")))
}

pub fn parse_request<B>(req: &Request<B>) -> Result<ProxyRequest> {
    let head_only = match *req.method() {
        Method::GET => false,
        Method::HEAD => true,
        ref other => {
            return Err(ProxyCacheError::InvalidRequest(format!(
                "unsupported method {other}"
            )))
        }
    };
    let path = req.uri().path().trim_start_matches('/');
    if path.is_empty() {
        return Err(ProxyCacheError::InvalidRequest("missing url".into()));
    }
    let url = decode_url(path)?;
    let range = req
        .headers()
        .get(RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_range);
    Ok(ProxyRequest {
        url,
        range,
        head_only,
    })
}

/// Single `bytes=` range with an explicit start. Suffix and multi ranges are
/// not supported and yield `None`, i.e. a full response.
pub fn parse_range(value: &str) -> Option<ByteRange> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().ok()?),
    };
    if end.is_some_and(|end| end < start) {
        return None;
    }
    Some(ByteRange { start, end })
}

/// Status and headers of a proxy response plus the byte window to stream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub offset: u64,
    /// Exclusive end of the body, when bounded.
    pub end: Option<u64>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn has_body(&self) -> bool {
        self.status != StatusCode::RANGE_NOT_SATISFIABLE
    }
}

pub fn response_head(
    range: Option<ByteRange>,
    length: Option<u64>,
    mime: Option<&str>,
) -> ResponseHead {
    let partial = range.is_some();
    let offset = range.map_or(0, |r| r.start);
    let requested_end = range.and_then(|r| r.end).map(|e| e.saturating_add(1));
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(length) = length {
        if partial && offset >= length && !(offset == 0 && length == 0) {
            headers.insert(CONTENT_RANGE, header_value(format!("bytes */{length}")));
            return ResponseHead {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                offset,
                end: Some(offset),
                headers,
            };
        }
    }

    let end = match (requested_end, length) {
        (Some(e), Some(l)) => Some(e.min(l)),
        (e, l) => e.or(l),
    };
    if let Some(end) = end {
        headers.insert(CONTENT_LENGTH, header_value((end - offset).to_string()));
    }
    if let Some(mime) = mime.filter(|m| !m.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(mime) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if partial {
        if let Some(end) = end.filter(|&e| e > offset) {
            let total = length.map_or_else(|| "*".to_owned(), |l| l.to_string());
            headers.insert(
                CONTENT_RANGE,
                header_value(format!("bytes {offset}-{}/{total}", end - 1)),
            );
        }
    }

    ResponseHead {
        status: if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        },
        offset,
        end,
        headers,
    }
}

fn header_value(value: String) -> HeaderValue {
    // Only digits, spaces, '-', '/' and '*' end up here.
    HeaderValue::try_from(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}
