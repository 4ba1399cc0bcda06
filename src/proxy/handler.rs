use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tracing::{debug, info, warn};

use super::registry::{ClientLease, Registry};
use super::request::{parse_request, response_head};
use super::{CHUNK_SIZE, PING_PATH, PING_RESPONSE};
use crate::error::{ProxyCacheError, Result};
use crate::source::RemoteSource;

pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, ProxyCacheError>;

pub(crate) async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<Registry>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if req.uri().path() == PING_PATH {
        return Ok(text_response(StatusCode::OK, PING_RESPONSE));
    }
    // Only the head matters; the body of GET/HEAD is ignored.
    let req = req.map(|_| ());
    let response = match serve(&req, &registry).await {
        Ok(response) => response,
        Err(e) => {
            warn!(uri = %req.uri(), error = %e, "Request failed");
            text_response(e.status_code(), &e.to_string())
        }
    };
    Ok(response)
}

async fn serve(req: &Request<()>, registry: &Arc<Registry>) -> Result<Response<ProxyBody>> {
    let request = parse_request(req)?;
    let lease = registry.acquire(&request.url)?;
    let info = lease.engine().content_info().await?;
    let head = response_head(request.range, info.length, info.mime.as_deref());
    info!(
        url = %request.url,
        method = %req.method(),
        range = ?request.range,
        status = %head.status,
        "Serving"
    );

    let body = if request.head_only || !head.has_body() {
        empty_body()
    } else if request.range.is_some() && lease.should_bypass(head.offset).await? {
        debug!(url = %request.url, offset = head.offset, "Far seek, streaming from source");
        let source = lease.open_direct(head.offset).await?;
        direct_body(source, head.offset, head.end)
    } else {
        cached_body(lease, head.offset, head.end)
    };

    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    Ok(response)
}

/// Streams `[offset, end)` out of the engine, waiting for the fetch as needed.
fn cached_body(lease: ClientLease, offset: u64, end: Option<u64>) -> ProxyBody {
    let chunks = stream::try_unfold((lease, offset), move |(lease, offset)| async move {
        let Some(max) = chunk_len(offset, end) else {
            return Ok(None);
        };
        let chunk = lease.engine().read(offset, max).await?;
        if chunk.is_empty() {
            return Ok(None);
        }
        let next = offset + chunk.len() as u64;
        Ok::<_, ProxyCacheError>(Some((Frame::data(chunk), (lease, next))))
    });
    StreamBody::new(chunks.inspect_err(log_body_error)).boxed_unsync()
}

/// Streams straight from an opened source; the cache is not involved.
fn direct_body(source: Box<dyn RemoteSource>, offset: u64, end: Option<u64>) -> ProxyBody {
    let chunks = stream::try_unfold((source, offset), move |(mut source, offset)| async move {
        let Some(max) = chunk_len(offset, end) else {
            source.close().await;
            return Ok(None);
        };
        let mut buf = vec![0u8; max];
        let n = source.read(&mut buf).await?;
        if n == 0 {
            source.close().await;
            return Ok(None);
        }
        buf.truncate(n);
        let next = offset + n as u64;
        Ok::<_, ProxyCacheError>(Some((Frame::data(Bytes::from(buf)), (source, next))))
    });
    StreamBody::new(chunks.inspect_err(log_body_error)).boxed_unsync()
}

fn chunk_len(offset: u64, end: Option<u64>) -> Option<usize> {
    match end {
        Some(end) if offset >= end => None,
        Some(end) => Some((end - offset).min(CHUNK_SIZE as u64) as usize),
        None => Some(CHUNK_SIZE),
    }
}

fn log_body_error(e: &ProxyCacheError) {
    warn!(error = %e, "Aborting response body");
}

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let body = Bytes::copy_from_slice(text.as_bytes());
    let length = HeaderValue::from(body.len());
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, length);
    response
}
