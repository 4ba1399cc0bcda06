//! In-process origin server used by the integration tests.
//!
//! Routes:
//! - `/data/<name>`: a deterministic blob served as `image/jpeg` with range support
//! - `/redirect/<n>/<name>`: `n` chained 302s ending at `/data/<name>`
//! - `/norange/<name>`: the blob, always `200`, ignoring `Range`
//! - `/slow/<name>`: the blob in small chunks with a delay between them
//! - `/nohead/<name>`: the blob for GET, `405` for HEAD

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const DATA_LEN: usize = 20_000;
pub const DATA_MIME: &str = "image/jpeg";
const SLOW_CHUNK: usize = 2_000;
const SLOW_DELAY: Duration = Duration::from_millis(20);

type OriginBody = UnsyncBoxBody<Bytes, Infallible>;

pub fn data() -> Vec<u8> {
    (0..DATA_LEN).map(|i| ((i * 31 + i / 256) % 251) as u8).collect()
}

#[derive(Default)]
struct Stats {
    gets: AtomicUsize,
    heads: AtomicUsize,
    requests: Mutex<Vec<(Method, String, HeaderMap)>>,
}

pub struct Origin {
    addr: SocketAddr,
    stats: Arc<Stats>,
    cancel: CancellationToken,
}

impl Origin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let cancel = CancellationToken::new();

        let loop_stats = stats.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => continue,
                    },
                };
                let stats = loop_stats.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| serve(req, stats.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            stats,
            cancel,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn gets(&self) -> usize {
        self.stats.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.stats.heads.load(Ordering::SeqCst)
    }

    /// `Range` headers of GET requests, in arrival order.
    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.stats
            .requests
            .lock()
            .iter()
            .filter(|(method, _, _)| *method == Method::GET)
            .map(|(_, _, headers)| {
                headers
                    .get(RANGE)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_owned)
            })
            .collect()
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.stats
            .requests
            .lock()
            .last()
            .map(|(_, _, headers)| headers.clone())
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    req: Request<Incoming>,
    stats: Arc<Stats>,
) -> Result<Response<OriginBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    match method {
        Method::GET => stats.gets.fetch_add(1, Ordering::SeqCst),
        Method::HEAD => stats.heads.fetch_add(1, Ordering::SeqCst),
        _ => 0,
    };
    stats
        .requests
        .lock()
        .push((method.clone(), path.clone(), req.headers().clone()));

    let range = req
        .headers()
        .get(RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());
    let head_only = method == Method::HEAD;

    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let response = match (segments.next(), segments.next(), segments.next()) {
        (Some("data"), Some(_), None) => blob(range, head_only, false),
        (Some("norange"), Some(_), None) => blob(None, head_only, false),
        (Some("slow"), Some(_), None) => blob(range, head_only, true),
        (Some("nohead"), Some(_), None) if head_only => status(StatusCode::METHOD_NOT_ALLOWED),
        (Some("nohead"), Some(_), None) => blob(range, false, false),
        (Some("redirect"), Some(n), Some(rest)) => match n.parse::<usize>() {
            Ok(0) => redirect(&format!("/data/{rest}")),
            Ok(n) => redirect(&format!("/redirect/{}/{rest}", n - 1)),
            Err(_) => status(StatusCode::BAD_REQUEST),
        },
        _ => status(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

fn blob(offset: Option<usize>, head_only: bool, slow: bool) -> Response<OriginBody> {
    let start = offset.unwrap_or(0);
    if start >= DATA_LEN && offset.is_some() {
        return status(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    let content = Bytes::from(data()).slice(start..);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(DATA_MIME));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content.len()));
    let status_code = if offset.is_some() {
        let range = format!("bytes {start}-{}/{DATA_LEN}", DATA_LEN - 1);
        headers.insert(CONTENT_RANGE, HeaderValue::from_str(&range).unwrap());
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let body = if head_only {
        Empty::new().boxed_unsync()
    } else if slow {
        let chunks = stream::unfold(content, |mut rest| async move {
            if rest.is_empty() {
                return None;
            }
            tokio::time::sleep(SLOW_DELAY).await;
            let chunk = rest.split_to(rest.len().min(SLOW_CHUNK));
            Some((Ok::<_, Infallible>(Frame::data(chunk)), rest))
        });
        StreamBody::new(chunks).boxed_unsync()
    } else {
        Full::new(content).boxed_unsync()
    };

    let mut response = Response::new(body);
    *response.status_mut() = status_code;
    *response.headers_mut() = headers;
    response
}

fn redirect(location: &str) -> Response<OriginBody> {
    let mut response = status(StatusCode::FOUND);
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_str(location).unwrap());
    response
}

fn status(code: StatusCode) -> Response<OriginBody> {
    let mut response = Response::new(Empty::new().boxed_unsync());
    *response.status_mut() = code;
    response
}

/// Response of a plain client request.
pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub async fn fetch(method: Method, url: &str, range: Option<&str>) -> Fetched {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let mut request = Request::builder().method(method).uri(url);
    if let Some(range) = range {
        request = request.header(RANGE, range);
    }
    let response = client
        .request(request.body(Empty::new()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Fetched {
        status,
        headers,
        body: body.to_vec(),
    }
}

pub async fn get(url: &str) -> Fetched {
    fetch(Method::GET, url, None).await
}

pub async fn get_range(url: &str, range: &str) -> Fetched {
    fetch(Method::GET, url, Some(range)).await
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
