use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::crypto::ring;
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{guess_mime, HeaderInjector, RemoteSource, SourceInfo, SourceInfoStorage};
use super::{EmptyHeaderInjector, NoSourceInfoStorage};
use crate::error::{BoxError, ProxyCacheError, Result};

// 等待响应头的超时时间（10秒）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_REDIRECTS: usize = 5;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Client for `http` and `https` upstreams, verifying certificates against
/// the platform's trust store.
pub fn http_client() -> Result<HttpClient> {
    let provider = Arc::new(ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_platform_verifier()?
        .with_no_client_auth();
    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// [`RemoteSource`] over HTTP(S) with range requests and manual redirects.
pub struct HttpSource {
    url: String,
    info: SourceInfo,
    client: HttpClient,
    storage: Arc<dyn SourceInfoStorage>,
    injector: Arc<dyn HeaderInjector>,
    max_redirects: usize,
    head_attempted: bool,
    body: Option<Incoming>,
    pending: Bytes,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self::with_collaborators(
            url,
            http_client()?,
            Arc::new(NoSourceInfoStorage),
            Arc::new(EmptyHeaderInjector),
        ))
    }

    pub fn with_collaborators(
        url: impl Into<String>,
        client: HttpClient,
        storage: Arc<dyn SourceInfoStorage>,
        injector: Arc<dyn HeaderInjector>,
    ) -> Self {
        let url = url.into();
        let info = storage.get(&url).unwrap_or_else(|| SourceInfo {
            mime: guess_mime(&url).map(str::to_owned),
            ..SourceInfo::new(url.clone())
        });
        Self {
            url,
            info,
            client,
            storage,
            injector,
            max_redirects: MAX_REDIRECTS,
            head_attempted: false,
            body: None,
            pending: Bytes::new(),
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn build_request(&self, method: &Method, url: &str, offset: u64) -> Result<Request<Empty<Bytes>>> {
        let extra = self
            .injector
            .add_headers(&self.url)
            .ok_or_else(|| ProxyCacheError::HeaderInjectorContract(self.url.clone()))?;

        let mut builder = Request::builder().method(method.clone()).uri(url);
        for (name, value) in &extra {
            // Range is ours to set
            if name.eq_ignore_ascii_case(RANGE.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        builder
            .body(Empty::new())
            .map_err(|e| self.open_error(offset, e))
    }

    /// Sends a request, following redirects from the last resolved url.
    async fn send(&self, method: Method, offset: u64) -> Result<(Response<Incoming>, String)> {
        let mut url = self.info.url.clone();
        let mut redirects = 0;
        loop {
            let request = self.build_request(&method, &url, offset)?;
            let response = timeout(REQUEST_TIMEOUT, self.client.request(request))
                .await
                .map_err(|_| ProxyCacheError::Timeout { url: url.clone() })?
                .map_err(|e| self.open_error(offset, e))?;

            let status = response.status();
            if !is_redirect(status) {
                debug!(url = %url, %method, offset, %status, "Source responded");
                return Ok((response, url));
            }

            redirects += 1;
            if redirects > self.max_redirects {
                return Err(ProxyCacheError::TooManyRedirects {
                    url: self.url.clone(),
                    max: self.max_redirects,
                });
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| self.open_error(offset, "redirect without location"))?;
            let next = url::Url::parse(&url)
                .and_then(|base| base.join(location))
                .map_err(|e| self.open_error(offset, e))?;
            debug!(from = %url, to = %next, "Following redirect");
            url = next.into();
        }
    }

    async fn fetch_content_info(&mut self) -> Result<()> {
        let (response, url) = self.send(Method::HEAD, 0).await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(ProxyCacheError::BadStatus {
                url: self.url.clone(),
                status,
            });
        }
        let headers = response.headers();
        self.info = SourceInfo {
            url,
            length: content_length(headers),
            mime: content_type(headers).or_else(|| guess_mime(&self.url).map(str::to_owned)),
        };
        debug!(url = %self.url, info = ?self.info, "Fetched source info");
        self.storage.put(&self.url, &self.info);
        Ok(())
    }

    /// Asks for length and mime with a HEAD request, once. Servers that refuse
    /// HEAD are tolerated: the GET issued by `open` supplies both instead.
    async fn request_content_info(&mut self) -> Result<()> {
        if self.head_attempted {
            return Ok(());
        }
        match self.fetch_content_info().await {
            Err(e @ ProxyCacheError::HeaderInjectorContract(_)) => return Err(e),
            Err(e) => {
                warn!(url = %self.url, error = %e, "HEAD request failed, waiting for GET headers");
            }
            Ok(()) => {}
        }
        self.head_attempted = true;
        Ok(())
    }

    fn open_error(&self, offset: u64, cause: impl Into<BoxError>) -> ProxyCacheError {
        ProxyCacheError::SourceOpen {
            url: self.url.clone(),
            offset,
            source: cause.into(),
        }
    }

    fn read_error(&self, cause: impl Into<BoxError>) -> ProxyCacheError {
        ProxyCacheError::SourceRead {
            url: self.url.clone(),
            source: cause.into(),
        }
    }
}

#[async_trait::async_trait]
impl RemoteSource for HttpSource {
    async fn open(&mut self, offset: u64) -> Result<()> {
        self.close().await;
        let (response, url) = self.send(Method::GET, offset).await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(ProxyCacheError::BadStatus {
                url: self.url.clone(),
                status,
            });
        }
        if offset > 0 && status == StatusCode::OK {
            warn!(url = %self.url, offset, "Server ignored range request");
            return Err(ProxyCacheError::RangeNotSupported {
                url: self.url.clone(),
                offset,
            });
        }

        let headers = response.headers();
        let body_length = content_length(headers);
        let length = if status == StatusCode::PARTIAL_CONTENT {
            content_range_total(headers).or(body_length.map(|l| l + offset))
        } else {
            body_length
        };
        self.info = SourceInfo {
            url,
            length: length.or(self.info.length),
            mime: content_type(headers).or_else(|| self.info.mime.take()),
        };
        self.storage.put(&self.url, &self.info);
        self.body = Some(response.into_body());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            let Some(body) = self.body.as_mut() else {
                return Err(self.read_error("source is not opened"));
            };
            match body.frame().await {
                None => return Ok(0),
                Some(Err(e)) => return Err(self.read_error(e)),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.pending = data;
                    }
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    async fn close(&mut self) {
        self.body = None;
        self.pending = Bytes::new();
    }

    async fn length(&mut self) -> Result<Option<u64>> {
        if self.info.length.is_none() {
            self.request_content_info().await?;
        }
        Ok(self.info.length)
    }

    async fn mime(&mut self) -> Result<Option<String>> {
        if self.info.mime.is_none() {
            self.request_content_info().await?;
        }
        Ok(self
            .info
            .mime
            .clone()
            .or_else(|| guess_mime(&self.url).map(str::to_owned)))
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn fork(&self) -> Box<dyn RemoteSource> {
        Box::new(HttpSource {
            url: self.url.clone(),
            info: self.info.clone(),
            client: self.client.clone(),
            storage: self.storage.clone(),
            injector: self.injector.clone(),
            max_redirects: self.max_redirects,
            head_attempted: self.head_attempted,
            body: None,
            pending: Bytes::new(),
        })
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Total length from `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
