//! Self-ping used to decide whether handing out proxy urls makes sense.
//!
//! Local clients may be configured to send plain HTTP through a system-wide
//! proxy. If that proxy cannot reach our loopback listener, a proxy url would
//! be broken, so the server falls back to the original url instead.

use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::{PING_PATH, PING_RESPONSE, PROXY_HOST};
use crate::error::BoxError;

const MAX_PING_ATTEMPTS: u32 = 3;
const INITIAL_PING_TIMEOUT: Duration = Duration::from_millis(70);
const MAX_PING_RESPONSE: usize = 4096;

/// An HTTP forward proxy plus the hosts that bypass it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProxy {
    host: String,
    port: u16,
    no_proxy: Vec<String>,
}

impl SystemProxy {
    /// Parses `http://host:port`; a bare `host:port` is accepted too.
    pub fn parse(proxy: &str) -> Option<Self> {
        let proxy = proxy.trim();
        let with_scheme = if proxy.contains("://") {
            proxy.to_owned()
        } else {
            format!("http://{proxy}")
        };
        let url = url::Url::parse(&with_scheme).ok()?;
        Some(Self {
            host: url.host_str()?.to_owned(),
            port: url.port_or_known_default()?,
            no_proxy: Vec::new(),
        })
    }

    /// Reads `http_proxy`/`HTTP_PROXY` and `no_proxy`/`NO_PROXY`.
    pub fn from_env() -> Option<Self> {
        let proxy = env_any(&["http_proxy", "HTTP_PROXY"])?;
        let proxy = Self::parse(&proxy)?;
        Some(match env_any(&["no_proxy", "NO_PROXY"]) {
            Some(list) => proxy.with_no_proxy(&list),
            None => proxy,
        })
    }

    /// Adds comma separated bypass entries (`localhost`, `.example.com`, `*`).
    pub fn with_no_proxy(mut self, list: &str) -> Self {
        self.no_proxy.extend(
            list.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty()),
        );
        self
    }

    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.no_proxy.iter().any(|entry| {
            let entry = entry.trim_start_matches('.');
            entry == "*" || host == entry || host.ends_with(&format!(".{entry}"))
        })
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone)]
pub(crate) struct Pinger {
    port: u16,
    proxy: Option<SystemProxy>,
}

impl Pinger {
    pub fn new(port: u16, proxy: Option<SystemProxy>) -> Self {
        Self { port, proxy }
    }

    /// Pings the listener a few times with growing timeouts.
    pub async fn ping(&self) -> bool {
        let mut wait = INITIAL_PING_TIMEOUT;
        for attempt in 1..=MAX_PING_ATTEMPTS {
            match timeout(wait, self.ping_once()).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => warn!(attempt, "Unexpected ping response"),
                Ok(Err(e)) => debug!(attempt, error = %e, "Ping failed"),
                Err(_) => debug!(attempt, ?wait, "Ping timed out"),
            }
            wait *= 2;
        }
        error!(
            port = self.port,
            proxy = ?self.proxy,
            "Proxy is not reachable through the current network settings"
        );
        false
    }

    async fn ping_once(&self) -> Result<bool, BoxError> {
        let authority = format!("{PROXY_HOST}:{}", self.port);
        let via = self
            .proxy
            .as_ref()
            .filter(|p| !p.bypasses(PROXY_HOST) && !p.bypasses("localhost"));
        // A forward proxy needs the absolute-form target.
        let (stream, target) = match via {
            Some(proxy) => (
                TcpStream::connect(proxy.address()).await?,
                format!("http://{authority}{PING_PATH}"),
            ),
            None => (
                TcpStream::connect((PROXY_HOST, self.port)).await?,
                PING_PATH.to_owned(),
            ),
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Ping connection closed with error");
            }
        });

        let request = Request::get(target)
            .header(HOST, authority)
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;
        if response.status() != StatusCode::OK {
            return Ok(false);
        }
        let body = Limited::new(response.into_body(), MAX_PING_RESPONSE)
            .collect()
            .await?
            .to_bytes();
        Ok(body == PING_RESPONSE.as_bytes())
    }
}
