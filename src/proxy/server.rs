use std::path::PathBuf;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::handle_request;
use super::ping::Pinger;
use super::registry::Registry;
use super::request::encode_url;
use super::PROXY_HOST;
use crate::config::{ProxyConfig, ProxyServerBuilder};
use crate::error::Result;
use crate::source::http_client;

/// Loopback HTTP proxy that caches what it streams.
pub struct ProxyServer {
    port: u16,
    registry: Arc<Registry>,
    pinger: Pinger,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn builder() -> ProxyServerBuilder {
        ProxyServerBuilder::new()
    }

    /// Binds `127.0.0.1:<port>` and starts accepting connections.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let listener = TcpListener::bind((PROXY_HOST, config.port)).await?;
        let port = listener.local_addr()?.port();
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let pinger = Pinger::new(port, config.system_proxy.clone());

        info!(
            port,
            cache = ?config.cache_root,
            max_connections = config.max_connections,
            "Proxy server started"
        );

        let registry = Registry::new(config, http_client()?);
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            semaphore,
            cancel.clone(),
        ));

        Ok(Self {
            port,
            registry,
            pinger,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ProxyConfig {
        self.registry.config()
    }

    /// Url a player should open for `url`: the cached file when complete,
    /// otherwise the proxy.
    pub async fn proxy_url(&self, url: &str) -> String {
        self.proxy_url_with(url, true).await
    }

    /// Like [`proxy_url`](Self::proxy_url); `allow_cached_file = false` always
    /// routes through the proxy. Falls back to `url` itself when the proxy is
    /// unreachable.
    pub async fn proxy_url_with(&self, url: &str, allow_cached_file: bool) -> String {
        if allow_cached_file {
            if let Some(file_url) = self.cached_file_url(url).await {
                return file_url;
            }
        }
        if self.is_alive().await {
            format!("http://{PROXY_HOST}:{}/{}", self.port, encode_url(url))
        } else {
            url.to_owned()
        }
    }

    async fn cached_file_url(&self, url: &str) -> Option<String> {
        let file = self.cache_file(url);
        let absolute = tokio::fs::canonicalize(&file).await.ok()?;
        // Reading counts as use for the LRU policy.
        self.config().disk_usage.touch(&file);
        url::Url::from_file_path(&absolute).ok().map(String::from)
    }

    /// Whether a complete cache file for `url` exists right now.
    pub async fn is_cached(&self, url: &str) -> bool {
        tokio::fs::try_exists(self.cache_file(url))
            .await
            .unwrap_or(false)
    }

    /// Path of the complete cache file for `url`, whether or not it exists.
    pub fn cache_file(&self, url: &str) -> PathBuf {
        self.config().cache_file(url)
    }

    /// Self-ping, through the system proxy when one applies.
    pub async fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && self.pinger.ping().await
    }

    /// Number of urls with a live engine.
    pub fn active_engines(&self) -> usize {
        self.registry.active_count()
    }

    /// Stops accepting, stops all fetches and waits for the listener to close.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(port = self.port, "Shutting down proxy server");
        self.cancel.cancel();
        self.registry.shutdown();
        self.config().source_info_storage.release();

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.registry.shutdown();
            self.config().source_info_storage.release();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let service = service_fn(move |req| handle_request(req, registry.clone()));
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                debug!(%remote, error = %e, "Connection closed with error");
            }
        });
    }
    debug!("Accept loop stopped");
}
