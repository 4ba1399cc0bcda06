//! # Streaming cache engine
//!
//! One [`ProxyCache`] exists per resource while clients use it. It owns the
//! remote source and the disk cache, runs at most one background fetch that
//! appends into the cache, and lets any number of readers wait for bytes at
//! arbitrary offsets.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::Registry;
use crate::cache::{DiskCache, DiskUsage};
use crate::error::{ProxyCacheError, Result};
use crate::source::{guess_mime, RemoteSource};

const FETCH_BUFFER_SIZE: usize = 64 * 1024;
/// Readers re-check state at least this often even without a wake-up.
const READ_WAIT: Duration = Duration::from_secs(1);
/// Ranged requests further than this share of the length past the cached
/// bytes are streamed straight from the source.
const NO_CACHE_BARRIER: f64 = 0.2;

#[derive(Debug, Clone)]
enum FetchState {
    Idle,
    Fetching,
    Complete,
    Failed(Arc<ProxyCacheError>),
    Stopped,
}

/// Length and mime of the resource as far as they are known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentInfo {
    pub length: Option<u64>,
    pub mime: Option<String>,
}

pub struct ProxyCache {
    url: String,
    cache_file: PathBuf,
    disk_usage: Arc<dyn DiskUsage>,
    source: tokio::sync::Mutex<Box<dyn RemoteSource>>,
    cache: OnceCell<Arc<DiskCache>>,
    state: Mutex<FetchState>,
    info: Mutex<Option<ContentInfo>>,
    length: Mutex<Option<u64>>,
    opened: AtomicBool,
    notify: Notify,
    cancel: CancellationToken,
    clients: AtomicUsize,
    fetches: AtomicUsize,
    registry: Weak<Registry>,
}

impl ProxyCache {
    pub(crate) fn new(
        url: String,
        cache_file: PathBuf,
        source: Box<dyn RemoteSource>,
        disk_usage: Arc<dyn DiskUsage>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            url,
            cache_file,
            disk_usage,
            source: tokio::sync::Mutex::new(source),
            cache: OnceCell::new(),
            state: Mutex::new(FetchState::Idle),
            info: Mutex::new(None),
            length: Mutex::new(None),
            opened: AtomicBool::new(false),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            clients: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            registry,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the disk cache on first use.
    pub async fn disk_cache(&self) -> Result<&Arc<DiskCache>> {
        self.cache
            .get_or_try_init(|| async {
                let cache =
                    DiskCache::with_disk_usage(&self.cache_file, self.disk_usage.clone()).await?;
                if cache.completed_flag() {
                    let mut state = self.state.lock();
                    if matches!(*state, FetchState::Idle) {
                        *state = FetchState::Complete;
                    }
                }
                Ok(Arc::new(cache))
            })
            .await
    }

    /// Length and mime for response headers. Complete entries report the
    /// file length; otherwise the source is asked, which may send a HEAD request.
    /// When the source cannot tell the length up front, this waits for the
    /// fetch to open and takes the length from its response.
    pub async fn content_info(self: &Arc<Self>) -> Result<ContentInfo> {
        let cache = self.disk_cache().await?.clone();
        if let Some(info) = self.info.lock().clone() {
            return Ok(info);
        }

        let mut source = self.source.lock().await;
        let mut info = if cache.completed_flag() {
            let mime = match source.mime().await {
                Ok(mime) => mime,
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Error fetching mime of cached file");
                    guess_mime(&self.url).map(str::to_owned)
                }
            };
            ContentInfo {
                length: Some(cache.available()),
                mime,
            }
        } else {
            ContentInfo {
                length: source.length().await?,
                mime: source.mime().await?,
            }
        };
        drop(source);

        if !cache.completed_flag() {
            match info.length {
                Some(length) => self.remember_length(Some(length)),
                None => info.length = self.wait_for_open(&cache).await?,
            }
        }

        *self.info.lock() = Some(info.clone());
        Ok(info)
    }

    /// Starts the fetch if needed and waits until its source is open.
    async fn wait_for_open(self: &Arc<Self>, cache: &Arc<DiskCache>) -> Result<Option<u64>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.opened.load(Ordering::Acquire) {
                return Ok(self.known_length());
            }
            let state = self.state.lock().clone();
            match state {
                FetchState::Failed(e) => return Err(ProxyCacheError::Fetch(e)),
                FetchState::Stopped => return Err(ProxyCacheError::Shutdown),
                FetchState::Complete => return Ok(Some(cache.available())),
                FetchState::Idle => self.start_fetch(cache.clone()),
                FetchState::Fetching => {}
            }

            let _ = timeout(READ_WAIT, notified).await;
        }
    }

    /// Reads up to `max` bytes at `offset`, waiting for the fetch to get
    /// there. An empty result means end of stream.
    pub async fn read(self: &Arc<Self>, offset: u64, max: usize) -> Result<Bytes> {
        let cache = self.disk_cache().await?.clone();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = cache.available();
            // A partial file longer than the resource is refetched from scratch.
            let oversized = !cache.completed_flag()
                && self.known_length().is_some_and(|l| available > l);
            if offset < available && !oversized {
                let len = (available - offset).min(max as u64) as usize;
                return cache.read_at(offset, len).await;
            }
            if cache.completed_flag() || self.known_length().is_some_and(|l| offset >= l) {
                return Ok(Bytes::new());
            }

            let state = self.state.lock().clone();
            match state {
                FetchState::Failed(e) => return Err(ProxyCacheError::Fetch(e)),
                FetchState::Stopped => return Err(ProxyCacheError::Shutdown),
                FetchState::Complete => return Ok(Bytes::new()),
                FetchState::Idle => self.start_fetch(cache.clone()),
                FetchState::Fetching => {}
            }

            let _ = timeout(READ_WAIT, notified).await;
        }
    }

    /// Whether a ranged read at `offset` should skip the cache.
    pub async fn should_bypass(&self, offset: u64) -> Result<bool> {
        let cache = self.disk_cache().await?;
        if cache.completed_flag() {
            return Ok(false);
        }
        let Some(length) = self.known_length() else {
            return Ok(false);
        };
        let barrier = cache.available() as f64 + length as f64 * NO_CACHE_BARRIER;
        Ok(offset as f64 > barrier)
    }

    /// A new source opened at `offset`, independent of the background fetch.
    pub async fn open_direct(&self, offset: u64) -> Result<Box<dyn RemoteSource>> {
        let mut source = self.source.lock().await.fork();
        source.open(offset).await?;
        Ok(source)
    }

    /// Clears a recorded failure so the next read starts a new fetch.
    pub fn retry_if_failed(&self) {
        let mut state = self.state.lock();
        if matches!(*state, FetchState::Failed(_)) {
            debug!(url = %self.url, "Resetting failed fetch");
            *state = FetchState::Idle;
        }
    }

    /// Stops the fetch at its next await point and fails waiting readers.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, FetchState::Complete) {
                *state = FetchState::Stopped;
            }
        }
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_fetching(&self) -> bool {
        matches!(*self.state.lock(), FetchState::Fetching)
    }

    /// Number of background fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    pub(crate) fn add_client(&self) {
        self.clients.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_client(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn cache_file(&self) -> &PathBuf {
        &self.cache_file
    }

    fn known_length(&self) -> Option<u64> {
        *self.length.lock()
    }

    fn start_fetch(self: &Arc<Self>, cache: Arc<DiskCache>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, FetchState::Idle) {
                return;
            }
            *state = FetchState::Fetching;
        }
        self.opened.store(false, Ordering::Release);
        self.fetches.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(self.clone().run_fetch(cache));
    }

    async fn run_fetch(self: Arc<Self>, cache: Arc<DiskCache>) {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyCacheError::Shutdown),
            result = self.fetch(&cache) => result,
        };
        self.source.lock().await.close().await;

        {
            let mut state = self.state.lock();
            *state = match outcome {
                Ok(()) => FetchState::Complete,
                Err(ProxyCacheError::Shutdown) => FetchState::Stopped,
                Err(e) => {
                    error!(url = %self.url, error = %e, "Fetch failed");
                    FetchState::Failed(Arc::new(e))
                }
            };
        }
        self.notify.notify_waiters();

        if let Some(registry) = self.registry.upgrade() {
            registry.release_if_idle(&self);
        }
    }

    async fn fetch(&self, cache: &DiskCache) -> Result<()> {
        let mut offset = cache.available();
        let mut source = self.source.lock().await;
        if offset > 0 {
            let length = source.length().await?;
            match length {
                Some(length) if offset == length => {
                    drop(source);
                    debug!(url = %self.url, offset, "Partial file already holds everything");
                    return cache.complete().await;
                }
                Some(length) if offset > length => {
                    warn!(url = %self.url, offset, length, "Partial file exceeds the resource length");
                    cache.truncate().await?;
                    offset = 0;
                }
                _ => {}
            }
        }

        source.open(offset).await?;
        let length = match source.length().await {
            Ok(length) => length,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Length unknown, reading to end of stream");
                None
            }
        };
        drop(source);
        self.remember_length(length);
        self.opened.store(true, Ordering::Release);
        self.notify.notify_waiters();
        info!(url = %self.url, offset, ?length, "Fetching into cache");

        let mut buf = vec![0u8; FETCH_BUFFER_SIZE];
        loop {
            let n = self.source.lock().await.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cache.append(&buf[..n]).await?;
            self.notify.notify_waiters();
        }

        let received = cache.available();
        if let Some(expected) = length.filter(|&l| l != received) {
            return Err(ProxyCacheError::IncompleteSource {
                url: self.url.clone(),
                expected,
                received,
            });
        }
        cache.complete().await?;
        info!(url = %self.url, size = received, "Cached");
        Ok(())
    }

    fn remember_length(&self, length: Option<u64>) {
        if length.is_some() {
            *self.length.lock() = length;
        }
    }
}
