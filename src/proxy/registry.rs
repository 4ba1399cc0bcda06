use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::engine::ProxyCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyCacheError, Result};
use crate::source::{HttpClient, HttpSource};

/// Live engines keyed by source url.
///
/// An engine stays registered while a client holds a [`ClientLease`] on it or
/// its fetch is still running. Registered cache files are pinned so eviction
/// never deletes them underneath a reader.
pub(crate) struct Registry {
    config: ProxyConfig,
    client: HttpClient,
    engines: Mutex<HashMap<String, Arc<ProxyCache>>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(config: ProxyConfig, client: HttpClient) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            engines: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the engine for `url`, creating it on first use.
    pub fn acquire(self: &Arc<Self>, url: &str) -> Result<ClientLease> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyCacheError::Shutdown);
        }
        let engine = {
            let mut engines = self.engines.lock();
            let engine = engines
                .entry(url.to_owned())
                .or_insert_with(|| self.create(url))
                .clone();
            // Counted under the map lock so release_if_idle cannot race us.
            engine.add_client();
            engine
        };
        engine.retry_if_failed();
        Ok(ClientLease {
            engine,
            registry: self.clone(),
        })
    }

    fn create(self: &Arc<Self>, url: &str) -> Arc<ProxyCache> {
        let cache_file = self.config.cache_file(url);
        self.config.disk_usage.pin(&cache_file);
        let source = HttpSource::with_collaborators(
            url,
            self.client.clone(),
            self.config.source_info_storage.clone(),
            self.config.header_injector.clone(),
        );
        debug!(url, file = ?cache_file, "Creating engine");
        Arc::new(ProxyCache::new(
            url.to_owned(),
            cache_file,
            Box::new(source),
            self.config.disk_usage.clone(),
            Arc::downgrade(self),
        ))
    }

    /// Drops `engine` once it has no clients and no running fetch.
    pub fn release_if_idle(&self, engine: &Arc<ProxyCache>) {
        let mut engines = self.engines.lock();
        if engine.client_count() > 0 || engine.is_fetching() {
            return;
        }
        let registered = engines
            .get(engine.url())
            .is_some_and(|current| Arc::ptr_eq(current, engine));
        if registered {
            engines.remove(engine.url());
            self.config.disk_usage.unpin(engine.cache_file());
            debug!(url = engine.url(), "Released engine");
        }
    }

    /// Stops every engine and refuses new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let engines: Vec<_> = self.engines.lock().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.shutdown();
            self.config.disk_usage.unpin(engine.cache_file());
        }
    }

    pub fn active_count(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// A client's claim on an engine; dropping it may release the engine.
pub(crate) struct ClientLease {
    engine: Arc<ProxyCache>,
    registry: Arc<Registry>,
}

impl ClientLease {
    pub fn engine(&self) -> &Arc<ProxyCache> {
        &self.engine
    }
}

impl Deref for ClientLease {
    type Target = ProxyCache;

    fn deref(&self) -> &ProxyCache {
        &self.engine
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if self.engine.remove_client() == 0 {
            self.registry.release_if_idle(&self.engine);
        }
    }
}
