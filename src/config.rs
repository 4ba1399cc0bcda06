use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{
    DiskUsage, DiskUsageLimits, FileNameGenerator, LruDiskUsage, Sha256FileNameGenerator,
    UnlimitedDiskUsage, CACHE_DIR,
};
use crate::error::Result;
use crate::proxy::{ProxyServer, SystemProxy};
use crate::source::{
    EmptyHeaderInjector, HeaderInjector, MemorySourceInfoStorage, SourceInfoStorage,
};

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Everything a [`ProxyServer`] needs; assembled by [`ProxyServerBuilder`].
#[derive(Clone)]
pub struct ProxyConfig {
    pub cache_root: PathBuf,
    pub port: u16,
    pub max_connections: usize,
    pub file_name_generator: Arc<dyn FileNameGenerator>,
    pub header_injector: Arc<dyn HeaderInjector>,
    pub source_info_storage: Arc<dyn SourceInfoStorage>,
    pub disk_usage: Arc<dyn DiskUsage>,
    pub system_proxy: Option<SystemProxy>,
}

impl ProxyConfig {
    /// Path of the complete cache file for `url`.
    pub fn cache_file(&self, url: &str) -> PathBuf {
        self.cache_root.join(self.file_name_generator.generate(url))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(CACHE_DIR),
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            file_name_generator: Arc::new(Sha256FileNameGenerator),
            header_injector: Arc::new(EmptyHeaderInjector),
            source_info_storage: Arc::new(MemorySourceInfoStorage::new()),
            disk_usage: Arc::new(UnlimitedDiskUsage),
            system_proxy: SystemProxy::from_env(),
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("cache_root", &self.cache_root)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("system_proxy", &self.system_proxy)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    limits: DiskUsageLimits,
    custom_disk_usage: Option<Arc<dyn DiskUsage>>,
}

impl ProxyServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_root = dir.into();
        self
    }

    /// Bounds the total size of complete cache files, in bytes.
    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.limits.max_size = Some(bytes);
        self
    }

    pub fn max_cache_files_count(mut self, count: usize) -> Self {
        self.limits.max_count = Some(count);
        self
    }

    /// Replaces the built-in LRU policy; size and count bounds are ignored.
    pub fn disk_usage(mut self, disk_usage: Arc<dyn DiskUsage>) -> Self {
        self.custom_disk_usage = Some(disk_usage);
        self
    }

    pub fn file_name_generator(mut self, generator: Arc<dyn FileNameGenerator>) -> Self {
        self.config.file_name_generator = generator;
        self
    }

    pub fn header_injector(mut self, injector: Arc<dyn HeaderInjector>) -> Self {
        self.config.header_injector = injector;
        self
    }

    pub fn source_info_storage(mut self, storage: Arc<dyn SourceInfoStorage>) -> Self {
        self.config.source_info_storage = storage;
        self
    }

    /// Listening port; 0 picks an ephemeral one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections.max(1);
        self
    }

    /// HTTP proxy that local clients go through, used by the self-ping.
    pub fn system_proxy(mut self, proxy: SystemProxy) -> Self {
        self.config.system_proxy = Some(proxy);
        self
    }

    pub fn no_system_proxy(mut self) -> Self {
        self.config.system_proxy = None;
        self
    }

    /// Final configuration without starting anything.
    pub fn into_config(self) -> ProxyConfig {
        let mut config = self.config;
        config.disk_usage = match self.custom_disk_usage {
            Some(custom) => custom,
            None if self.limits == DiskUsageLimits::default() => Arc::new(UnlimitedDiskUsage),
            None => Arc::new(LruDiskUsage::new(self.limits)),
        };
        config
    }

    /// Binds the listener and starts serving.
    pub async fn build(self) -> Result<ProxyServer> {
        ProxyServer::start(self.into_config()).await
    }
}
