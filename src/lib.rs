//! Loopback HTTP proxy that lets a media player stream remote content while
//! the bytes are cached to disk for later playback.

pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;
pub mod source;

pub use config::{ProxyConfig, ProxyServerBuilder};
pub use error::{ProxyCacheError, Result};
pub use proxy::ProxyServer;
