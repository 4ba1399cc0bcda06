use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use http::StatusCode;

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type Result<T> = std::result::Result<T, ProxyCacheError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyCacheError {
    #[error("error opening {url} at offset {offset}: {source}")]
    SourceOpen {
        url: String,
        offset: u64,
        #[source]
        source: BoxError,
    },

    #[error("error reading {url}: {source}")]
    SourceRead {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("too many redirects ({max}) for {url}")]
    TooManyRedirects { url: String, max: usize },

    #[error("{url} answered with status {status}")]
    BadStatus { url: String, status: StatusCode },

    #[error("{url} ignored range request at offset {offset}")]
    RangeNotSupported { url: String, offset: u64 },

    #[error("timed out waiting for {url}")]
    Timeout { url: String },

    #[error("stream {url} ended after {received} of {expected} bytes")]
    IncompleteSource {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("cache {0} is completed, append is not allowed")]
    AppendAfterComplete(PathBuf),

    #[error("read of {length} bytes at {offset} is out of cached range (available {available})")]
    ReadOutOfBounds {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("cache {0} is already completed")]
    AlreadyCompleted(PathBuf),

    #[error("header injector returned no headers for {0}")]
    HeaderInjectorContract(String),

    #[error("fetch failed: {0}")]
    Fetch(Arc<ProxyCacheError>),

    #[error("proxy is shut down")]
    Shutdown,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyCacheError {
    /// Whether a fresh attempt (new client connection) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyCacheError::SourceOpen { .. }
            | ProxyCacheError::SourceRead { .. }
            | ProxyCacheError::BadStatus { .. }
            | ProxyCacheError::Timeout { .. }
            | ProxyCacheError::IncompleteSource { .. } => true,
            ProxyCacheError::Fetch(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Status reported to a proxy client when a response can still be built.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyCacheError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyCacheError::SourceOpen { .. }
            | ProxyCacheError::SourceRead { .. }
            | ProxyCacheError::TooManyRedirects { .. }
            | ProxyCacheError::BadStatus { .. }
            | ProxyCacheError::RangeNotSupported { .. }
            | ProxyCacheError::IncompleteSource { .. } => StatusCode::BAD_GATEWAY,
            ProxyCacheError::Fetch(inner) => inner.status_code(),
            ProxyCacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyCacheError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
