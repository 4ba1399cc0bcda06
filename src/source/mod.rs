//! Remote byte sources and the collaborators they consult on every open.

mod headers;
mod http_source;
mod storage;

pub use self::headers::*;
pub use self::http_source::*;
pub use self::storage::*;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What is known about a resource without downloading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Url after following redirects.
    pub url: String,
    pub length: Option<u64>,
    pub mime: Option<String>,
}

impl SourceInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            length: None,
            mime: None,
        }
    }
}

/// Sequential byte source that can be reopened at any offset.
#[async_trait::async_trait]
pub trait RemoteSource: Send {
    /// Starts a transfer at `offset`; any previous transfer is dropped.
    async fn open(&mut self, offset: u64) -> Result<()>;

    /// Reads the next chunk into `buf`, returning 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self);

    /// Total length, asking the remote end if it is not known yet.
    /// `None` when the remote end does not report one.
    async fn length(&mut self) -> Result<Option<u64>>;

    async fn mime(&mut self) -> Result<Option<String>>;

    /// The identifier this source was created for.
    fn url(&self) -> &str;

    /// A fresh, unopened source for the same resource sharing this one's
    /// collaborators and known info.
    fn fork(&self) -> Box<dyn RemoteSource>;
}

/// Mime type implied by the url's extension, if it is a common media type.
pub fn guess_mime(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        "flv" => "video/x-flv",
        "m3u8" => "application/vnd.apple.mpegurl",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => return None,
    };
    Some(mime)
}
