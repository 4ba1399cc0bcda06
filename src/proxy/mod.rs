mod engine;
mod handler;
mod ping;
mod registry;
mod request;
mod server;

pub use engine::{ContentInfo, ProxyCache};
pub use ping::SystemProxy;
pub use request::{
    decode_url, encode_url, parse_range, parse_request, response_head, ByteRange, ProxyRequest,
    ResponseHead,
};
pub use server::ProxyServer;

/// Largest body chunk handed to hyper per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const PROXY_HOST: &str = "127.0.0.1";
pub const PING_PATH: &str = "/ping";
pub const PING_RESPONSE: &str = "ping ok";
