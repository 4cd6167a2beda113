//! HTTP playback: direct media, HLS, legacy x-mpegurl and PLS.
//!
//! ```text
//!  HttpPlaybackStream ── HttpSession ── dyn HttpTransport ── dyn HttpConnection
//!        │                   │                                (reqwest, fakes)
//!        │                   └─ redirects, origin reuse, connect retry
//!        └─ ContentKind ─► m3u8 / pls / xmpeg parsers ─► Playlist (variant, media)
//! ```
//!
//! The session keeps one connection per origin. A request to the same
//! scheme/host/port reuses it; a different origin replaces it.

pub mod content;
pub mod m3u8;
pub mod playback;
pub mod playlist;
pub mod pls;
pub mod session;
pub mod transport;
pub mod xmpeg;

pub use content::ContentKind;
pub use playback::HttpPlaybackStream;
pub use playlist::{Playlist, PlaylistEntry};
pub use session::HttpSession;
pub use transport::{HttpConnection, HttpTransport, Received, ResponseHead};

#[cfg(feature = "http-reqwest")]
pub use transport::ReqwestTransport;

use std::time::Duration;

/// Upper bound on redirect hops for one request.
pub const MAX_REDIRECTS: usize = 10;

/// Live playlist refreshes that may come back empty before the stream ends.
pub const MAX_LIVE_REFRESH_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Per-receive timeout once a response is flowing. A timeout reads as `Ok(0)`.
    pub recv_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    /// Connect attempts before giving up, while the stream is running.
    pub connect_retry_limit: u32,
    pub live_refresh_backoff: Duration,
    pub max_live_refresh_attempts: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            max_redirects: MAX_REDIRECTS,
            connect_retry_limit: 8,
            live_refresh_backoff: Duration::from_secs(1),
            max_live_refresh_attempts: MAX_LIVE_REFRESH_ATTEMPTS,
            user_agent: format!("murmur/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
