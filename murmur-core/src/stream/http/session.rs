//! One logical HTTP client for a playback stream: redirect following,
//! per-origin connection reuse and connect retry.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::{Origin, Url};

use super::transport::{HttpConnection, HttpTransport, Received, ResponseHead};
use super::HttpConfig;
use crate::error::{HttpError, PlaylistError};

const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const RECV_CHUNK: usize = 4096;

struct Live {
    origin: Origin,
    conn: Box<dyn HttpConnection>,
}

/// A fully read body, possibly cut at the caller's limit.
#[derive(Debug)]
pub struct Body {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

pub struct HttpSession {
    transport: Arc<dyn HttpTransport>,
    config: HttpConfig,
    running: Arc<AtomicBool>,
    live: Option<Live>,
    url: Option<Url>,
    connects: u64,
}

impl HttpSession {
    /// `running` is the owning stream's flag; clearing it cancels connects
    /// and backoff sleeps.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: HttpConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            config,
            running,
            live: None,
            url: None,
            connects: 0,
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Final URL of the last successful request, after redirects.
    pub fn current_url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Connections opened over the session's lifetime.
    pub fn connection_count(&self) -> u64 {
        self.connects
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// GET `url`, which may be relative to the current URL.
    pub fn open(&mut self, url: &str) -> Result<ResponseHead, HttpError> {
        let parsed = match &self.url {
            Some(current) => current.join(url),
            None => Url::parse(url),
        }
        .map_err(|e| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.open_url(parsed)
    }

    /// GET `url`, following redirects until a 200. Any failure drops the
    /// connection.
    pub fn open_url(&mut self, url: Url) -> Result<ResponseHead, HttpError> {
        let result = self.follow(url);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn follow(&mut self, mut target: Url) -> Result<ResponseHead, HttpError> {
        let mut hops = 0usize;
        loop {
            let head = self.request(&target)?;
            if head.is_redirect() {
                let location = head
                    .location
                    .as_deref()
                    .ok_or(HttpError::MissingLocation {
                        status: head.status,
                    })?;
                let next = target.join(location).map_err(|e| HttpError::InvalidUrl {
                    url: location.to_string(),
                    reason: e.to_string(),
                })?;
                hops += 1;
                if hops > self.config.max_redirects {
                    warn!(limit = self.config.max_redirects, url = %target, "redirect limit hit");
                    return Err(HttpError::TooManyRedirects {
                        limit: self.config.max_redirects,
                    });
                }
                info!(status = head.status, from = %target, to = %next, "following redirect");
                target = next;
                continue;
            }
            if head.status != 200 {
                warn!(status = head.status, url = %target, "unexpected status");
                return Err(HttpError::Status {
                    status: head.status,
                    url: target.to_string(),
                });
            }
            self.url = Some(target);
            return Ok(head);
        }
    }

    /// One GET on the connection for `url`'s origin, retrying connect
    /// failures with backoff while the stream runs.
    fn request(&mut self, url: &Url) -> Result<ResponseHead, HttpError> {
        let mut attempts = 0u32;
        let mut backoff = BACKOFF_START;
        loop {
            if !self.is_running() {
                return Err(HttpError::Cancelled);
            }
            let outcome = self.connection_for(url).and_then(|conn| conn.get(url));
            match outcome {
                Err(HttpError::Connect { origin, reason }) => {
                    self.live = None;
                    attempts += 1;
                    if attempts >= self.config.connect_retry_limit {
                        warn!(%origin, attempts, "giving up connecting: {reason}");
                        return Err(HttpError::Connect { origin, reason });
                    }
                    debug!(%origin, attempts, ?backoff, "connect failed, retrying: {reason}");
                    if !self.sleep_while_running(backoff) {
                        return Err(HttpError::Cancelled);
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                other => return other,
            }
        }
    }

    fn connection_for(&mut self, url: &Url) -> Result<&mut Box<dyn HttpConnection>, HttpError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "only http and https are supported".into(),
            });
        }
        let origin = url.origin();
        let reuse = matches!(&self.live, Some(live) if live.origin == origin);
        if !reuse {
            if let Some(old) = self.live.take() {
                debug!(
                    from = %old.origin.ascii_serialization(),
                    to = %origin.ascii_serialization(),
                    "origin changed, replacing connection"
                );
            }
            let conn = self.transport.connect(url, &self.config)?;
            self.connects += 1;
            info!(origin = %origin.ascii_serialization(), "connection opened");
            self.live = Some(Live { origin, conn });
        }
        match self.live.as_mut() {
            Some(live) => Ok(&mut live.conn),
            None => Err(HttpError::Transport("connection unavailable".into())),
        }
    }

    /// Receive body bytes of the current response.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Received, HttpError> {
        let Some(live) = self.live.as_mut() else {
            return Err(HttpError::Transport("no open response".into()));
        };
        let result = live.conn.recv(buf);
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Read the rest of the current body, up to `limit` bytes.
    pub fn read_body(&mut self, limit: usize) -> Result<Body, HttpError> {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; RECV_CHUNK];
        let mut idle = Duration::ZERO;
        loop {
            let room = (limit + 1).saturating_sub(bytes.len()).min(RECV_CHUNK);
            if room == 0 {
                break;
            }
            match self.recv(&mut chunk[..room])? {
                Received::Data(n) => {
                    idle = Duration::ZERO;
                    bytes.extend_from_slice(&chunk[..n]);
                }
                Received::WouldBlock => {
                    if !self.is_running() {
                        return Err(HttpError::Cancelled);
                    }
                    idle += self.config.recv_timeout;
                    if idle >= self.config.connect_timeout {
                        self.close();
                        return Err(HttpError::Transport("body stalled".into()));
                    }
                }
                Received::End => break,
            }
        }
        let truncated = bytes.len() > limit;
        bytes.truncate(limit);
        Ok(Body { bytes, truncated })
    }

    /// Read a playlist body, rejecting anything above `limit`.
    pub fn read_playlist(&mut self, limit: usize) -> Result<Vec<u8>, HttpError> {
        let body = self.read_body(limit)?;
        if body.truncated {
            self.close();
            return Err(PlaylistError::TooLarge { limit }.into());
        }
        Ok(body.bytes)
    }

    pub fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(origin = %live.origin.ascii_serialization(), "connection closed");
        }
    }

    /// Sleep up to `total`, waking early if the stream stops. Returns
    /// whether the stream is still running.
    pub fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
