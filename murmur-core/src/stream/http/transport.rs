//! The seam between the session logic and an actual HTTP client.
//!
//! A connection serves one origin and one response at a time. Issuing a new
//! `get` discards whatever is left of the previous body.

use url::Url;

use super::HttpConfig;
use crate::error::HttpError;

/// Status line and the headers the playback engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub location: Option<String>,
}

impl ResponseHead {
    pub fn ok(content_type: &str) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            ..Self::default()
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            location: Some(location.to_string()),
            ..Self::default()
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 305 | 307 | 308)
    }
}

/// Result of one body receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Data(usize),
    /// Receive timeout elapsed with nothing new.
    WouldBlock,
    /// Body complete.
    End,
}

pub trait HttpConnection: Send {
    fn get(&mut self, url: &Url) -> Result<ResponseHead, HttpError>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<Received, HttpError>;
}

pub trait HttpTransport: Send + Sync {
    /// Open a connection to `url`'s origin.
    fn connect(&self, url: &Url, config: &HttpConfig)
        -> Result<Box<dyn HttpConnection>, HttpError>;
}

#[cfg(feature = "http-reqwest")]
pub use self::reqwest_client::ReqwestTransport;

#[cfg(feature = "http-reqwest")]
mod reqwest_client {
    use std::io::Read;
    use std::time::Duration;

    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
    use reqwest::header::{HeaderName, CONTENT_TYPE, LOCATION};
    use tracing::debug;
    use url::Url;

    use super::{HttpConnection, HttpTransport, Received, ResponseHead};
    use crate::error::HttpError;
    use crate::stream::http::HttpConfig;

    const BODY_CHUNK: usize = 8 * 1024;
    const BODY_QUEUE: usize = 4;

    /// Blocking reqwest client with automatic redirects turned off, so the
    /// session sees every hop.
    pub struct ReqwestTransport {
        client: reqwest::blocking::Client,
    }

    impl ReqwestTransport {
        pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
            let client = reqwest::blocking::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .connect_timeout(config.connect_timeout)
                .timeout(None::<Duration>)
                .pool_max_idle_per_host(1)
                .user_agent(config.user_agent.as_str())
                .build()
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            Ok(Self { client })
        }
    }

    impl HttpTransport for ReqwestTransport {
        fn connect(
            &self,
            url: &Url,
            config: &HttpConfig,
        ) -> Result<Box<dyn HttpConnection>, HttpError> {
            Ok(Box::new(ReqwestConnection {
                client: self.client.clone(),
                origin: url.origin().ascii_serialization(),
                recv_timeout: config.recv_timeout,
                body: None,
            }))
        }
    }

    struct ReqwestConnection {
        client: reqwest::blocking::Client,
        origin: String,
        recv_timeout: Duration,
        body: Option<BodyPump>,
    }

    /// Reads the response body on its own thread so `recv` can time out.
    struct BodyPump {
        rx: Receiver<std::io::Result<Vec<u8>>>,
        pending: Vec<u8>,
        pos: usize,
    }

    impl BodyPump {
        fn spawn(mut response: reqwest::blocking::Response) -> Result<Self, HttpError> {
            let (tx, rx) = bounded(BODY_QUEUE);
            std::thread::Builder::new()
                .name("http-body".into())
                .spawn(move || loop {
                    let mut chunk = vec![0u8; BODY_CHUNK];
                    match response.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            chunk.truncate(n);
                            if tx.send(Ok(chunk)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                })
                .map_err(|e| HttpError::Transport(format!("body reader: {e}")))?;
            Ok(Self {
                rx,
                pending: Vec::new(),
                pos: 0,
            })
        }
    }

    impl HttpConnection for ReqwestConnection {
        fn get(&mut self, url: &Url) -> Result<ResponseHead, HttpError> {
            self.body = None;
            let response = self.client.get(url.clone()).send().map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    HttpError::Connect {
                        origin: self.origin.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;

            let header = |name: HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let head = ResponseHead {
                status: response.status().as_u16(),
                content_type: header(CONTENT_TYPE),
                content_length: response.content_length(),
                location: header(LOCATION),
            };
            debug!(url = %url, status = head.status, "response head");

            if head.status == 200 {
                self.body = Some(BodyPump::spawn(response)?);
            }
            Ok(head)
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<Received, HttpError> {
            let Some(body) = self.body.as_mut() else {
                return Ok(Received::End);
            };
            if body.pos >= body.pending.len() {
                match body.rx.recv_timeout(self.recv_timeout) {
                    Ok(Ok(chunk)) => {
                        body.pending = chunk;
                        body.pos = 0;
                    }
                    Ok(Err(e)) => {
                        self.body = None;
                        return Err(HttpError::Transport(e.to_string()));
                    }
                    Err(RecvTimeoutError::Timeout) => return Ok(Received::WouldBlock),
                    Err(RecvTimeoutError::Disconnected) => {
                        self.body = None;
                        return Ok(Received::End);
                    }
                }
            }
            let n = (body.pending.len() - body.pos).min(buf.len());
            buf[..n].copy_from_slice(&body.pending[body.pos..body.pos + n]);
            body.pos += n;
            Ok(Received::Data(n))
        }
    }
}
