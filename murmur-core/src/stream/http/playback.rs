//! `HttpPlaybackStream`: the reader backend that turns a URL into audio
//! bytes.
//!
//! `init` connects and classifies the response. Direct media is announced
//! with `CustomData` and streamed as is. For a playlist, variants are tried
//! in order until one resolves to media the listener accepts. `read` then
//! drains the current response and moves through the media playlist,
//! refreshing it while it is live.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use super::content::ContentKind;
use super::m3u8::{self, DEFAULT_PLAYLIST_LEN};
use super::playlist::Playlist;
use super::session::HttpSession;
use super::transport::{HttpTransport, Received, ResponseHead};
use super::{pls, xmpeg, HttpConfig};
use crate::error::{HttpError, PlaylistError, StreamError};
use crate::stream::{CustomData, StreamContext, StreamEvent, StreamIo, StreamMarker};

pub struct HttpPlaybackStream {
    transport: Arc<dyn HttpTransport>,
    config: HttpConfig,
    url: String,
    offset_in_ms: u64,
    session: Option<HttpSession>,
    variants: Option<Playlist>,
    media: Option<Playlist>,
    kind: ContentKind,
    markers: VecDeque<StreamMarker>,
    empty_refreshes: u32,
}

impl HttpPlaybackStream {
    pub fn new(transport: Arc<dyn HttpTransport>, config: HttpConfig, url: impl Into<String>) -> Self {
        Self {
            transport,
            config,
            url: url.into(),
            offset_in_ms: 0,
            session: None,
            variants: None,
            media: None,
            kind: ContentKind::Unknown,
            markers: VecDeque::new(),
            empty_refreshes: 0,
        }
    }

    /// Stream `url` with the blocking reqwest client.
    #[cfg(feature = "http-reqwest")]
    pub fn with_reqwest(config: HttpConfig, url: impl Into<String>) -> Result<Self, HttpError> {
        let transport = Arc::new(super::ReqwestTransport::new(&config)?);
        Ok(Self::new(transport, config, url))
    }

    /// Start playback this far into the media playlist.
    pub fn with_offset_ms(mut self, offset_in_ms: u64) -> Self {
        self.offset_in_ms = offset_in_ms;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Kind of the media being played, once `init` succeeded.
    pub fn content_kind(&self) -> ContentKind {
        self.kind
    }

    fn session(&mut self) -> Result<&mut HttpSession, HttpError> {
        self.session
            .as_mut()
            .ok_or_else(|| HttpError::Transport("session not open".into()))
    }

    /// Connect, classify, and settle on the media to play.
    fn open(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        self.markers.clear();
        self.empty_refreshes = 0;
        let mut session = HttpSession::new(
            Arc::clone(&self.transport),
            self.config.clone(),
            ctx.running_flag(),
        );
        let head = session.open(&self.url)?;
        let url = session
            .current_url()
            .cloned()
            .ok_or_else(|| HttpError::Transport("no url after open".into()))?;
        self.session = Some(session);
        let kind = ContentKind::classify(head.content_type.as_deref(), &url);
        info!(stream = ctx.name(), url = %url, kind = kind.as_str(), "http source opened");

        if kind.is_playlist() {
            self.variants = Some(self.fetch_playlist(kind, &head, &url)?);
            return self.play_variants(ctx);
        }

        self.kind = kind;
        let offset = self.offset_in_ms;
        if let Err(e) = self.announce(ctx, offset) {
            warn!(url = %url, kind = kind.as_str(), "direct url rejected: {e}");
            return Err(StreamError::EventRejected(e.to_string()));
        }
        Ok(())
    }

    /// Offer the current media to the listener. `Err` means rejected.
    fn announce(&mut self, ctx: &StreamContext, offset_in_ms: u64) -> Result<(), StreamError> {
        let data = CustomData {
            content_type: self.kind.as_str().to_string(),
            offset_in_ms,
        };
        ctx.emit(&StreamEvent::CustomData(data.clone()))?;
        self.markers.push_back(StreamMarker::Content(data));
        Ok(())
    }

    /// Resolve variants until one is accepted.
    fn play_variants(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        loop {
            let Some(offset) = self.connect_next_variant()? else {
                self.session = None;
                return Err(HttpError::NoPlayableVariant.into());
            };
            if !self.kind.is_media() {
                debug!(kind = self.kind.as_str(), "variant did not resolve to media, trying next");
                continue;
            }
            match self.announce(ctx, offset) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(kind = self.kind.as_str(), "variant rejected: {e}");
                }
            }
        }
    }

    /// Take the next variant and open its first media segment. Returns the
    /// residual seek offset, or `None` once variants are exhausted. A
    /// variant that cannot be resolved leaves `kind` as `Unknown`.
    fn connect_next_variant(&mut self) -> Result<Option<u64>, StreamError> {
        self.media = None;
        self.kind = ContentKind::Unknown;
        let Some(entry) = self.variants.as_mut().and_then(Playlist::next_entry) else {
            return Ok(None);
        };

        let head = match self.session()?.open_url(entry.uri.clone()) {
            Ok(head) => head,
            Err(HttpError::Cancelled) => return Err(HttpError::Cancelled.into()),
            Err(e) => {
                warn!(uri = %entry.uri, "variant unreachable: {e}");
                return Ok(Some(0));
            }
        };
        let url = self.current_url(&entry.uri);
        let kind = ContentKind::classify(head.content_type.as_deref(), &url);

        if !kind.is_playlist() {
            // The "variant" list was already a list of media segments.
            info!(kind = kind.as_str(), "variant list holds media, playing it as the media list");
            self.kind = kind;
            self.media = self.variants.take();
            return Ok(Some(self.offset_in_ms));
        }

        let mut media = match self.fetch_playlist(kind, &head, &url) {
            Ok(media) => media,
            Err(StreamError::Http(HttpError::Cancelled)) => return Err(HttpError::Cancelled.into()),
            Err(e) => {
                warn!(uri = %url, "media playlist unusable: {e}");
                return Ok(Some(0));
            }
        };
        info!(uri = %url, segments = media.remaining(), "resolved variant stream");
        let offset = media.skip_offset(self.offset_in_ms);

        let Some(segment) = media.next_entry() else {
            return Ok(Some(0));
        };
        let head = match self.session()?.open_url(segment.uri.clone()) {
            Ok(head) => head,
            Err(HttpError::Cancelled) => return Err(HttpError::Cancelled.into()),
            Err(e) => {
                warn!(uri = %segment.uri, "first segment unreachable: {e}");
                return Ok(Some(0));
            }
        };
        let seg_url = self.current_url(&segment.uri);
        self.kind = ContentKind::classify(head.content_type.as_deref(), &seg_url);
        self.media = Some(media);
        Ok(Some(offset))
    }

    fn current_url(&self, fallback: &Url) -> Url {
        self.session
            .as_ref()
            .and_then(HttpSession::current_url)
            .cloned()
            .unwrap_or_else(|| fallback.clone())
    }

    /// Parse the body of the response just opened.
    fn fetch_playlist(
        &mut self,
        kind: ContentKind,
        head: &ResponseHead,
        url: &Url,
    ) -> Result<Playlist, StreamError> {
        let limit = head
            .content_length
            .filter(|len| *len > 0)
            .map_or(DEFAULT_PLAYLIST_LEN, |len| len as usize);
        let session = self.session()?;
        let playlist = match kind {
            ContentKind::Pls => {
                let body = session.read_playlist(limit)?;
                let text = std::str::from_utf8(&body)
                    .map_err(|_| HttpError::Playlist(PlaylistError::Encoding))?;
                pls::parse(text, url).map_err(HttpError::from)?
            }
            ContentKind::AppleM3u8 => {
                let body = session.read_body(limit)?;
                if body.truncated {
                    warn!(limit, "m3u8 body cut at limit, playlist may end early");
                }
                let text = String::from_utf8_lossy(&body.bytes);
                m3u8::parse(&text, url).map_err(HttpError::from)?
            }
            ContentKind::LegacyM3u8 => {
                let body = session.read_body(limit.max(xmpeg::MAX_XMPEG_BODY))?;
                let text = String::from_utf8_lossy(&body.bytes);
                if m3u8::is_extended(&text) {
                    m3u8::parse(&text, url).map_err(HttpError::from)?
                } else if body.truncated {
                    return Err(HttpError::from(PlaylistError::TooLarge {
                        limit: xmpeg::MAX_XMPEG_BODY,
                    })
                    .into());
                } else {
                    xmpeg::parse(&body.bytes, url).map_err(HttpError::from)?
                }
            }
            other => return Err(HttpError::UnsupportedContent(other.as_str().into()).into()),
        };
        Ok(playlist)
    }

    /// Current response is done: move to the next media segment.
    fn next_segment(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        loop {
            let Some(media) = self.media.as_mut() else {
                return Err(StreamError::EndOfStream);
            };
            let complete = media.is_complete();
            match media.next_entry() {
                Some(entry) => {
                    self.empty_refreshes = 0;
                    debug!(uri = %entry.uri, "next segment");
                    if entry.discontinuity {
                        self.markers.push_back(StreamMarker::Discontinuity);
                    }
                    self.session()?.open_url(entry.uri)?;
                    match self.session()?.recv(buf)? {
                        Received::Data(n) => return Ok(n),
                        Received::WouldBlock => return Ok(0),
                        Received::End => continue,
                    }
                }
                None if complete => {
                    info!("playlist finished");
                    return Err(StreamError::EndOfStream);
                }
                None => {
                    if self.refresh_live()? > 0 {
                        continue;
                    }
                    self.empty_refreshes += 1;
                    if self.empty_refreshes > self.config.max_live_refresh_attempts {
                        warn!(attempts = self.empty_refreshes, "live playlist stopped growing");
                        return Err(StreamError::EndOfStream);
                    }
                    let backoff = self.config.live_refresh_backoff;
                    self.session()?.sleep_while_running(backoff);
                    return Ok(0);
                }
            }
        }
    }

    /// Re-fetch the live media playlist. Returns how many segments were new.
    fn refresh_live(&mut self) -> Result<usize, StreamError> {
        let Some(source) = self.media.as_ref().map(|m| m.source().clone()) else {
            return Ok(0);
        };
        let head = self.session()?.open_url(source.clone())?;
        let url = self.current_url(&source);
        let kind = ContentKind::classify(head.content_type.as_deref(), &url);
        let fresh = self.fetch_playlist(kind, &head, &url)?;
        let added = match self.media.as_mut() {
            Some(media) => media.merge(fresh),
            None => 0,
        };
        debug!(added, "live playlist refreshed");
        Ok(added)
    }
}

impl StreamIo for HttpPlaybackStream {
    fn init(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        let opened = self.open(ctx);
        if opened.is_err() {
            self.cleanup();
        }
        opened
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self.session()?.recv(buf)? {
            Received::Data(n) => Ok(n),
            Received::WouldBlock => Ok(0),
            Received::End => self.next_segment(buf),
        }
    }

    fn cleanup(&mut self) {
        self.session = None;
        self.variants = None;
        self.media = None;
        self.markers.clear();
        self.kind = ContentKind::Unknown;
    }

    fn take_marker(&mut self) -> Option<StreamMarker> {
        self.markers.pop_front()
    }
}

