use std::collections::{HashMap, VecDeque};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;

use murmur_core::error::{HttpError, StreamError};
use murmur_core::stream::http::{
    HttpConfig, HttpConnection, HttpPlaybackStream, HttpSession, HttpTransport, Received,
    ResponseHead,
};
use murmur_core::stream::{
    AudioStream, CustomData, MemorySink, StreamEvent, StreamMarker, StreamOptions, StreamState,
};
use parking_lot::Mutex;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Reply {
    head: ResponseHead,
    body: Vec<u8>,
}

impl Reply {
    fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            head: ResponseHead::ok(content_type),
            body: body.into(),
        }
    }

    fn redirect(status: u16, location: &str) -> Self {
        Self {
            head: ResponseHead::redirect(status, location),
            body: Vec::new(),
        }
    }
}

/// In-memory web: each URL serves its replies in order, repeating the last.
#[derive(Default)]
struct FakeWeb {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    failing_connects: Mutex<HashMap<String, u32>>,
    connect_attempts: Mutex<Vec<String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeWeb {
    fn route(self: Arc<Self>, url: &str, replies: Vec<Reply>) -> Arc<Self> {
        self.routes.lock().insert(url.to_string(), replies.into());
        self
    }

    fn fail_connects(&self, origin: &str, times: u32) {
        self.failing_connects.lock().insert(origin.to_string(), times);
    }

    fn reply_for(&self, url: &Url) -> Reply {
        self.requests.lock().push(url.to_string());
        let mut routes = self.routes.lock();
        match routes.get_mut(url.as_str()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_found),
            Some(queue) => queue.front().cloned().unwrap_or_else(not_found),
            None => not_found(),
        }
    }

    fn connects(&self) -> usize {
        self.connect_attempts.lock().len()
    }

    fn requested(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == url).count()
    }
}

fn not_found() -> Reply {
    Reply {
        head: ResponseHead {
            status: 404,
            ..ResponseHead::default()
        },
        body: Vec::new(),
    }
}

struct FakeTransport(Arc<FakeWeb>);

fn transport(web: &Arc<FakeWeb>) -> Arc<dyn HttpTransport> {
    Arc::new(FakeTransport(Arc::clone(web)))
}

impl HttpTransport for FakeTransport {
    fn connect(&self, url: &Url, _config: &HttpConfig) -> Result<Box<dyn HttpConnection>, HttpError> {
        let origin = url.origin().ascii_serialization();
        self.0.connect_attempts.lock().push(origin.clone());
        if let Some(left) = self.0.failing_connects.lock().get_mut(&origin) {
            if *left > 0 {
                *left -= 1;
                return Err(HttpError::Connect {
                    origin,
                    reason: "connection refused".into(),
                });
            }
        }
        Ok(Box::new(FakeConnection {
            web: Arc::clone(&self.0),
            body: VecDeque::new(),
        }))
    }
}

struct FakeConnection {
    web: Arc<FakeWeb>,
    body: VecDeque<u8>,
}

impl HttpConnection for FakeConnection {
    fn get(&mut self, url: &Url) -> Result<ResponseHead, HttpError> {
        let reply = self.web.reply_for(url);
        let mut head = reply.head;
        head.content_length = Some(reply.body.len() as u64);
        self.body = reply.body.into();
        Ok(head)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Received, HttpError> {
        if self.body.is_empty() {
            return Ok(Received::End);
        }
        // Short reads, to exercise callers that loop.
        let n = buf.len().min(self.body.len()).min(7);
        for (slot, byte) in buf.iter_mut().zip(self.body.drain(..n)) {
            *slot = byte;
        }
        Ok(Received::Data(n))
    }
}

fn config() -> HttpConfig {
    HttpConfig {
        max_redirects: 3,
        live_refresh_backoff: Duration::from_millis(10),
        max_live_refresh_attempts: 3,
        ..HttpConfig::default()
    }
}

fn session(web: &Arc<FakeWeb>) -> HttpSession {
    HttpSession::new(transport(web), config(), Arc::new(AtomicBool::new(true)))
}

struct Played {
    bytes: Vec<u8>,
    announced: Vec<CustomData>,
    events: Vec<StreamEvent>,
    marks: Vec<(usize, StreamMarker)>,
}

/// Run a playback stream to completion. `accept` decides which announced
/// content types the listener takes.
fn play(
    web: &Arc<FakeWeb>,
    url: &str,
    offset_ms: u64,
    accept: impl Fn(&str) -> bool + Send + Sync + 'static,
) -> Played {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    let options = StreamOptions::default().with_listener(move |_, event| {
        log.lock().push(event.clone());
        match event {
            StreamEvent::CustomData(data) if !accept(&data.content_type) => Err(
                StreamError::EventRejected(format!("{} not supported", data.content_type)),
            ),
            _ => Ok(()),
        }
    });

    let backend = HttpPlaybackStream::new(transport(web), config(), url)
        .with_offset_ms(offset_ms);
    let sink = MemorySink::new();
    let mut stream = AudioStream::reader("http", backend, sink.clone(), options).expect("reader");
    stream.start().expect("start");
    assert!(
        stream.wait_for_state(StreamState::Stopped, WAIT),
        "playback did not stop on its own"
    );
    stream.destroy().expect("destroy");

    let events = events.lock().clone();
    let announced = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::CustomData(data) => Some(data.clone()),
            _ => None,
        })
        .collect();
    Played {
        bytes: sink.bytes(),
        announced,
        events,
        marks: sink.marks(),
    }
}

#[test]
fn redirect_retargets_and_reuses_connection_for_same_origin() {
    let web = Arc::new(FakeWeb::default())
        .route("http://a.example/start", vec![Reply::redirect(302, "/moved")])
        .route("http://a.example/moved", vec![Reply::ok("audio/mpeg", "abc")])
        .route(
            "http://a.example/away",
            vec![Reply::redirect(301, "http://b.example/there")],
        )
        .route("http://b.example/there", vec![Reply::ok("audio/mpeg", "xyz")]);
    let mut session = session(&web);

    session.open("http://a.example/start").expect("open");
    assert_eq!(
        session.current_url().map(Url::as_str),
        Some("http://a.example/moved")
    );
    assert_eq!(session.connection_count(), 1);

    let body = session.read_body(64).expect("body");
    assert_eq!(body.bytes, b"abc");
    assert!(!body.truncated);

    session.open("/away").expect("open relative");
    assert_eq!(
        session.current_url().map(Url::as_str),
        Some("http://b.example/there")
    );
    assert_eq!(session.connection_count(), 2, "new origin opens a new connection");
}

#[test]
fn redirect_loop_is_cut_at_the_limit() {
    let web = Arc::new(FakeWeb::default())
        .route("http://a.example/loop", vec![Reply::redirect(307, "/loop")]);
    let mut session = session(&web);

    let err = session.open("http://a.example/loop").expect_err("loop");
    assert!(matches!(err, HttpError::TooManyRedirects { limit: 3 }));
    assert_eq!(web.requested("http://a.example/loop"), 4);
    assert!(!session.is_open());
}

#[test]
fn redirect_without_location_fails() {
    let web = Arc::new(FakeWeb::default()).route(
        "http://a.example/broken",
        vec![Reply {
            head: ResponseHead {
                status: 302,
                ..ResponseHead::default()
            },
            body: Vec::new(),
        }],
    );
    let err = session(&web).open("http://a.example/broken").expect_err("no location");
    assert!(matches!(err, HttpError::MissingLocation { status: 302 }));
}

#[test]
fn refused_connects_are_retried_until_one_succeeds() {
    let web = Arc::new(FakeWeb::default())
        .route("http://flaky.example/song.mp3", vec![Reply::ok("audio/mpeg", "ok")]);
    web.fail_connects("http://flaky.example", 2);
    let mut session = session(&web);

    session.open("http://flaky.example/song.mp3").expect("open after retries");
    assert_eq!(web.connects(), 3);
    assert_eq!(session.connection_count(), 1);
}

#[test]
fn non_ok_status_is_an_error() {
    let web = Arc::new(FakeWeb::default());
    let err = session(&web).open("http://a.example/missing").expect_err("404");
    assert!(matches!(err, HttpError::Status { status: 404, .. }));
}

#[test]
fn direct_media_is_announced_then_streamed() {
    let web = Arc::new(FakeWeb::default()).route(
        "http://radio.example/live.mp3",
        vec![Reply::ok("audio/mpeg; charset=binary", "mp3 frames here")],
    );
    let played = play(&web, "http://radio.example/live.mp3", 0, |_| true);

    assert_eq!(played.bytes, b"mp3 frames here");
    assert_eq!(
        played.announced,
        vec![CustomData {
            content_type: "mp3".into(),
            offset_in_ms: 0,
        }]
    );
    assert_eq!(played.events.first(), Some(&StreamEvent::CustomData(played.announced[0].clone())));
    assert!(matches!(
        played.marks.first(),
        Some((0, StreamMarker::Content(data))) if data.content_type == "mp3"
    ));
}

#[test]
fn rejected_direct_media_fails_the_stream() {
    let web = Arc::new(FakeWeb::default())
        .route("http://radio.example/live.aac", vec![Reply::ok("audio/aac", "adts")]);
    let played = play(&web, "http://radio.example/live.aac", 0, |kind| kind != "aac");

    assert!(played.bytes.is_empty());
    assert!(played
        .events
        .iter()
        .any(|e| matches!(e, StreamEvent::Failed(_))));
}

const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=64000\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=128000\n\
high/index.m3u8\n";

fn media_list(segments: &[&str], complete: bool) -> String {
    let mut body = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:1\n");
    for seg in segments {
        body.push_str("#EXTINF:10.0,\n");
        body.push_str(seg);
        body.push('\n');
    }
    if complete {
        body.push_str("#EXT-X-ENDLIST\n");
    }
    body
}

#[test]
fn rejected_variant_falls_through_to_the_next_one() {
    let web = Arc::new(FakeWeb::default())
        .route(
            "http://hls.example/master.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
        )
        .route(
            "http://hls.example/low/index.m3u8",
            vec![Reply::ok(
                "application/vnd.apple.mpegurl",
                media_list(&["a1.aac", "a2.aac"], true),
            )],
        )
        .route("http://hls.example/low/a1.aac", vec![Reply::ok("audio/aac", "AAC1")])
        .route(
            "http://hls.example/high/index.m3u8",
            vec![Reply::ok(
                "application/vnd.apple.mpegurl",
                media_list(&["m1.mp3", "m2.mp3"], true),
            )],
        )
        .route("http://hls.example/high/m1.mp3", vec![Reply::ok("audio/mpeg", "MP3-1|")])
        .route("http://hls.example/high/m2.mp3", vec![Reply::ok("audio/mpeg", "MP3-2")]);

    let played = play(&web, "http://hls.example/master.m3u8", 0, |kind| kind == "mp3");

    let kinds: Vec<_> = played.announced.iter().map(|d| d.content_type.as_str()).collect();
    assert_eq!(kinds, vec!["aac", "mp3"]);
    assert_eq!(played.bytes, b"MP3-1|MP3-2");
    assert_eq!(web.connects(), 1, "every request stays on one origin");
    assert_eq!(web.requested("http://hls.example/low/a2.aac"), 0);
}

#[test]
fn unreachable_variant_is_skipped() {
    let web = Arc::new(FakeWeb::default())
        .route(
            "http://hls.example/master.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
        )
        .route(
            "http://hls.example/high/index.m3u8",
            vec![Reply::ok(
                "application/vnd.apple.mpegurl",
                media_list(&["m1.mp3"], true),
            )],
        )
        .route("http://hls.example/high/m1.mp3", vec![Reply::ok("audio/mpeg", "only")]);

    let played = play(&web, "http://hls.example/master.m3u8", 0, |_| true);
    assert_eq!(played.bytes, b"only");
    assert_eq!(played.announced.len(), 1);
}

#[test]
fn no_playable_variant_fails_init() {
    let web = Arc::new(FakeWeb::default()).route(
        "http://hls.example/master.m3u8",
        vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
    );
    let played = play(&web, "http://hls.example/master.m3u8", 0, |_| true);

    assert!(played.bytes.is_empty());
    assert!(played.events.iter().any(
        |e| matches!(e, StreamEvent::Failed(reason) if reason.contains("no playable variant"))
    ));
}

#[test]
fn start_offset_skips_whole_segments() {
    let web = Arc::new(FakeWeb::default())
        .route(
            "http://hls.example/master.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
        )
        .route(
            "http://hls.example/low/index.m3u8",
            vec![Reply::ok(
                "application/vnd.apple.mpegurl",
                media_list(&["s1.mp3", "s2.mp3", "s3.mp3", "s4.mp3"], true),
            )],
        )
        .route("http://hls.example/low/s1.mp3", vec![Reply::ok("audio/mpeg", "1")])
        .route("http://hls.example/low/s2.mp3", vec![Reply::ok("audio/mpeg", "2")])
        .route("http://hls.example/low/s3.mp3", vec![Reply::ok("audio/mpeg", "3")])
        .route("http://hls.example/low/s4.mp3", vec![Reply::ok("audio/mpeg", "4")]);

    let played = play(&web, "http://hls.example/master.m3u8", 25_000, |_| true);

    assert_eq!(played.bytes, b"34");
    assert_eq!(played.announced.len(), 1);
    assert_eq!(played.announced[0].offset_in_ms, 5_000);
    assert_eq!(web.requested("http://hls.example/low/s1.mp3"), 0);
}

#[test]
fn live_playlist_is_refreshed_until_it_ends() {
    let web = Arc::new(FakeWeb::default())
        .route(
            "http://hls.example/master.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
        )
        .route(
            "http://hls.example/low/index.m3u8",
            vec![
                Reply::ok("application/vnd.apple.mpegurl", media_list(&["l1.mp3"], false)),
                Reply::ok(
                    "application/vnd.apple.mpegurl",
                    media_list(&["l1.mp3", "l2.mp3"], true),
                ),
            ],
        )
        .route("http://hls.example/low/l1.mp3", vec![Reply::ok("audio/mpeg", "live-1 ")])
        .route("http://hls.example/low/l2.mp3", vec![Reply::ok("audio/mpeg", "live-2")]);

    let played = play(&web, "http://hls.example/master.m3u8", 0, |_| true);

    assert_eq!(played.bytes, b"live-1 live-2");
    assert_eq!(web.requested("http://hls.example/low/index.m3u8"), 2);
    assert_eq!(web.requested("http://hls.example/low/l1.mp3"), 1);
}

#[test]
fn stalled_live_playlist_ends_after_bounded_refreshes() {
    let web = Arc::new(FakeWeb::default())
        .route(
            "http://hls.example/master.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", MASTER)],
        )
        .route(
            "http://hls.example/low/index.m3u8",
            vec![Reply::ok("application/vnd.apple.mpegurl", media_list(&["x.mp3"], false))],
        )
        .route("http://hls.example/low/x.mp3", vec![Reply::ok("audio/mpeg", "x")]);

    let played = play(&web, "http://hls.example/master.m3u8", 0, |_| true);

    assert_eq!(played.bytes, b"x");
    // Initial fetch, then refreshes until the empty-refresh budget runs out.
    assert_eq!(web.requested("http://hls.example/low/index.m3u8"), 1 + 4);
    assert!(!played.events.iter().any(|e| matches!(e, StreamEvent::Failed(_))));
}

#[test]
fn pls_entries_play_in_order() {
    let pls = "[playlist]\n\
File1=http://pls.example/one.mp3\n\
Length1=-1\n\
File2=http://pls.example/two.mp3\n\
NumberOfEntries=2\n\
Version=2\n";
    let web = Arc::new(FakeWeb::default())
        .route("http://pls.example/station.pls", vec![Reply::ok("audio/x-scpls", pls)])
        .route("http://pls.example/one.mp3", vec![Reply::ok("audio/mpeg", "one,")])
        .route("http://pls.example/two.mp3", vec![Reply::ok("audio/mpeg", "two")]);

    let played = play(&web, "http://pls.example/station.pls", 0, |_| true);

    assert_eq!(played.bytes, b"one,two");
    assert_eq!(played.announced.len(), 1);
    assert_eq!(played.announced[0].content_type, "mp3");
}
