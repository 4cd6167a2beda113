use thiserror::Error;

use crate::stream::StreamState;

/// Non-data outcomes of a ring buffer read or write.
///
/// `Unblocked` and `FetchAnchor` are not failures: the caller retries (after
/// popping the anchor, for `FetchAnchor`). `Aborted` and `WriterFinished` end
/// the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring buffer aborted")]
    Aborted,

    #[error("writer finished, ring buffer drained")]
    WriterFinished,

    #[error("reader unblocked, retry")]
    Unblocked,

    #[error("anchor pending at read position")]
    FetchAnchor,

    #[error("no anchor available")]
    NoAnchor,

    #[error("ring buffer capacity must be at least 2 bytes, got {0}")]
    InvalidCapacity(usize),
}

/// Errors surfaced by an `AudioStream` backend or its worker.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Retry without error; the read or write was interrupted on purpose.
    #[error("woken for retry")]
    Woken,

    /// The source is exhausted. Readers stop naturally on this.
    #[error("end of stream")]
    EndOfStream,

    #[error("stream is {state:?}, cannot {op}")]
    InvalidState { state: StreamState, op: &'static str },

    #[error("event rejected by listener: {0}")]
    EventRejected(String),

    #[error("stream has no {0} attached")]
    NotAttached(&'static str),

    #[error("ring buffer: {0}")]
    Ring(RingError),

    #[error("http: {0}")]
    Http(#[from] HttpError),

    #[error("hal: {0}")]
    Hal(String),

    #[error("wav: {0}")]
    Wav(String),

    #[error("failed to spawn stream worker: {0}")]
    Spawn(String),

    #[error("stream worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RingError> for StreamError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::Unblocked => StreamError::Woken,
            RingError::WriterFinished => StreamError::EndOfStream,
            other => StreamError::Ring(other),
        }
    }
}

impl From<hound::Error> for StreamError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => StreamError::Io(io),
            other => StreamError::Wav(other.to_string()),
        }
    }
}

/// HTTP session and playback errors.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect to {origin} failed: {reason}")]
    Connect { origin: String, reason: String },

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("redirect status {status} without a Location header")]
    MissingLocation { status: u16 },

    #[error("more than {limit} redirects")]
    TooManyRedirects { limit: usize },

    #[error("transport: {0}")]
    Transport(String),

    #[error("unsupported content type '{0}'")]
    UnsupportedContent(String),

    #[error("no playable variant")]
    NoPlayableVariant,

    #[error("cancelled: stream stopped")]
    Cancelled,

    #[error("playlist: {0}")]
    Playlist(#[from] PlaylistError),
}

/// Playlist parsing errors.
#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("playlist has no entries")]
    Empty,

    #[error("cannot resolve '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("malformed line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("playlist is not valid UTF-8")]
    Encoding,
}

/// Multipart scanner errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("boundary must be 1..=70 bytes, got {0}")]
    InvalidBoundary(usize),

    #[error("unexpected byte 0x{byte:02x} at offset {offset} while in {state}")]
    Malformed {
        offset: usize,
        byte: u8,
        state: &'static str,
    },

    #[error("callback aborted parsing at offset {0}")]
    Aborted(usize),

    #[error("header line longer than {limit} bytes")]
    HeaderTooLong { limit: usize },

    #[error("body ended while in {state}")]
    Truncated { state: &'static str },
}

/// DSP capture pipeline errors.
#[derive(Debug, Error)]
pub enum DspError {
    #[error("recognizer: {0}")]
    Recognizer(String),

    #[error("persistent store: {0}")]
    Store(String),

    #[error("resampler: {0}")]
    Resampler(String),

    #[error("capture source: {0}")]
    Capture(String),

    #[error("wake word engine expects {engine} Hz, pipeline produces {pipeline} Hz")]
    RateMismatch { engine: u32, pipeline: u32 },

    #[error("command queue closed")]
    QueueClosed,

    #[error("failed to spawn {task}: {reason}")]
    Spawn { task: &'static str, reason: String },

    #[error("ring buffer: {0}")]
    Ring(#[from] RingError),
}

/// All errors produced by murmur-core.
#[derive(Debug, Error)]
pub enum MurmurError {
    #[error("ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("multipart error: {0}")]
    Multipart(#[from] MultipartError),

    #[error("dsp error: {0}")]
    Dsp(#[from] DspError),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("{role} path already claimed")]
    AlreadyClaimed { role: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MurmurError>;
