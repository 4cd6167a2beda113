//! `AudioStream`: one worker thread per stream, driven by a small state
//! machine.
//!
//! ## Lifecycle
//!
//! ```text
//! Init ──start()──► Running ◄──resume()── Paused
//!                     │  └──────pause()─────►┘
//!                     ▼
//!                  Stopped ──start()──► Running
//!
//! any state except Destroyed ──destroy()──► Destroyed (terminal)
//! ```
//!
//! A *reader* stream pulls bytes from its backend (mic, network, file) and
//! pushes them into a `StreamSink`. A *writer* stream pulls from a
//! `StreamSource` and pushes into its backend (speaker, file).
//!
//! Backends implement `StreamIo`. `init` and `cleanup` run exactly once
//! per start/stop cycle; pause/resume keeps the backend initialised.
//!
//! ## I/O outcomes inside the worker loop
//!
//! | result                     | meaning                                     |
//! |----------------------------|---------------------------------------------|
//! | `Ok(0)`                    | nothing right now, loop again               |
//! | `Err(StreamError::Woken)`  | woken on purpose, loop again, not an error  |
//! | `Err(EndOfStream)`         | natural stop                                |
//! | any other `Err`            | `Failed` event, then stop                   |
//!
//! When a reader stops for any reason other than pause, it calls
//! `StreamSink::finish` once so the consumer sees end-of-stream.

pub mod fs;
pub mod http;
pub mod i2s;
pub mod null;
pub mod port;

pub use fs::FsStream;
pub use http::HttpPlaybackStream;
pub use i2s::I2sStream;
pub use null::NullStream;
pub use port::{MarkedSource, MemorySink, StreamSink, StreamSource};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::buffering::{chunk::PcmFormat, Wait};
use crate::error::StreamError;

/// Default worker buffer size in bytes.
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Bound on each blocking port call so control flags are seen promptly.
pub const DEFAULT_IO_WAIT: Duration = Duration::from_millis(100);

const DESTROY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Init,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Reader,
    Writer,
}

/// Content announcement emitted by a backend before its data flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub content_type: String,
    pub offset_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "detail")]
pub enum StreamEvent {
    Started,
    Stopped,
    Paused,
    Destroyed,
    CustomData(CustomData),
    Failed(String),
}

/// In-band marker carried next to the bytes through an anchored ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMarker {
    /// Bytes after this point use a new PCM format.
    Format(PcmFormat),
    /// Bytes after this point belong to new content.
    Content(CustomData),
    /// Timeline break (next HLS segment is not contiguous).
    Discontinuity,
}

/// External event callback. Returning `Err` for `CustomData` rejects the
/// announced content.
pub type EventListener = Arc<dyn Fn(&str, &StreamEvent) -> Result<(), StreamError> + Send + Sync>;

/// What a backend sees of its owning stream.
#[derive(Clone)]
pub struct StreamContext {
    name: Arc<str>,
    running: Arc<AtomicBool>,
    listener: Option<EventListener>,
}

impl StreamContext {
    /// A context not tied to any worker, always running.
    pub fn detached(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            running: Arc::new(AtomicBool::new(true)),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: EventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` once `stop` or `destroy` was requested.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Forward an event to the external listener only.
    pub fn emit(&self, event: &StreamEvent) -> Result<(), StreamError> {
        match &self.listener {
            Some(listener) => listener(&self.name, event),
            None => Ok(()),
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

/// Backend capability plugged into an `AudioStream`.
pub trait StreamIo: Send + 'static {
    /// Acquire resources for one run. Called once per start.
    fn init(&mut self, ctx: &StreamContext) -> Result<(), StreamError>;

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, StreamError> {
        Err(StreamError::NotAttached("read side"))
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize, StreamError> {
        Err(StreamError::NotAttached("write side"))
    }

    /// Release what `init` acquired. Called once per stop.
    fn cleanup(&mut self);

    /// Stream-type hook, runs before the external listener.
    fn on_event(&mut self, _event: &StreamEvent) {}

    /// A marker the reader wants placed before its next bytes.
    fn take_marker(&mut self) -> Option<StreamMarker> {
        None
    }

    /// A marker reached on the writer's input.
    fn apply_marker(&mut self, _marker: &StreamMarker) -> Result<(), StreamError> {
        Ok(())
    }
}

/// The closed set of stream backends this crate ships.
pub enum StreamBackend {
    I2s(I2sStream),
    Http(HttpPlaybackStream),
    Fs(FsStream),
    Null(NullStream),
}

macro_rules! each_backend {
    ($self:ident, $b:ident => $e:expr) => {
        match $self {
            StreamBackend::I2s($b) => $e,
            StreamBackend::Http($b) => $e,
            StreamBackend::Fs($b) => $e,
            StreamBackend::Null($b) => $e,
        }
    };
}

impl StreamIo for StreamBackend {
    fn init(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        each_backend!(self, b => b.init(ctx))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        each_backend!(self, b => b.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        each_backend!(self, b => b.write(buf))
    }

    fn cleanup(&mut self) {
        each_backend!(self, b => b.cleanup())
    }

    fn on_event(&mut self, event: &StreamEvent) {
        each_backend!(self, b => b.on_event(event))
    }

    fn take_marker(&mut self) -> Option<StreamMarker> {
        each_backend!(self, b => b.take_marker())
    }

    fn apply_marker(&mut self, marker: &StreamMarker) -> Result<(), StreamError> {
        each_backend!(self, b => b.apply_marker(marker))
    }
}

impl From<I2sStream> for StreamBackend {
    fn from(s: I2sStream) -> Self {
        StreamBackend::I2s(s)
    }
}

impl From<HttpPlaybackStream> for StreamBackend {
    fn from(s: HttpPlaybackStream) -> Self {
        StreamBackend::Http(s)
    }
}

impl From<FsStream> for StreamBackend {
    fn from(s: FsStream) -> Self {
        StreamBackend::Fs(s)
    }
}

impl From<NullStream> for StreamBackend {
    fn from(s: NullStream) -> Self {
        StreamBackend::Null(s)
    }
}

/// Worker tuning.
#[derive(Clone)]
pub struct StreamOptions {
    pub buf_size: usize,
    pub io_wait: Duration,
    pub listener: Option<EventListener>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            io_wait: DEFAULT_IO_WAIT,
            listener: None,
        }
    }
}

impl StreamOptions {
    pub fn with_listener(
        mut self,
        listener: impl Fn(&str, &StreamEvent) -> Result<(), StreamError> + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

enum Port {
    Sink(Box<dyn StreamSink>),
    Source(Box<dyn StreamSource>),
}

struct Control {
    run: bool,
    pause: bool,
    destroy: bool,
    state: StreamState,
    /// Set when the worker died by panicking; `destroy` reports it.
    panic: Option<String>,
}

struct Shared {
    control: Mutex<Control>,
    changed: Condvar,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        self.control.lock().state = state;
        self.changed.notify_all();
    }

    /// The worker is gone without running its teardown.
    fn abandon(&self, reason: String) {
        let mut c = self.control.lock();
        c.run = false;
        c.panic = Some(reason);
        c.state = StreamState::Destroyed;
        drop(c);
        self.changed.notify_all();
    }

    fn halt_requested(&self) -> bool {
        let c = self.control.lock();
        !c.run || c.pause || c.destroy
    }
}

/// A running stream and its worker thread.
pub struct AudioStream {
    name: Arc<str>,
    kind: StreamKind,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AudioStream {
    /// Create a reader stream feeding `sink`. The worker starts parked.
    pub fn reader(
        name: &str,
        backend: impl StreamIo,
        sink: impl StreamSink + 'static,
        options: StreamOptions,
    ) -> Result<Self, StreamError> {
        Self::spawn(name, StreamKind::Reader, Box::new(backend), Port::Sink(Box::new(sink)), options)
    }

    /// Create a writer stream draining `source`.
    pub fn writer(
        name: &str,
        backend: impl StreamIo,
        source: impl StreamSource + 'static,
        options: StreamOptions,
    ) -> Result<Self, StreamError> {
        Self::spawn(
            name,
            StreamKind::Writer,
            Box::new(backend),
            Port::Source(Box::new(source)),
            options,
        )
    }

    fn spawn(
        name: &str,
        kind: StreamKind,
        backend: Box<dyn StreamIo>,
        port: Port,
        options: StreamOptions,
    ) -> Result<Self, StreamError> {
        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                run: false,
                pause: false,
                destroy: false,
                state: StreamState::Init,
                panic: None,
            }),
            changed: Condvar::new(),
        });
        let running = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            ctx: StreamContext {
                name: Arc::clone(&name),
                running: Arc::clone(&running),
                listener: options.listener.clone(),
            },
            kind,
            backend,
            port,
            shared: Arc::clone(&shared),
            buf: vec![0u8; options.buf_size.max(1)],
            wait: Wait::For(options.io_wait),
            initialised: false,
        };

        let exit = Arc::clone(&shared);
        let exit_running = Arc::clone(&running);
        let thread_name = Arc::clone(&name);
        let handle = std::thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    let reason = panic_message(payload.as_ref());
                    error!(stream = &*thread_name, "stream worker panicked: {reason}");
                    exit_running.store(false, Ordering::Release);
                    exit.abandon(reason);
                }
            })
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        info!(stream = &*name, ?kind, "stream created");
        Ok(Self {
            name,
            kind,
            shared,
            running,
            worker: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.shared.control.lock().state
    }

    /// Start (or restart after stop). Starting a paused stream resumes it.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut c = self.shared.control.lock();
        if c.destroy || c.state == StreamState::Destroyed {
            return Err(StreamError::InvalidState {
                state: c.state,
                op: "start",
            });
        }
        c.run = true;
        c.pause = false;
        self.running.store(true, Ordering::Release);
        drop(c);
        self.shared.changed.notify_all();
        debug!(stream = &*self.name, "start requested");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        let mut c = self.shared.control.lock();
        if c.state == StreamState::Destroyed {
            return Err(StreamError::InvalidState {
                state: c.state,
                op: "stop",
            });
        }
        c.run = false;
        self.running.store(false, Ordering::Release);
        drop(c);
        self.shared.changed.notify_all();
        debug!(stream = &*self.name, "stop requested");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        let mut c = self.shared.control.lock();
        if !c.run || c.destroy {
            return Err(StreamError::InvalidState {
                state: c.state,
                op: "pause",
            });
        }
        c.pause = true;
        drop(c);
        self.shared.changed.notify_all();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), StreamError> {
        let c = self.shared.control.lock();
        if !c.pause {
            return Err(StreamError::InvalidState {
                state: c.state,
                op: "resume",
            });
        }
        drop(c);
        self.start()
    }

    /// Block until the worker reaches `state` or `timeout` passes.
    pub fn wait_for_state(&self, state: StreamState, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut c = self.shared.control.lock();
        while c.state != state {
            if self.shared.changed.wait_until(&mut c, deadline).timed_out() {
                return c.state == state;
            }
        }
        true
    }

    /// Tear the stream down. Returns once the worker reports `Destroyed`.
    ///
    /// # Errors
    /// `WorkerPanicked` when the worker died instead of tearing down; the
    /// stream is `Destroyed` either way.
    pub fn destroy(&mut self) -> Result<(), StreamError> {
        {
            let mut c = self.shared.control.lock();
            if c.state == StreamState::Destroyed && self.worker.is_none() {
                return Ok(());
            }
            c.destroy = true;
            c.run = false;
        }
        self.running.store(false, Ordering::Release);
        self.shared.changed.notify_all();

        let mut polls = 0u32;
        let mut c = self.shared.control.lock();
        while c.state != StreamState::Destroyed {
            self.shared.changed.wait_for(&mut c, DESTROY_POLL);
            polls += 1;
            if polls % 50 == 0 {
                warn!(stream = &*self.name, polls, "still waiting for stream to exit");
            }
        }
        drop(c);

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(stream = &*self.name, "stream worker exited abnormally");
            }
        }
        if let Some(reason) = self.shared.control.lock().panic.take() {
            return Err(StreamError::WorkerPanicked(reason));
        }
        info!(stream = &*self.name, "stream destroyed");
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.destroy();
        }
    }
}

enum RunOutcome {
    Paused,
    Halted,
    Ended,
    Failed(String),
}

struct Worker {
    ctx: StreamContext,
    kind: StreamKind,
    backend: Box<dyn StreamIo>,
    port: Port,
    shared: Arc<Shared>,
    buf: Vec<u8>,
    wait: Wait,
    initialised: bool,
}

enum Command {
    Run,
    Cleanup,
    Destroy,
}

impl Worker {
    fn run(mut self) {
        loop {
            match self.next_command() {
                Command::Destroy => break,
                Command::Cleanup => self.finish_run(None),
                Command::Run => self.run_once(),
            }
        }

        if self.initialised {
            self.backend.cleanup();
            self.initialised = false;
        }
        self.fire(StreamEvent::Destroyed);
        self.shared.set_state(StreamState::Destroyed);
    }

    fn next_command(&self) -> Command {
        let mut c = self.shared.control.lock();
        loop {
            if c.destroy {
                return Command::Destroy;
            }
            if c.run && !c.pause {
                return Command::Run;
            }
            if !c.run && self.initialised {
                return Command::Cleanup;
            }
            self.shared.changed.wait(&mut c);
        }
    }

    fn run_once(&mut self) {
        if !self.initialised {
            if let Err(e) = self.backend.init(&self.ctx) {
                warn!(stream = self.ctx.name(), "init failed: {e}");
                self.fire(StreamEvent::Failed(e.to_string()));
                self.shared.control.lock().run = false;
                self.ctx.running.store(false, Ordering::Release);
                self.shared.set_state(StreamState::Stopped);
                return;
            }
            self.initialised = true;
        }

        self.shared.set_state(StreamState::Running);
        self.fire(StreamEvent::Started);
        info!(stream = self.ctx.name(), "stream running");

        match self.io_loop() {
            RunOutcome::Paused => {
                self.shared.set_state(StreamState::Paused);
                self.fire(StreamEvent::Paused);
            }
            RunOutcome::Halted => {
                // Destroy is handled by the outer loop; plain stop cleans up here.
                if !self.shared.control.lock().destroy {
                    self.finish_run(None);
                }
            }
            RunOutcome::Ended => {
                self.stop_flags();
                self.finish_run(None);
            }
            RunOutcome::Failed(reason) => {
                self.stop_flags();
                self.finish_run(Some(reason));
            }
        }
    }

    fn stop_flags(&self) {
        self.shared.control.lock().run = false;
        self.ctx.running.store(false, Ordering::Release);
    }

    fn io_loop(&mut self) -> RunOutcome {
        loop {
            {
                let c = self.shared.control.lock();
                if c.destroy || !c.run {
                    return RunOutcome::Halted;
                }
                if c.pause {
                    return RunOutcome::Paused;
                }
            }

            let step = match self.kind {
                StreamKind::Reader => self.reader_step(),
                StreamKind::Writer => self.writer_step(),
            };

            match step {
                Ok(()) | Err(StreamError::Woken) => {}
                Err(StreamError::EndOfStream) => {
                    info!(stream = self.ctx.name(), "end of stream");
                    return RunOutcome::Ended;
                }
                Err(e) => {
                    warn!(stream = self.ctx.name(), "stopping stream: {e}");
                    return RunOutcome::Failed(e.to_string());
                }
            }
        }
    }

    fn reader_step(&mut self) -> Result<(), StreamError> {
        let n = self.backend.read(&mut self.buf)?;
        let Port::Sink(sink) = &mut self.port else {
            return Err(StreamError::NotAttached("sink"));
        };
        if let Some(marker) = self.backend.take_marker() {
            sink.mark(marker);
        }
        if n == 0 {
            return Ok(());
        }
        let mut done = 0;
        while done < n {
            done += sink.write(&self.buf[done..n], self.wait)?;
            if done < n && self.shared.halt_requested() {
                debug!(stream = self.ctx.name(), dropped = n - done, "sink full at stop");
                break;
            }
        }
        Ok(())
    }

    fn writer_step(&mut self) -> Result<(), StreamError> {
        let Port::Source(source) = &mut self.port else {
            return Err(StreamError::NotAttached("source"));
        };
        let n = source.read(&mut self.buf, self.wait)?;
        if let Some(marker) = source.take_marker() {
            self.backend.apply_marker(&marker)?;
        }
        let mut done = 0;
        while done < n {
            let w = self.backend.write(&self.buf[done..n])?;
            done += w;
            if w == 0 && self.shared.halt_requested() {
                break;
            }
        }
        Ok(())
    }

    fn finish_run(&mut self, failure: Option<String>) {
        if self.kind == StreamKind::Reader {
            if let Port::Sink(sink) = &mut self.port {
                if let Err(e) = sink.finish() {
                    warn!(stream = self.ctx.name(), "end-of-stream push failed: {e}");
                }
            }
        }
        if self.initialised {
            self.backend.cleanup();
            self.initialised = false;
        }
        if let Some(reason) = failure {
            self.fire(StreamEvent::Failed(reason));
        }
        self.shared.set_state(StreamState::Stopped);
        self.fire(StreamEvent::Stopped);
        info!(stream = self.ctx.name(), "stream stopped");
    }

    fn fire(&mut self, event: StreamEvent) {
        self.backend.on_event(&event);
        if let Err(e) = self.ctx.emit(&event) {
            debug!(stream = self.ctx.name(), ?event, "listener returned {e}");
        }
    }
}
