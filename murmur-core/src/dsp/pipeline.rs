//! Blocking worker loops of the capture pipeline.
//!
//! ```text
//! resample:  raw-mic ring ─► MicResampler ─► (drop if muted) ─► mic ring
//! wake word: mic ring ─► preroll ring (per read) ─► detect() ─► WakeWord command
//! consumer:  command queue ─► DspStateMachine ─► recognizer
//! ```
//!
//! Each loop runs on its own named thread until `running` clears or its
//! ring is aborted.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::capture::{CaptureGate, MicTap, PrerollStatus};
use super::resample::MicResampler;
use super::state::{CaptureBackend, DspCommand, DspStateMachine};
use super::wakeword::WakeWordEngine;
use super::MuteObserver;
use crate::buffering::chunk::bytes_to_i16;
use crate::buffering::{RingConsumer, RingProducer, Wait};
use crate::error::RingError;
use crate::events::{CaptureState, CaptureStateEvent, DialogTrigger};

pub struct PipelineDiagnostics {
    pub raw_bytes_in: AtomicUsize,
    pub mic_bytes_out: AtomicUsize,
    pub mic_bytes_dropped: AtomicUsize,
    pub wake_frames: AtomicUsize,
    pub wake_hits: AtomicUsize,
    pub wake_hits_suppressed: AtomicUsize,
    pub commands_handled: AtomicUsize,
    pub commands_ignored: AtomicUsize,
    pub dialogs_opened: AtomicUsize,
    pub recognize_errors: AtomicUsize,
    pub chunks_forwarded: AtomicUsize,
    pub read_failures: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            raw_bytes_in: AtomicUsize::new(0),
            mic_bytes_out: AtomicUsize::new(0),
            mic_bytes_dropped: AtomicUsize::new(0),
            wake_frames: AtomicUsize::new(0),
            wake_hits: AtomicUsize::new(0),
            wake_hits_suppressed: AtomicUsize::new(0),
            commands_handled: AtomicUsize::new(0),
            commands_ignored: AtomicUsize::new(0),
            dialogs_opened: AtomicUsize::new(0),
            recognize_errors: AtomicUsize::new(0),
            chunks_forwarded: AtomicUsize::new(0),
            read_failures: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.raw_bytes_in.store(0, Ordering::Relaxed);
        self.mic_bytes_out.store(0, Ordering::Relaxed);
        self.mic_bytes_dropped.store(0, Ordering::Relaxed);
        self.wake_frames.store(0, Ordering::Relaxed);
        self.wake_hits.store(0, Ordering::Relaxed);
        self.wake_hits_suppressed.store(0, Ordering::Relaxed);
        self.commands_handled.store(0, Ordering::Relaxed);
        self.commands_ignored.store(0, Ordering::Relaxed);
        self.dialogs_opened.store(0, Ordering::Relaxed);
        self.recognize_errors.store(0, Ordering::Relaxed);
        self.chunks_forwarded.store(0, Ordering::Relaxed);
        self.read_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            raw_bytes_in: self.raw_bytes_in.load(Ordering::Relaxed),
            mic_bytes_out: self.mic_bytes_out.load(Ordering::Relaxed),
            mic_bytes_dropped: self.mic_bytes_dropped.load(Ordering::Relaxed),
            wake_frames: self.wake_frames.load(Ordering::Relaxed),
            wake_hits: self.wake_hits.load(Ordering::Relaxed),
            wake_hits_suppressed: self.wake_hits_suppressed.load(Ordering::Relaxed),
            commands_handled: self.commands_handled.load(Ordering::Relaxed),
            commands_ignored: self.commands_ignored.load(Ordering::Relaxed),
            dialogs_opened: self.dialogs_opened.load(Ordering::Relaxed),
            recognize_errors: self.recognize_errors.load(Ordering::Relaxed),
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub raw_bytes_in: usize,
    pub mic_bytes_out: usize,
    pub mic_bytes_dropped: usize,
    pub wake_frames: usize,
    pub wake_hits: usize,
    pub wake_hits_suppressed: usize,
    pub commands_handled: usize,
    pub commands_ignored: usize,
    pub dialogs_opened: usize,
    pub recognize_errors: usize,
    pub chunks_forwarded: usize,
    pub read_failures: usize,
}

/// Poll interval for loops that must notice `running` clearing.
const POLL: Duration = Duration::from_millis(100);

/// Minimum spacing of the "mic ring full" warning.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep between checks while wake word detection is off.
const DETECT_IDLE_SLEEP: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Resample
// ---------------------------------------------------------------------------

pub struct ResampleContext {
    pub raw: RingConsumer,
    pub mic: RingProducer,
    pub resampler: MicResampler,
    pub gate: Arc<CaptureGate>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Rate limit for the dropped-audio warning. Bytes dropped in between are
/// summed into the next report.
#[derive(Debug, Default)]
struct DropReport {
    last: Option<Instant>,
    unreported: usize,
}

impl DropReport {
    fn record(&mut self, lost: usize, now: Instant) -> Option<usize> {
        self.unreported += lost;
        if self
            .last
            .is_some_and(|at| now.duration_since(at) < DROP_WARN_INTERVAL)
        {
            return None;
        }
        self.last = Some(now);
        Some(std::mem::take(&mut self.unreported))
    }
}

/// Run until `running` clears or the raw ring ends.
pub fn run_resample(mut ctx: ResampleContext) {
    info!("resample task started");
    let mut raw = vec![0u8; ctx.resampler.frame_bytes()];
    let mut out = Vec::new();
    let mut drops = DropReport::default();

    while ctx.running.load(Ordering::Acquire) {
        let n = match ctx.raw.read(&mut raw, Wait::For(POLL)) {
            Ok(0) | Err(RingError::Unblocked) => continue,
            Ok(n) => n,
            Err(RingError::WriterFinished) => {
                info!("raw mic source finished");
                break;
            }
            Err(RingError::Aborted) => break,
            Err(e) => {
                error!(error = %e, "raw mic ring read failed");
                break;
            }
        };
        ctx.diagnostics.raw_bytes_in.fetch_add(n, Ordering::Relaxed);

        out.clear();
        ctx.resampler.process(&raw[..n], &mut out);
        if out.is_empty() {
            continue;
        }
        if ctx.gate.is_muted() {
            ctx.diagnostics.mic_bytes_dropped.fetch_add(out.len(), Ordering::Relaxed);
            continue;
        }
        match ctx.mic.write(&out, Wait::For(POLL)) {
            Ok(written) => {
                ctx.diagnostics.mic_bytes_out.fetch_add(written, Ordering::Relaxed);
                if written < out.len() {
                    let lost = out.len() - written;
                    ctx.diagnostics.mic_bytes_dropped.fetch_add(lost, Ordering::Relaxed);
                    if let Some(lost) = drops.record(lost, Instant::now()) {
                        warn!(lost, "mic ring full, dropping audio");
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "mic ring closed");
                break;
            }
        }
    }
    ctx.mic.finish();
    info!("resample task stopped");
}

// ---------------------------------------------------------------------------
// Wake word
// ---------------------------------------------------------------------------

pub struct WakeWordContext {
    pub engine: Box<dyn WakeWordEngine>,
    pub tap: MicTap,
    pub preroll: RingProducer,
    pub commands: Sender<DspCommand>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

enum Fill {
    Full,
    /// Detection was switched off or the read was woken. The partial frame
    /// is already in the preroll ring.
    Interrupted,
    Closed,
}

fn fill_frame(ctx: &mut WakeWordContext, frame: &mut [u8]) -> Fill {
    let mut filled = 0;
    while filled < frame.len() {
        if !ctx.running.load(Ordering::Acquire) {
            return Fill::Closed;
        }
        if !ctx.tap.gate().is_detecting() {
            return Fill::Interrupted;
        }
        match ctx
            .tap
            .detect_audio(&mut ctx.preroll, &mut frame[filled..], Wait::For(POLL))
        {
            Ok(n) => filled += n,
            Err(RingError::Unblocked) => {
                if !ctx.tap.gate().is_detecting() {
                    // The wakeup was meant for the dialog reader; hand it on.
                    ctx.tap.mic_control().wakeup_reader();
                }
                return Fill::Interrupted;
            }
            Err(RingError::WriterFinished) | Err(RingError::Aborted) => return Fill::Closed,
            Err(e) => {
                error!(error = %e, "mic ring read failed in wake word task");
                return Fill::Closed;
            }
        }
    }
    Fill::Full
}

/// Feed the detector until `running` clears or the mic ring ends.
pub fn run_wake_word(mut ctx: WakeWordContext) {
    let chunk_size = ctx.engine.chunk_size().max(1);
    info!(
        sample_rate = ctx.engine.sample_rate(),
        chunk_size,
        "wake word task started"
    );
    let mut frame = vec![0u8; chunk_size * 2];
    let mut samples = Vec::with_capacity(chunk_size);
    let mut chunk: u64 = 0;
    let mut last_hit: Option<u64> = None;

    while ctx.running.load(Ordering::Acquire) {
        if !ctx.tap.gate().is_detecting() {
            thread::sleep(DETECT_IDLE_SLEEP);
            continue;
        }
        match fill_frame(&mut ctx, &mut frame) {
            Fill::Full => {}
            Fill::Interrupted => continue,
            Fill::Closed => break,
        }
        bytes_to_i16(&frame, &mut samples);
        ctx.diagnostics.wake_frames.fetch_add(1, Ordering::Relaxed);

        let hit = ctx.engine.detect(&samples);
        if hit && ctx.tap.gate().is_detecting() {
            ctx.tap.gate().set_preroll(PrerollStatus::Pending);
            let adjacent = chunk > 0 && last_hit == Some(chunk - 1);
            last_hit = Some(chunk);
            if adjacent {
                ctx.diagnostics.wake_hits_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(chunk, "wake word hit on consecutive frame, ignored");
            } else {
                ctx.diagnostics.wake_hits.fetch_add(1, Ordering::Relaxed);
                info!(chunk, "wake word detected");
                if ctx.commands.send(DspCommand::WakeWord).is_err() {
                    break;
                }
            }
        }
        chunk += 1;
    }
    info!("wake word task stopped");
}

// ---------------------------------------------------------------------------
// Command consumer
// ---------------------------------------------------------------------------

pub struct ConsumerContext<B: CaptureBackend> {
    pub machine: DspStateMachine<B>,
    pub commands: Receiver<DspCommand>,
    pub state: Arc<Mutex<CaptureState>>,
    pub events: broadcast::Sender<CaptureStateEvent>,
    pub seq: Arc<AtomicU64>,
    pub mute_observer: Option<MuteObserver>,
    pub running: Arc<AtomicBool>,
}

/// Serve the command queue until `running` clears or every sender is gone.
///
/// A self-posted command is held aside and served once the queue is empty,
/// so it never blocks on the queue it is consuming.
pub fn run_consumer<B: CaptureBackend>(mut ctx: ConsumerContext<B>) {
    info!("dsp command consumer started");
    let mut pending: Option<DspCommand> = None;

    while ctx.running.load(Ordering::Acquire) {
        let cmd = match pending {
            Some(held) => match ctx.commands.try_recv() {
                Ok(cmd) => cmd,
                Err(TryRecvError::Empty) => {
                    pending = None;
                    held
                }
                Err(TryRecvError::Disconnected) => break,
            },
            None => match ctx.commands.recv_timeout(POLL) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        let previous = ctx.machine.state();
        let step = ctx.machine.handle(cmd);
        if let Some(next) = step.follow_up {
            pending = Some(next);
        }
        let state = ctx.machine.state();
        if state != previous {
            publish(&ctx, previous, state, step.trigger);
        }
    }
    info!("dsp command consumer stopped");
}

fn publish<B: CaptureBackend>(
    ctx: &ConsumerContext<B>,
    previous: CaptureState,
    state: CaptureState,
    trigger: Option<DialogTrigger>,
) {
    *ctx.state.lock() = state;
    debug!(?previous, ?state, "capture state changed");
    if let Some(observer) = &ctx.mute_observer {
        if state == CaptureState::Muted || previous == CaptureState::Muted {
            observer(state == CaptureState::Muted);
        }
    }
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    // No subscribers is fine.
    let _ = ctx.events.send(CaptureStateEvent {
        seq,
        state,
        previous,
        trigger,
    });
}
