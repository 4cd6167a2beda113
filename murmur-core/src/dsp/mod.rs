//! Voice capture pipeline: mic ring, resampler, wake word detection,
//! preroll and the capture state machine.
//!
//! `DspPipeline` owns everything and runs three threads. The raw mic
//! ring's producer half is handed to whatever captures audio, usually an
//! I2S reader `AudioStream`. Applications steer capture through a
//! cloneable `DspHandle`; buttons go through `ButtonWatcher`.
//!
//! ```text
//! capture ─► raw-mic ring ─► [resample] ─► mic ring ─┬─► [wake word] ─► preroll ring
//!                                                    │        │
//!                                                    │        └─► WakeWord ─┐
//!  DspHandle / ButtonWatcher ──────── commands (depth 10) ◄─────────────────┘
//!                                                    │
//!                                          [consumer] DspStateMachine ─► SpeechRecognizer
//! ```

pub mod button;
pub mod capture;
pub mod pipeline;
pub mod resample;
pub mod state;
pub mod store;
pub mod wakeword;

pub use button::{ButtonEvent, ButtonWatcher};
pub use capture::{CaptureGate, MicCapture, MicTap, PrerollStatus};
pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};
pub use resample::MicResampler;
pub use state::{CaptureBackend, DspCommand, DspStateMachine, Initiator, SpeechRecognizer, Step};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, MUTE_KEY};
pub use wakeword::{NeverWake, WakeWordEngine};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::buffering::chunk::PcmFormat;
use crate::buffering::{RingBuffer, RingControl, RingProducer};
use crate::error::DspError;
use crate::events::{CaptureState, CaptureStateEvent, PipelineStatus, PipelineStatusEvent};

/// Depth of the command queue. Senders block when it is full.
pub const COMMAND_QUEUE_DEPTH: usize = 10;

/// Broadcast channel capacity for capture and status events.
const BROADCAST_CAP: usize = 64;

/// Called with `true` when the mic becomes muted and `false` when it is
/// unmuted, including a mute restored at startup.
pub type MuteObserver = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct DspConfig {
    /// Format of the bytes written into the raw mic ring.
    pub capture_format: PcmFormat,
    /// Rate of the mono stream fed to the wake word engine and recognizer.
    pub target_sample_rate: u32,
    /// Resampler frame length.
    pub frame_ms: u64,
    pub raw_mic_ring_bytes: usize,
    pub mic_ring_bytes: usize,
    /// Audio kept ahead of the wake phrase.
    pub preroll_ms: u64,
    /// Expected length of the wake phrase itself.
    pub wake_word_ms: u64,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            capture_format: PcmFormat::MIC_RAW,
            target_sample_rate: 16_000,
            frame_ms: 20,
            raw_mic_ring_bytes: 4 * 1024,
            mic_ring_bytes: 8 * 1024,
            preroll_ms: 500,
            wake_word_ms: 600,
        }
    }
}

impl DspConfig {
    /// 16-bit mono at the target rate.
    pub fn voice_format(&self) -> PcmFormat {
        PcmFormat::new(self.target_sample_rate, 1, 16)
    }

    pub fn wake_word_bytes(&self) -> usize {
        self.voice_format().bytes_for_ms(self.wake_word_ms)
    }

    /// Preroll plus wake phrase, in voice-format bytes.
    pub fn preroll_ring_bytes(&self) -> usize {
        self.voice_format()
            .bytes_for_ms(self.preroll_ms + self.wake_word_ms)
    }
}

/// External collaborators of the pipeline.
pub struct DspParts {
    pub wake_word: Box<dyn WakeWordEngine>,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub store: Arc<dyn KeyValueStore>,
    pub mute_observer: Option<MuteObserver>,
}

/// Owns the capture buffers and worker threads.
///
/// Dropping the pipeline shuts it down.
pub struct DspPipeline {
    config: DspConfig,
    handle: DspHandle,
    running: Arc<AtomicBool>,
    rings: Vec<RingControl>,
    mic_input: Option<RingProducer>,
    threads: Vec<JoinHandle<()>>,
    status_tx: broadcast::Sender<PipelineStatusEvent>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl DspPipeline {
    /// Allocate the rings and start the resample, wake word and command
    /// consumer threads.
    ///
    /// # Errors
    /// - `DspError::RateMismatch` if the wake word engine wants another rate.
    /// - `DspError::Ring` / `DspError::Resampler` when a buffer or the
    ///   resampler cannot be built.
    /// - `DspError::Spawn` if a worker thread cannot start.
    pub fn new(config: DspConfig, parts: DspParts) -> Result<Self, DspError> {
        let DspParts {
            wake_word,
            recognizer,
            store,
            mute_observer,
        } = parts;

        if wake_word.sample_rate() != config.target_sample_rate {
            return Err(DspError::RateMismatch {
                engine: wake_word.sample_rate(),
                pipeline: config.target_sample_rate,
            });
        }

        let (raw_tx, raw_rx) = RingBuffer::new("raw_mic", config.raw_mic_ring_bytes)?;
        let (mic_tx, mic_rx) = RingBuffer::new("mic_data", config.mic_ring_bytes)?;
        let (preroll_tx, preroll_rx) = RingBuffer::new("preroll", config.preroll_ring_bytes())?;
        let resampler =
            MicResampler::new(config.capture_format, config.target_sample_rate, config.frame_ms)?;

        let rings = vec![raw_tx.control(), mic_tx.control(), preroll_tx.control()];
        let gate = Arc::new(CaptureGate::new());
        let tap = MicTap::new(Arc::clone(&gate), mic_rx, preroll_rx, config.wake_word_bytes());
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_DEPTH);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let restored_mute = store::load_mute(store.as_ref());
        let handle = DspHandle {
            commands: cmd_tx.clone(),
            mic: tap.mic_control().clone(),
            store,
            state: Arc::new(Mutex::new(CaptureState::Stopped)),
            mute_requested: Arc::new(AtomicBool::new(restored_mute)),
            events: events_tx.clone(),
        };

        let mut dsp = Self {
            config,
            handle,
            running: Arc::clone(&running),
            rings,
            mic_input: Some(raw_tx),
            threads: Vec::with_capacity(3),
            status_tx,
            diagnostics: Arc::clone(&diagnostics),
        };

        // From here on an early return drops `dsp`, which stops any
        // thread already started.
        dsp.spawn("dsp-resample", {
            let ctx = pipeline::ResampleContext {
                raw: raw_rx,
                mic: mic_tx,
                resampler,
                gate,
                running: Arc::clone(&running),
                diagnostics: Arc::clone(&diagnostics),
            };
            move || pipeline::run_resample(ctx)
        })?;

        dsp.spawn("dsp-wakeword", {
            let ctx = pipeline::WakeWordContext {
                engine: wake_word,
                tap: tap.clone(),
                preroll: preroll_tx,
                commands: cmd_tx.clone(),
                running: Arc::clone(&running),
                diagnostics: Arc::clone(&diagnostics),
            };
            move || pipeline::run_wake_word(ctx)
        })?;

        let state = Arc::clone(&dsp.handle.state);
        dsp.spawn("dsp-consumer", {
            let ctx = pipeline::ConsumerContext {
                machine: DspStateMachine::new(
                    MicCapture::new(tap),
                    recognizer,
                    Arc::clone(&diagnostics),
                ),
                commands: cmd_rx,
                state: Arc::clone(&state),
                events: events_tx,
                seq: Arc::new(AtomicU64::new(0)),
                mute_observer,
                running: Arc::clone(&running),
            };
            move || pipeline::run_consumer(ctx)
        })?;

        if restored_mute {
            info!("restoring persisted mic mute");
            cmd_tx.send(DspCommand::Mute).map_err(|_| DspError::QueueClosed)?;
        }

        info!(
            capture_rate = dsp.config.capture_format.sample_rate,
            target_rate = dsp.config.target_sample_rate,
            preroll_bytes = dsp.config.preroll_ring_bytes(),
            "dsp pipeline started"
        );
        dsp.set_status(PipelineStatus::Running, None);
        Ok(dsp)
    }

    fn spawn(
        &mut self,
        name: &'static str,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), DspError> {
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(f)
            .map_err(|e| DspError::Spawn {
                task: name,
                reason: e.to_string(),
            })?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn config(&self) -> &DspConfig {
        &self.config
    }

    /// Producer half of the raw mic ring. Handed out once; usually the sink
    /// of an I2S reader stream.
    pub fn take_mic_input(&mut self) -> Option<RingProducer> {
        self.mic_input.take()
    }

    pub fn handle(&self) -> DspHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> CaptureState {
        self.handle.state()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to pipeline lifecycle events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<PipelineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Stop every worker and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for ring in &self.rings {
            ring.abort();
        }
        let mut panicked = Vec::new();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("dsp").to_string();
            if handle.join().is_err() {
                error!(thread = name.as_str(), "dsp worker panicked");
                panicked.push(name);
            }
        }
        if panicked.is_empty() {
            self.set_status(PipelineStatus::Stopped, None);
        } else {
            let detail = format!("worker panicked: {}", panicked.join(", "));
            self.set_status(PipelineStatus::Error, Some(detail));
        }
        info!("dsp pipeline stopped");
    }

    fn set_status(&self, status: PipelineStatus, detail: Option<String>) {
        // No subscribers is fine.
        let _ = self.status_tx.send(PipelineStatusEvent { status, detail });
    }
}

impl Drop for DspPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable control surface of a running pipeline.
#[derive(Clone)]
pub struct DspHandle {
    commands: Sender<DspCommand>,
    mic: RingControl,
    store: Arc<dyn KeyValueStore>,
    state: Arc<Mutex<CaptureState>>,
    mute_requested: Arc<AtomicBool>,
    events: broadcast::Sender<CaptureStateEvent>,
}

impl DspHandle {
    /// Start or end a tap-to-talk dialog.
    pub fn tap_to_talk(&self) -> Result<(), DspError> {
        self.interrupt(DspCommand::TapToTalk)
    }

    /// Stream mic audio to the recognizer without a recognize call.
    pub fn start_capture(&self) -> Result<(), DspError> {
        self.post(DspCommand::StartMic)
    }

    pub fn stop_capture(&self) -> Result<(), DspError> {
        self.interrupt(DspCommand::StopMic)
    }

    /// Mute the mic and persist the choice.
    pub fn mute(&self) -> Result<(), DspError> {
        self.mute_requested.store(true, Ordering::Release);
        store::save_mute(self.store.as_ref(), true);
        self.interrupt(DspCommand::Mute)
    }

    pub fn unmute(&self) -> Result<(), DspError> {
        self.mute_requested.store(false, Ordering::Release);
        store::save_mute(self.store.as_ref(), false);
        self.post(DspCommand::Unmute)
    }

    /// Last requested mute setting, which may not have been applied yet.
    pub fn is_mute_requested(&self) -> bool {
        self.mute_requested.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Subscribe to capture state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureStateEvent> {
        self.events.subscribe()
    }

    /// Queue `cmd`, blocking while the queue is full.
    pub fn post(&self, cmd: DspCommand) -> Result<(), DspError> {
        self.commands.send(cmd).map_err(|_| DspError::QueueClosed)
    }

    /// Queue `cmd`, then wake a dialog read blocked on the mic ring so the
    /// consumer gets to it.
    fn interrupt(&self, cmd: DspCommand) -> Result<(), DspError> {
        self.post(cmd)?;
        self.mic.wakeup_reader();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preroll_holds_half_a_second_plus_wake_phrase() {
        let cfg = DspConfig::default();
        assert_eq!(cfg.voice_format(), PcmFormat::VOICE);
        assert_eq!(cfg.wake_word_bytes(), 19_200);
        assert_eq!(cfg.preroll_ring_bytes(), 32_000 / 2 + 19_200);
    }
}
