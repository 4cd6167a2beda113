//! Capture state machine.
//!
//! Only the command-consumer thread owns a `DspStateMachine`, so capture
//! state has exactly one mutator. Everything else talks to it through
//! `DspCommand`s.
//!
//! | State     | Command              | Action                                   | Next              |
//! |-----------|----------------------|------------------------------------------|-------------------|
//! | Stopped   | WakeWord             | recognize(wake word), then GetAudio      | Streaming         |
//! | Stopped   | TapToTalk            | recognize(tap), then GetAudio            | Streaming         |
//! | Stopped   | StartMic             | start capture, then GetAudio             | Streaming         |
//! | Stopped   | Mute                 | mute mic                                 | Muted             |
//! | Streaming | GetAudio             | read, forward, GetAudio again            | Streaming/Stopped |
//! | Streaming | TapToTalk / StopMic  | stop capture                             | Stopped           |
//! | Streaming | Mute                 | stop capture, mute mic                   | Muted             |
//! | Muted     | Unmute               | unmute mic                               | Stopped           |
//!
//! Any other pair is logged and dropped. A failed recognize keeps the
//! machine in Stopped with capture stopped.

use std::sync::{atomic::Ordering, Arc};

use tracing::{debug, info, warn};

use super::pipeline::PipelineDiagnostics;
use crate::error::{DspError, RingError};
use crate::events::{CaptureState, DialogTrigger};

/// Bytes pulled from capture per `GetAudio`.
pub const AUDIO_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspCommand {
    WakeWord,
    TapToTalk,
    StartMic,
    StopMic,
    GetAudio,
    Mute,
    Unmute,
}

/// Why a dialog is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// `phrase_bytes` of the wake phrase lead the audio that follows.
    WakeWord { phrase_bytes: usize },
    Tap,
}

/// Consumer of captured speech.
pub trait SpeechRecognizer: Send + 'static {
    /// Open a dialog. `Err` refuses it and capture is stopped.
    fn recognize(&mut self, initiator: Initiator) -> Result<(), DspError>;

    /// One chunk of 16 kHz mono s16le audio from the open dialog.
    fn on_audio(&mut self, chunk: &[u8]);
}

/// The capture hardware as the state machine sees it.
pub trait CaptureBackend: Send + 'static {
    /// Route mic audio to `read_audio` instead of the wake word detector.
    fn start_capture(&mut self);

    /// Hand the mic back to the wake word detector.
    fn stop_capture(&mut self);

    fn mute(&mut self);

    fn unmute(&mut self);

    /// Length in bytes of the wake phrase replayed ahead of live audio.
    /// Zero means the detector cannot report it.
    fn wake_word_len(&self) -> usize;

    /// Blocking read of capture audio. `Err(RingError::Unblocked)` asks the
    /// caller to look at its queue and retry.
    fn read_audio(&mut self, buf: &mut [u8]) -> Result<usize, RingError>;
}

/// Outcome of one command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Command the machine posts to itself, served after the queue drains.
    pub follow_up: Option<DspCommand>,
    /// Set when this command opened a dialog.
    pub trigger: Option<DialogTrigger>,
}

impl Step {
    fn idle() -> Self {
        Self::default()
    }

    fn again(cmd: DspCommand) -> Self {
        Self {
            follow_up: Some(cmd),
            trigger: None,
        }
    }
}

pub struct DspStateMachine<B: CaptureBackend> {
    backend: B,
    recognizer: Box<dyn SpeechRecognizer>,
    state: CaptureState,
    buf: Vec<u8>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl<B: CaptureBackend> DspStateMachine<B> {
    pub fn new(
        backend: B,
        recognizer: Box<dyn SpeechRecognizer>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            backend,
            recognizer,
            state: CaptureState::Stopped,
            buf: vec![0u8; AUDIO_BUF_SIZE],
            diagnostics,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn handle(&mut self, cmd: DspCommand) -> Step {
        use CaptureState::{Muted, Stopped, Streaming};
        use DspCommand::*;

        self.diagnostics.commands_handled.fetch_add(1, Ordering::Relaxed);
        match (self.state, cmd) {
            (Stopped, WakeWord) => {
                let phrase_bytes = self.backend.wake_word_len();
                if phrase_bytes == 0 {
                    warn!("wake word detected but its length is unknown, ignoring");
                    return Step::idle();
                }
                self.open_dialog(Initiator::WakeWord { phrase_bytes })
            }
            (Stopped, TapToTalk) => self.open_dialog(Initiator::Tap),
            (Stopped, StartMic) => {
                self.start_streaming();
                Step {
                    follow_up: Some(GetAudio),
                    trigger: Some(DialogTrigger::Manual),
                }
            }
            (Stopped | Streaming, Mute) => {
                if self.state == Streaming {
                    self.backend.stop_capture();
                }
                self.backend.mute();
                self.state = Muted;
                info!("mic muted");
                Step::idle()
            }
            (Streaming, GetAudio) => self.pump_audio(),
            (Streaming, TapToTalk | StopMic) => {
                self.stop_streaming();
                Step::idle()
            }
            (Muted, Unmute) => {
                self.backend.unmute();
                self.state = Stopped;
                info!("mic unmuted");
                Step::idle()
            }
            (state, cmd) => {
                self.diagnostics.commands_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(?state, ?cmd, "command unsupported in this state, dropped");
                Step::idle()
            }
        }
    }

    fn open_dialog(&mut self, initiator: Initiator) -> Step {
        match self.recognizer.recognize(initiator) {
            Ok(()) => {
                self.diagnostics.dialogs_opened.fetch_add(1, Ordering::Relaxed);
                info!(?initiator, "dialog opened, streaming mic");
                self.start_streaming();
                let trigger = match initiator {
                    Initiator::WakeWord { .. } => DialogTrigger::Wakeword,
                    Initiator::Tap => DialogTrigger::Tap,
                };
                Step {
                    follow_up: Some(DspCommand::GetAudio),
                    trigger: Some(trigger),
                }
            }
            Err(e) => {
                self.diagnostics.recognize_errors.fetch_add(1, Ordering::Relaxed);
                warn!(?initiator, error = %e, "recognizer refused dialog, stopping capture");
                self.backend.stop_capture();
                Step::idle()
            }
        }
    }

    fn pump_audio(&mut self) -> Step {
        match self.backend.read_audio(&mut self.buf) {
            Ok(n) if n > 0 => {
                self.recognizer.on_audio(&self.buf[..n]);
                self.diagnostics.chunks_forwarded.fetch_add(1, Ordering::Relaxed);
                Step::again(DspCommand::GetAudio)
            }
            // A command is waiting; it runs before the re-posted read.
            Err(RingError::Unblocked) => Step::again(DspCommand::GetAudio),
            Ok(_) => {
                self.diagnostics.read_failures.fetch_add(1, Ordering::Relaxed);
                warn!("capture read returned nothing, stopping");
                self.stop_streaming();
                Step::idle()
            }
            Err(e) => {
                self.diagnostics.read_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "capture read failed, stopping");
                self.stop_streaming();
                Step::idle()
            }
        }
    }

    fn start_streaming(&mut self) {
        self.backend.start_capture();
        self.state = CaptureState::Streaming;
    }

    fn stop_streaming(&mut self) {
        self.backend.stop_capture();
        self.state = CaptureState::Stopped;
        info!("capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct Calls {
        log: Vec<&'static str>,
        reads: VecDeque<Result<usize, RingError>>,
    }

    struct ScriptedBackend(Arc<Mutex<Calls>>);

    impl CaptureBackend for ScriptedBackend {
        fn start_capture(&mut self) {
            self.0.lock().log.push("start");
        }
        fn stop_capture(&mut self) {
            self.0.lock().log.push("stop");
        }
        fn mute(&mut self) {
            self.0.lock().log.push("mute");
        }
        fn unmute(&mut self) {
            self.0.lock().log.push("unmute");
        }
        fn wake_word_len(&self) -> usize {
            19_200
        }
        fn read_audio(&mut self, _buf: &mut [u8]) -> Result<usize, RingError> {
            self.0.lock().reads.pop_front().unwrap_or(Ok(0))
        }
    }

    struct Recorder {
        accept: bool,
        initiators: Arc<Mutex<Vec<Initiator>>>,
        chunks: Arc<Mutex<usize>>,
    }

    impl SpeechRecognizer for Recorder {
        fn recognize(&mut self, initiator: Initiator) -> Result<(), DspError> {
            self.initiators.lock().push(initiator);
            if self.accept {
                Ok(())
            } else {
                Err(DspError::Recognizer("busy".into()))
            }
        }
        fn on_audio(&mut self, _chunk: &[u8]) {
            *self.chunks.lock() += 1;
        }
    }

    struct Rig {
        sm: DspStateMachine<ScriptedBackend>,
        calls: Arc<Mutex<Calls>>,
        initiators: Arc<Mutex<Vec<Initiator>>>,
        chunks: Arc<Mutex<usize>>,
    }

    fn rig(accept: bool) -> Rig {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let initiators = Arc::new(Mutex::new(Vec::new()));
        let chunks = Arc::new(Mutex::new(0));
        let sm = DspStateMachine::new(
            ScriptedBackend(Arc::clone(&calls)),
            Box::new(Recorder {
                accept,
                initiators: Arc::clone(&initiators),
                chunks: Arc::clone(&chunks),
            }),
            Arc::new(PipelineDiagnostics::default()),
        );
        Rig {
            sm,
            calls,
            initiators,
            chunks,
        }
    }

    #[test]
    fn wake_word_dialog_forwards_until_read_fails() {
        let mut r = rig(true);
        r.calls.lock().reads.extend([Ok(4096), Ok(4096), Ok(100), Err(RingError::Aborted)]);

        let mut step = r.sm.handle(DspCommand::WakeWord);
        assert_eq!(step.trigger, Some(DialogTrigger::Wakeword));
        assert_eq!(r.sm.state(), CaptureState::Streaming);
        while let Some(cmd) = step.follow_up {
            step = r.sm.handle(cmd);
        }

        assert_eq!(r.sm.state(), CaptureState::Stopped);
        assert_eq!(
            *r.initiators.lock(),
            vec![Initiator::WakeWord { phrase_bytes: 19_200 }]
        );
        assert_eq!(*r.chunks.lock(), 3);
        assert_eq!(r.calls.lock().log, vec!["start", "stop"]);
    }

    #[test]
    fn refused_dialog_stays_stopped() {
        let mut r = rig(false);
        let step = r.sm.handle(DspCommand::TapToTalk);
        assert_eq!(step, Step::default());
        assert_eq!(r.sm.state(), CaptureState::Stopped);
        assert_eq!(r.calls.lock().log, vec!["stop"]);
        assert_eq!(*r.initiators.lock(), vec![Initiator::Tap]);
    }

    #[test]
    fn unblocked_read_reposts_without_forwarding() {
        let mut r = rig(true);
        r.calls.lock().reads.push_back(Err(RingError::Unblocked));
        r.sm.handle(DspCommand::StartMic);
        let step = r.sm.handle(DspCommand::GetAudio);
        assert_eq!(step.follow_up, Some(DspCommand::GetAudio));
        assert_eq!(r.sm.state(), CaptureState::Streaming);
        assert_eq!(*r.chunks.lock(), 0);
    }

    #[test]
    fn mute_from_streaming_stops_capture_first() {
        let mut r = rig(true);
        r.sm.handle(DspCommand::StartMic);
        r.sm.handle(DspCommand::Mute);
        assert_eq!(r.sm.state(), CaptureState::Muted);
        assert_eq!(r.calls.lock().log, vec!["start", "stop", "mute"]);

        for cmd in [
            DspCommand::WakeWord,
            DspCommand::TapToTalk,
            DspCommand::StartMic,
            DspCommand::GetAudio,
            DspCommand::Mute,
        ] {
            assert_eq!(r.sm.handle(cmd), Step::default());
            assert_eq!(r.sm.state(), CaptureState::Muted);
        }

        r.sm.handle(DspCommand::Unmute);
        assert_eq!(r.sm.state(), CaptureState::Stopped);
        assert_eq!(r.calls.lock().log.last(), Some(&"unmute"));
    }

    #[test]
    fn unhandled_pairs_are_dropped() {
        let mut r = rig(true);
        assert_eq!(r.sm.handle(DspCommand::GetAudio), Step::default());
        assert_eq!(r.sm.handle(DspCommand::StopMic), Step::default());
        assert_eq!(r.sm.handle(DspCommand::Unmute), Step::default());
        assert_eq!(r.sm.state(), CaptureState::Stopped);
        assert!(r.calls.lock().log.is_empty());
        let snap = r.sm.diagnostics.snapshot();
        assert_eq!(snap.commands_ignored, 3);
    }
}
