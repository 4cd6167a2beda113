//! Mic ring, preroll ring and the flags that gate who reads them.
//!
//! The mic ring is read by two parties: the wake word thread while
//! `detect` is set, and the command consumer while a dialog streams.
//! The consumer half sits behind a mutex so only one of them holds it at
//! a time. Every byte the wake word thread takes from the mic ring lands
//! in the preroll ring before it lets go of the mic. A wake word hit marks
//! the preroll `Pending`; the next dialog read, also under the mic lock,
//! replays the preroll ring before switching to live mic bytes, so the
//! speech that follows the wake phrase reaches the dialog in order.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::state::CaptureBackend;
use crate::buffering::{RingConsumer, RingControl, RingProducer, Wait};
use crate::error::RingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrerollStatus {
    Idle,
    Pending,
    Sent,
}

/// Flags shared by the resample thread, the wake word thread and the
/// command consumer.
#[derive(Debug)]
pub struct CaptureGate {
    detect: AtomicBool,
    muted: AtomicBool,
    preroll: Mutex<PrerollStatus>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self {
            detect: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            preroll: Mutex::new(PrerollStatus::Idle),
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.detect.load(Ordering::Acquire)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn preroll(&self) -> PrerollStatus {
        *self.preroll.lock()
    }

    pub fn set_preroll(&self, status: PrerollStatus) {
        *self.preroll.lock() = status;
    }

    fn set_detect(&self, on: bool) {
        self.detect.store(on, Ordering::Release);
    }

    fn set_muted(&self, on: bool) {
        self.muted.store(on, Ordering::Release);
    }
}

impl Default for CaptureGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the capture buffers, shared with the wake word thread.
#[derive(Clone)]
pub struct MicTap {
    gate: Arc<CaptureGate>,
    mic: Arc<Mutex<RingConsumer>>,
    mic_control: RingControl,
    preroll: Arc<Mutex<RingConsumer>>,
    wake_word_len: usize,
}

impl MicTap {
    pub fn new(
        gate: Arc<CaptureGate>,
        mic: RingConsumer,
        preroll: RingConsumer,
        wake_word_len: usize,
    ) -> Self {
        let mic_control = mic.control();
        Self {
            gate,
            mic: Arc::new(Mutex::new(mic)),
            mic_control,
            preroll: Arc::new(Mutex::new(preroll)),
            wake_word_len,
        }
    }

    pub fn gate(&self) -> &Arc<CaptureGate> {
        &self.gate
    }

    pub fn mic_control(&self) -> &RingControl {
        &self.mic_control
    }

    /// Read voice audio for the dialog: preroll first when a dialog
    /// follows a wake word, live mic bytes otherwise.
    pub fn stream_audio(&self, buf: &mut [u8], wait: Wait) -> Result<usize, RingError> {
        let mut mic = self.mic.lock();
        if !self.gate.is_detecting() && self.gate.preroll() == PrerollStatus::Pending {
            let n = self.preroll.lock().read(buf, Wait::NoWait)?;
            if n > 0 {
                return Ok(n);
            }
            debug!("preroll drained, switching to live mic");
            self.gate.set_preroll(PrerollStatus::Sent);
        }
        mic.read(buf, wait)
    }

    /// Read mic bytes for the wake word detector and copy them into the
    /// preroll ring while the mic is still held.
    ///
    /// Returns `Ok(0)` without reading once detection is off. Bytes that
    /// arrive after a dialog opened without a wake word become the whole
    /// preroll, so the dialog still gets them first.
    pub fn detect_audio(
        &self,
        preroll: &mut RingProducer,
        buf: &mut [u8],
        wait: Wait,
    ) -> Result<usize, RingError> {
        let mut mic = self.mic.lock();
        if !self.gate.is_detecting() {
            return Ok(0);
        }
        let n = mic.read(buf, wait)?;
        if n == 0 {
            return Ok(0);
        }
        if !self.gate.is_detecting() && self.gate.preroll() != PrerollStatus::Pending {
            let mut stale = self.preroll.lock();
            let filled = stale.filled();
            if filled > 0 {
                stale.discard(filled, Wait::NoWait)?;
            }
            drop(stale);
            self.gate.set_preroll(PrerollStatus::Pending);
            debug!(bytes = n, "handing detector bytes to the dialog");
        }
        self.push_preroll(preroll, &buf[..n])?;
        Ok(n)
    }

    /// Keep the newest audio in the preroll ring, dropping the oldest bytes
    /// to make room.
    pub fn push_preroll(&self, producer: &mut RingProducer, frame: &[u8]) -> Result<(), RingError> {
        let frame = &frame[frame.len().saturating_sub(producer.capacity())..];
        let room = producer.available();
        if room < frame.len() {
            self.preroll.lock().discard(frame.len() - room, Wait::NoWait)?;
        }
        producer.write(frame, Wait::NoWait)?;
        Ok(())
    }
}

/// `CaptureBackend` over the shared mic and preroll rings.
pub struct MicCapture {
    tap: MicTap,
}

impl MicCapture {
    pub fn new(tap: MicTap) -> Self {
        Self { tap }
    }
}

impl CaptureBackend for MicCapture {
    fn start_capture(&mut self) {
        self.tap.gate.set_detect(false);
    }

    fn stop_capture(&mut self) {
        self.tap.gate.set_preroll(PrerollStatus::Idle);
        self.tap.gate.set_detect(true);
    }

    fn mute(&mut self) {
        self.tap.gate.set_muted(true);
        self.tap.gate.set_detect(false);
    }

    fn unmute(&mut self) {
        self.tap.gate.set_muted(false);
        self.tap.gate.set_preroll(PrerollStatus::Idle);
        self.tap.gate.set_detect(true);
    }

    fn wake_word_len(&self) -> usize {
        self.tap.wake_word_len
    }

    fn read_audio(&mut self, buf: &mut [u8]) -> Result<usize, RingError> {
        self.tap.stream_audio(buf, Wait::Forever)
    }
}
