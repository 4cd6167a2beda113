//! In-memory HAL for host bring-up and tests.
//!
//! Captured audio is whatever was fed with `push_capture`; played audio
//! accumulates in a buffer readable through `played`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::AudioHal;
use crate::buffering::chunk::PcmFormat;
use crate::error::Result;

pub struct LoopbackHal {
    capture: Mutex<VecDeque<u8>>,
    capture_ready: Condvar,
    played: Mutex<Vec<u8>>,
    clock: Mutex<Option<PcmFormat>>,
    capture_format: PcmFormat,
    running: AtomicBool,
    silence_calls: AtomicUsize,
}

impl LoopbackHal {
    pub fn new() -> Self {
        Self::with_capture_format(PcmFormat::MIC_RAW)
    }

    pub fn with_capture_format(capture_format: PcmFormat) -> Self {
        Self {
            capture: Mutex::new(VecDeque::new()),
            capture_ready: Condvar::new(),
            played: Mutex::new(Vec::new()),
            clock: Mutex::new(None),
            capture_format,
            running: AtomicBool::new(false),
            silence_calls: AtomicUsize::new(0),
        }
    }

    /// Queue bytes for the capture side.
    pub fn push_capture(&self, bytes: &[u8]) {
        self.capture.lock().extend(bytes.iter().copied());
        self.capture_ready.notify_all();
    }

    pub fn played(&self) -> Vec<u8> {
        self.played.lock().clone()
    }

    pub fn clock(&self) -> Option<PcmFormat> {
        *self.clock.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn silence_calls(&self) -> usize {
        self.silence_calls.load(Ordering::Relaxed)
    }
}

impl Default for LoopbackHal {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHal for LoopbackHal {
    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.capture_ready.notify_all();
        Ok(())
    }

    fn set_clock(&self, sample_rate: u32, bits_per_sample: u16, channels: u16) -> Result<()> {
        *self.clock.lock() = Some(PcmFormat::new(sample_rate, channels, bits_per_sample));
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut capture = self.capture.lock();
        while capture.is_empty() && self.is_running() {
            if self.capture_ready.wait_until(&mut capture, deadline).timed_out() {
                break;
            }
        }
        let n = buf.len().min(capture.len());
        for (dst, src) in buf.iter_mut().zip(capture.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], _timeout: Duration) -> Result<usize> {
        self.played.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn silence(&self) {
        self.silence_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn capture_format(&self) -> PcmFormat {
        self.capture_format
    }
}
