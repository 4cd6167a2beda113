//! Wake word detector seam.
//!
//! The neural model itself lives outside this crate. The capture pipeline
//! only needs its input shape and a yes/no per frame.

/// A frame-at-a-time wake word detector.
pub trait WakeWordEngine: Send + 'static {
    /// Rate of the 16-bit mono samples `detect` expects.
    fn sample_rate(&self) -> u32;

    /// Samples per `detect` call.
    fn chunk_size(&self) -> usize;

    /// `true` when the frame completes the wake phrase.
    fn detect(&mut self, frame: &[i16]) -> bool;
}

/// Detector that never fires. Capture is then only reachable through
/// tap-to-talk or an explicit start.
#[derive(Debug, Clone, Copy)]
pub struct NeverWake {
    sample_rate: u32,
    chunk_size: usize,
}

impl NeverWake {
    pub fn new(sample_rate: u32, chunk_size: usize) -> Self {
        Self {
            sample_rate,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for NeverWake {
    fn default() -> Self {
        // 30 ms at 16 kHz
        Self::new(16_000, 480)
    }
}

impl WakeWordEngine for NeverWake {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn detect(&mut self, _frame: &[i16]) -> bool {
        false
    }
}
