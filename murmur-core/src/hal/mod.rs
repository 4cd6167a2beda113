//! Codec / I2S hardware abstraction.
//!
//! `AudioHal` is the capability a board support layer provides: clocking,
//! start/stop, and blocking byte I/O in both directions. `MediaHal` owns
//! one such device for the process and hands out at most one capture and
//! one playback claim at a time. A second claim fails instead of silently
//! sharing the device.
//!
//! ```text
//! MediaHal ──claim_capture()──► CaptureClaim ──► i2s reader stream / DSP
//!    │
//!    └──────claim_playback()──► PlaybackClaim ─► i2s writer stream
//! ```

#[cfg(feature = "audio-cpal")]
pub mod cpal;
pub mod loopback;

pub use loopback::LoopbackHal;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffering::chunk::PcmFormat;
use crate::error::{MurmurError, Result};

/// Board audio device. Implementations synchronise internally so capture
/// and playback can block concurrently.
pub trait AudioHal: Send + Sync + 'static {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Reconfigure the playback clock.
    fn set_clock(&self, sample_rate: u32, bits_per_sample: u16, channels: u16) -> Result<()>;

    /// Read captured s16le bytes. Returns `Ok(0)` on timeout.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Queue s16le bytes for playback. Returns the number accepted.
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Zero the output DMA so a paused stream does not loop stale audio.
    fn silence(&self) {}

    /// Format of the bytes `read` produces.
    fn capture_format(&self) -> PcmFormat {
        PcmFormat::MIC_RAW
    }
}

struct HalShared {
    hal: Arc<dyn AudioHal>,
    capture_claimed: AtomicBool,
    playback_claimed: AtomicBool,
    /// Active start() callers; the device runs while this is non-zero.
    active: Mutex<usize>,
    playback_format: Mutex<Option<PcmFormat>>,
    starts: AtomicUsize,
}

impl HalShared {
    fn acquire(&self) -> Result<()> {
        let mut active = self.active.lock();
        if *active == 0 {
            self.hal.start()?;
            self.starts.fetch_add(1, Ordering::Relaxed);
            info!("audio hal started");
        }
        *active += 1;
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut active = self.active.lock();
        match *active {
            0 => Ok(()),
            1 => {
                *active = 0;
                info!("audio hal stopped");
                self.hal.stop()
            }
            _ => {
                *active -= 1;
                Ok(())
            }
        }
    }
}

/// Owned handle to the board's audio device.
#[derive(Clone)]
pub struct MediaHal {
    shared: Arc<HalShared>,
}

impl MediaHal {
    pub fn new(hal: Arc<dyn AudioHal>) -> Self {
        Self {
            shared: Arc::new(HalShared {
                hal,
                capture_claimed: AtomicBool::new(false),
                playback_claimed: AtomicBool::new(false),
                active: Mutex::new(0),
                playback_format: Mutex::new(None),
                starts: AtomicUsize::new(0),
            }),
        }
    }

    /// Claim the capture direction.
    ///
    /// # Errors
    /// `MurmurError::AlreadyClaimed` while another claim is alive.
    pub fn claim_capture(&self) -> Result<CaptureClaim> {
        if self.shared.capture_claimed.swap(true, Ordering::AcqRel) {
            return Err(MurmurError::AlreadyClaimed { role: "capture" });
        }
        debug!("capture claimed");
        Ok(CaptureClaim {
            shared: Arc::clone(&self.shared),
            started: false,
        })
    }

    /// Claim the playback direction.
    pub fn claim_playback(&self) -> Result<PlaybackClaim> {
        if self.shared.playback_claimed.swap(true, Ordering::AcqRel) {
            return Err(MurmurError::AlreadyClaimed { role: "playback" });
        }
        debug!("playback claimed");
        Ok(PlaybackClaim {
            shared: Arc::clone(&self.shared),
            started: false,
            enabled: true,
        })
    }

    /// Number of times the underlying device has been powered up.
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::Relaxed)
    }

    pub fn capture_format(&self) -> PcmFormat {
        self.shared.hal.capture_format()
    }
}

/// Exclusive right to read captured audio. Released on drop.
pub struct CaptureClaim {
    shared: Arc<HalShared>,
    started: bool,
}

impl CaptureClaim {
    pub fn start(&mut self) -> Result<()> {
        if !self.started {
            self.shared.acquire()?;
            self.started = true;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.started {
            self.started = false;
            self.shared.release()?;
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.shared.hal.read(buf, timeout)
    }

    pub fn format(&self) -> PcmFormat {
        self.shared.hal.capture_format()
    }
}

impl Drop for CaptureClaim {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("stopping hal on capture release: {e}");
        }
        self.shared.capture_claimed.store(false, Ordering::Release);
    }
}

/// Exclusive right to play audio. Released on drop.
pub struct PlaybackClaim {
    shared: Arc<HalShared>,
    started: bool,
    enabled: bool,
}

impl PlaybackClaim {
    pub fn start(&mut self) -> Result<()> {
        if !self.started {
            self.shared.acquire()?;
            self.started = true;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.started {
            self.shared.hal.silence();
            self.started = false;
            self.shared.release()?;
        }
        Ok(())
    }

    /// Set the clock only when the format actually changes.
    pub fn set_format(&mut self, format: PcmFormat) -> Result<()> {
        let mut current = self.shared.playback_format.lock();
        if *current != Some(format) {
            self.shared
                .hal
                .set_clock(format.sample_rate, format.bits_per_sample, format.channels)?;
            info!(
                sample_rate = format.sample_rate,
                channels = format.channels,
                "playback clock set"
            );
            *current = Some(format);
        }
        Ok(())
    }

    /// While disabled, `write` swallows data without touching the device.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled {
            self.shared.hal.silence();
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn write(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        if !self.enabled {
            return Ok(buf.len());
        }
        self.shared.hal.write(buf, timeout)
    }

    pub fn silence(&mut self) {
        self.shared.hal.silence();
    }
}

impl Drop for PlaybackClaim {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("stopping hal on playback release: {e}");
        }
        self.shared.playback_claimed.store(false, Ordering::Release);
    }
}
