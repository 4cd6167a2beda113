//! I2S stream backend over the board HAL.
//!
//! A reader holds the capture claim while running; a writer holds the
//! playback claim. Claims are taken in `init` and dropped in `cleanup`, so
//! two concurrent I2S readers fail loudly instead of interleaving reads.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, info};

use super::{StreamContext, StreamEvent, StreamIo, StreamMarker};
use crate::buffering::chunk::PcmFormat;
use crate::error::StreamError;
use crate::hal::{CaptureClaim, MediaHal, PlaybackClaim};

const IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Mutes a running writer without stopping it.
#[derive(Clone)]
pub struct I2sWriterControl {
    enabled: Arc<AtomicBool>,
}

impl I2sWriterControl {
    /// While disabled, written audio is swallowed and the DMA is zeroed.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

pub struct I2sStream {
    media: MediaHal,
    role: Role,
    format: PcmFormat,
    enabled: Arc<AtomicBool>,
    announce: bool,
}

enum Role {
    Reader(Option<CaptureClaim>),
    Writer(Option<PlaybackClaim>),
}

impl I2sStream {
    pub fn reader(media: MediaHal) -> Self {
        let format = media.capture_format();
        Self {
            media,
            role: Role::Reader(None),
            format,
            enabled: Arc::new(AtomicBool::new(true)),
            announce: false,
        }
    }

    pub fn writer(media: MediaHal, format: PcmFormat) -> Self {
        Self {
            media,
            role: Role::Writer(None),
            format,
            enabled: Arc::new(AtomicBool::new(true)),
            announce: false,
        }
    }

    pub fn writer_control(&self) -> I2sWriterControl {
        I2sWriterControl {
            enabled: Arc::clone(&self.enabled),
        }
    }
}

fn hal_err(e: crate::error::MurmurError) -> StreamError {
    StreamError::Hal(e.to_string())
}

impl StreamIo for I2sStream {
    fn init(&mut self, ctx: &StreamContext) -> Result<(), StreamError> {
        match &mut self.role {
            Role::Reader(slot) => {
                let mut claim = self.media.claim_capture().map_err(hal_err)?;
                claim.start().map_err(hal_err)?;
                self.format = claim.format();
                *slot = Some(claim);
                self.announce = true;
            }
            Role::Writer(slot) => {
                let mut claim = self.media.claim_playback().map_err(hal_err)?;
                claim.set_format(self.format).map_err(hal_err)?;
                claim.start().map_err(hal_err)?;
                *slot = Some(claim);
            }
        }
        info!(
            stream = ctx.name(),
            sample_rate = self.format.sample_rate,
            channels = self.format.channels,
            "i2s started"
        );
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let Role::Reader(Some(claim)) = &mut self.role else {
            return Err(StreamError::NotAttached("i2s capture"));
        };
        claim.read(buf, IO_TIMEOUT).map_err(hal_err)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let Role::Writer(Some(claim)) = &mut self.role else {
            return Err(StreamError::NotAttached("i2s playback"));
        };
        let enabled = self.enabled.load(Ordering::Acquire);
        if claim.is_enabled() != enabled {
            debug!(enabled, "i2s writer toggled");
            claim.set_enabled(enabled);
        }
        claim.write(buf, IO_TIMEOUT).map_err(hal_err)
    }

    fn cleanup(&mut self) {
        match &mut self.role {
            Role::Reader(slot) => {
                slot.take();
            }
            Role::Writer(slot) => {
                if let Some(mut claim) = slot.take() {
                    claim.silence();
                }
            }
        }
    }

    fn on_event(&mut self, event: &StreamEvent) {
        if matches!(
            event,
            StreamEvent::Paused | StreamEvent::Stopped | StreamEvent::Destroyed
        ) {
            if let Role::Writer(Some(claim)) = &mut self.role {
                claim.silence();
            }
        }
    }

    fn take_marker(&mut self) -> Option<StreamMarker> {
        if std::mem::take(&mut self.announce) {
            Some(StreamMarker::Format(self.format))
        } else {
            None
        }
    }

    fn apply_marker(&mut self, marker: &StreamMarker) -> Result<(), StreamError> {
        if let (StreamMarker::Format(format), Role::Writer(Some(claim))) = (marker, &mut self.role) {
            claim.set_format(*format).map_err(hal_err)?;
            self.format = *format;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::LoopbackHal;

    #[test]
    fn second_reader_cannot_init_while_first_holds_capture() {
        let media = MediaHal::new(Arc::new(LoopbackHal::new()));
        let ctx = StreamContext::detached("i2s");
        let mut first = I2sStream::reader(media.clone());
        let mut second = I2sStream::reader(media);

        first.init(&ctx).unwrap();
        assert!(matches!(second.init(&ctx), Err(StreamError::Hal(_))));
        first.cleanup();
        second.init(&ctx).unwrap();
    }

    #[test]
    fn writer_applies_format_marker_and_mutes() {
        let hal = Arc::new(LoopbackHal::new());
        let media = MediaHal::new(hal.clone());
        let mut writer = I2sStream::writer(media, PcmFormat::VOICE);
        let control = writer.writer_control();
        writer.init(&StreamContext::detached("spk")).unwrap();
        assert_eq!(hal.clock(), Some(PcmFormat::VOICE));

        let cd = PcmFormat::new(44_100, 2, 16);
        writer.apply_marker(&StreamMarker::Format(cd)).unwrap();
        assert_eq!(hal.clock(), Some(cd));

        writer.write(&[1, 2]).unwrap();
        control.set_enabled(false);
        writer.write(&[3, 4]).unwrap();
        assert_eq!(hal.played(), vec![1, 2]);

        writer.on_event(&StreamEvent::Paused);
        assert!(hal.silence_calls() >= 2);
    }
}
