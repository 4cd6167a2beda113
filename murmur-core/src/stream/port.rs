//! Where a reader stream's bytes go and where a writer stream's bytes come
//! from.
//!
//! Ring halves are the usual ports. The anchored variants also carry
//! `StreamMarker`s in-band, so a format change or discontinuity reaches
//! the consumer exactly at the byte where it happened.

use std::sync::Arc;

use parking_lot::Mutex;

use super::StreamMarker;
use crate::buffering::{AnchoredConsumer, AnchoredProducer, RingConsumer, RingProducer, Wait};
use crate::error::{RingError, StreamError};

/// Output of a reader stream.
pub trait StreamSink: Send {
    /// Accept up to `buf.len()` bytes, blocking up to `wait`.
    fn write(&mut self, buf: &[u8], wait: Wait) -> Result<usize, StreamError>;

    /// End-of-stream: the zero-length write pushed when a reader stops.
    fn finish(&mut self) -> Result<(), StreamError>;

    /// Bind `marker` to the current stream position.
    fn mark(&mut self, _marker: StreamMarker) {}
}

/// Input of a writer stream.
pub trait StreamSource: Send {
    /// Fill up to `buf.len()` bytes. `Ok(0)` means nothing yet.
    fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, StreamError>;

    /// A marker reached at the current position, if any.
    fn take_marker(&mut self) -> Option<StreamMarker> {
        None
    }
}

impl StreamSink for RingProducer {
    fn write(&mut self, buf: &[u8], wait: Wait) -> Result<usize, StreamError> {
        Ok(RingProducer::write(self, buf, wait)?)
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        RingProducer::finish(self);
        Ok(())
    }
}

impl StreamSource for RingConsumer {
    fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, StreamError> {
        Ok(RingConsumer::read(self, buf, wait)?)
    }
}

impl StreamSink for AnchoredProducer<StreamMarker> {
    fn write(&mut self, buf: &[u8], wait: Wait) -> Result<usize, StreamError> {
        Ok(AnchoredProducer::write(self, buf, wait)?)
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        AnchoredProducer::finish(self);
        Ok(())
    }

    fn mark(&mut self, marker: StreamMarker) {
        self.put_anchor_at_current(marker);
    }
}

/// Anchored ring consumer that parks the due anchor for `take_marker`.
pub struct MarkedSource {
    inner: AnchoredConsumer<StreamMarker>,
    due: Option<StreamMarker>,
}

impl MarkedSource {
    pub fn new(inner: AnchoredConsumer<StreamMarker>) -> Self {
        Self { inner, due: None }
    }
}

impl StreamSource for MarkedSource {
    fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, StreamError> {
        if self.due.is_some() {
            return Ok(0);
        }
        match self.inner.read(buf, wait) {
            Ok(n) => Ok(n),
            Err(RingError::FetchAnchor) => {
                self.due = Some(self.inner.get_anchor()?.payload);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn take_marker(&mut self) -> Option<StreamMarker> {
        self.due.take()
    }
}

/// Shared in-memory sink, handy for capture taps and tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    bytes: Arc<Mutex<Vec<u8>>>,
    finished: Arc<Mutex<usize>>,
    marks: Arc<Mutex<Vec<(usize, StreamMarker)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// How many end-of-stream signals arrived.
    pub fn finish_count(&self) -> usize {
        *self.finished.lock()
    }

    /// Markers with the byte position they were placed at.
    pub fn marks(&self) -> Vec<(usize, StreamMarker)> {
        self.marks.lock().clone()
    }
}

impl StreamSink for MemorySink {
    fn write(&mut self, buf: &[u8], _wait: Wait) -> Result<usize, StreamError> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        *self.finished.lock() += 1;
        Ok(())
    }

    fn mark(&mut self, marker: StreamMarker) {
        let at = self.bytes.lock().len();
        self.marks.lock().push((at, marker));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::AnchoredRingBuffer;

    #[test]
    fn marked_source_surfaces_marker_at_its_offset() {
        let (mut tx, rx) = AnchoredRingBuffer::new::<StreamMarker>("marked", 32).unwrap();
        let mut source = MarkedSource::new(rx);

        StreamSink::write(&mut tx, &[1, 2, 3], Wait::NoWait).unwrap();
        tx.mark(StreamMarker::Discontinuity);
        StreamSink::write(&mut tx, &[4, 5], Wait::NoWait).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf, Wait::NoWait).unwrap(), 3);
        assert_eq!(source.read(&mut buf, Wait::NoWait).unwrap(), 0);
        assert_eq!(source.take_marker(), Some(StreamMarker::Discontinuity));
        assert_eq!(source.read(&mut buf, Wait::NoWait).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[test]
    fn ring_source_maps_writer_finished_to_end_of_stream() {
        let (mut tx, mut rx) = crate::buffering::RingBuffer::new("eos", 8).unwrap();
        StreamSink::finish(&mut tx).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            StreamSource::read(&mut rx, &mut buf, Wait::NoWait),
            Err(StreamError::EndOfStream)
        ));
    }
}
