//! Null stream: a reader that never produces data and a writer that hands
//! bytes to an optional callback.
//!
//! Useful as a placeholder endpoint in a pipeline (e.g. draining a ring
//! whose consumer is not wired yet) or as a tap.

use super::{StreamContext, StreamIo};
use crate::error::StreamError;

pub type WriteTap = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
pub struct NullStream {
    tap: Option<WriteTap>,
    written: u64,
}

impl NullStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward written bytes to `tap` instead of dropping them.
    pub fn with_tap(tap: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self {
            tap: Some(Box::new(tap)),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl StreamIo for NullStream {
    fn init(&mut self, _ctx: &StreamContext) -> Result<(), StreamError> {
        self.written = 0;
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, StreamError> {
        // Pace the caller's loop; there is never anything to read.
        std::thread::sleep(super::DEFAULT_IO_WAIT);
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        if let Some(tap) = self.tap.as_mut() {
            tap(buf);
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tap_receives_written_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut stream = NullStream::with_tap(move |b| sink.lock().unwrap().extend_from_slice(b));
        stream.init(&StreamContext::detached("null")).unwrap();

        assert_eq!(stream.write(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(stream.bytes_written(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
