//! Byte ring with offset-bound anchors.
//!
//! An anchor binds a payload to a position in the cumulative byte stream.
//! The reader never crosses an anchor: when the next unread byte sits at or
//! past the earliest anchor, `read` returns `FetchAnchor` until the caller
//! pops it with `get_anchor`. Playback uses this to deliver mid-stream
//! events (a new segment, a discontinuity) exactly where they belong in
//! the audio.
//!
//! An anchor must be placed before the byte at its offset is written. The
//! reader publishes the range it is about to read under the anchors lock,
//! and `put_anchor` checks that range under the same lock, so an anchor
//! landing inside an in-flight read always wakes it.
//!
//! Reads take `&mut AnchoredConsumer`, so one reader at a time is a type
//! property. `reset` additionally takes the internal read gate so it never
//! races an in-flight read.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::ring::{RingBuffer, RingConsumer, RingControl, RingProducer, Wait};
use crate::error::RingError;

/// A payload bound to a stream offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor<T> {
    pub offset: u64,
    pub payload: T,
}

struct AnchorShared<T> {
    ring: RingControl,
    anchors: Mutex<VecDeque<Anchor<T>>>,
    /// Bytes handed to the reader since creation or the last reset.
    read_offset: AtomicU64,
    /// End of the range an in-flight read may cover; equals `read_offset`
    /// when no read is running. Both offsets change only under `anchors`.
    read_end: AtomicU64,
    /// Bytes accepted from the writer since creation or the last reset.
    write_offset: AtomicU64,
    read_gate: Mutex<()>,
}

impl<T> AnchorShared<T> {
    fn put_anchor(&self, offset: u64, payload: T) {
        let mut anchors = self.anchors.lock();
        // Stable for equal offsets: insert after existing anchors at `offset`.
        let idx = anchors.partition_point(|a| a.offset <= offset);
        anchors.insert(idx, Anchor { offset, payload });

        let read_offset = self.read_offset.load(Ordering::Acquire);
        let read_end = self.read_end.load(Ordering::Acquire);
        if offset <= read_offset || offset < read_end {
            self.ring.wakeup_reader();
        }
        drop(anchors);
        debug!(name = self.ring.name(), offset, read_offset, "anchor placed");
    }

    /// Publish the read position with no read in flight.
    fn settle(&self, read_offset: u64) {
        let _anchors = self.anchors.lock();
        self.read_offset.store(read_offset, Ordering::Release);
        self.read_end.store(read_offset, Ordering::Release);
    }
}

/// Constructor namespace for an anchored ring.
pub struct AnchoredRingBuffer;

impl AnchoredRingBuffer {
    pub fn new<T>(
        name: impl Into<String>,
        size: usize,
    ) -> Result<(AnchoredProducer<T>, AnchoredConsumer<T>), RingError> {
        let (producer, consumer) = RingBuffer::new(name, size)?;
        let shared = Arc::new(AnchorShared {
            ring: producer.control(),
            anchors: Mutex::new(VecDeque::new()),
            read_offset: AtomicU64::new(0),
            read_end: AtomicU64::new(0),
            write_offset: AtomicU64::new(0),
            read_gate: Mutex::new(()),
        });

        Ok((
            AnchoredProducer {
                inner: producer,
                shared: Arc::clone(&shared),
            },
            AnchoredConsumer {
                inner: consumer,
                shared,
            },
        ))
    }
}

/// The writing half.
pub struct AnchoredProducer<T> {
    inner: RingProducer,
    shared: Arc<AnchorShared<T>>,
}

impl<T> AnchoredProducer<T> {
    pub fn write(&mut self, src: &[u8], wait: Wait) -> Result<usize, RingError> {
        let n = self.inner.write(src, wait)?;
        self.shared.write_offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    pub fn put_anchor(&self, offset: u64, payload: T) {
        self.shared.put_anchor(offset, payload);
    }

    /// Anchor `payload` right after the last byte written so far.
    pub fn put_anchor_at_current(&self, payload: T) -> u64 {
        let offset = self.shared.write_offset.load(Ordering::Acquire);
        self.shared.put_anchor(offset, payload);
        offset
    }

    pub fn finish(&mut self) {
        self.inner.finish();
    }

    pub fn control(&self) -> AnchoredControl<T> {
        AnchoredControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The reading half.
pub struct AnchoredConsumer<T> {
    inner: RingConsumer,
    shared: Arc<AnchorShared<T>>,
}

impl<T> AnchoredConsumer<T> {
    /// Read up to `buf.len()` bytes, stopping short of the next anchor.
    ///
    /// # Errors
    /// `FetchAnchor` when an anchor is due; everything `RingConsumer::read`
    /// can return otherwise.
    pub fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, RingError> {
        let _gate = self.shared.read_gate.lock();
        let read_offset = self.shared.read_offset.load(Ordering::Acquire);

        let limit = {
            let anchors = self.shared.anchors.lock();
            let limit = match anchors.front() {
                Some(a) if a.offset <= read_offset => return Err(RingError::FetchAnchor),
                Some(a) => buf.len().min(usize::try_from(a.offset - read_offset).unwrap_or(usize::MAX)),
                None => buf.len(),
            };
            self.shared
                .read_end
                .store(read_offset + limit as u64, Ordering::Release);
            limit
        };

        let result = self.inner.read(&mut buf[..limit], wait);
        let n = result.as_ref().map_or(0, |n| *n as u64);
        self.shared.settle(read_offset + n);
        result
    }

    /// Pop the earliest anchor.
    pub fn get_anchor(&mut self) -> Result<Anchor<T>, RingError> {
        self.shared
            .anchors
            .lock()
            .pop_front()
            .ok_or(RingError::NoAnchor)
    }

    /// Discard buffered bytes until the read offset reaches `upto`.
    /// Anchors are kept. Returns the read offset afterwards.
    pub fn drain(&mut self, upto: u64) -> u64 {
        let _gate = self.shared.read_gate.lock();
        let mut read_offset = self.shared.read_offset.load(Ordering::Acquire);

        while read_offset < upto {
            let want = usize::try_from(upto - read_offset).unwrap_or(usize::MAX);
            match self.inner.discard(want, Wait::NoWait) {
                Ok(0) => break,
                Ok(n) => read_offset += n as u64,
                // A stale wakeup; the writer may have more for us.
                Err(RingError::Unblocked) => continue,
                Err(_) => break,
            }
        }

        self.shared.settle(read_offset);
        debug!(name = self.shared.ring.name(), read_offset, upto, "drained");
        read_offset
    }

    pub fn read_offset(&self) -> u64 {
        self.shared.read_offset.load(Ordering::Acquire)
    }

    pub fn control(&self) -> AnchoredControl<T> {
        AnchoredControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Cloneable handle for anchor placement and lifecycle control.
pub struct AnchoredControl<T> {
    shared: Arc<AnchorShared<T>>,
}

impl<T> Clone for AnchoredControl<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> AnchoredControl<T> {
    pub fn put_anchor(&self, offset: u64, payload: T) {
        self.shared.put_anchor(offset, payload);
    }

    pub fn put_anchor_at_current(&self, payload: T) -> u64 {
        let offset = self.shared.read_offset.load(Ordering::Acquire) + self.shared.ring.filled() as u64;
        self.shared.put_anchor(offset, payload);
        offset
    }

    pub fn pending_anchors(&self) -> usize {
        self.shared.anchors.lock().len()
    }

    pub fn clear_anchors(&self) {
        self.shared.anchors.lock().clear();
    }

    pub fn ring(&self) -> &RingControl {
        &self.shared.ring
    }

    /// Abort, wait for any in-flight read to return, then clear the bytes
    /// and rewind both offsets to zero. Anchors survive; drop them with
    /// `clear_anchors` if they no longer apply.
    pub fn reset(&self) {
        self.shared.ring.abort();
        let _gate = self.shared.read_gate.lock();
        self.shared.ring.reset();
        self.shared.settle(0);
        self.shared.write_offset.store(0, Ordering::Release);
        debug!(name = self.shared.ring.name(), "anchored ring reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn filled(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    #[test]
    fn read_stops_at_anchor_until_fetched() {
        let (mut tx, mut rx) = AnchoredRingBuffer::new::<&str>("anchor", 64).unwrap();
        tx.write(&filled(20), Wait::NoWait).unwrap();
        tx.put_anchor(8, "segment");

        let mut buf = [0u8; 16];
        assert_eq!(rx.read(&mut buf, Wait::NoWait), Ok(8));
        assert_eq!(&buf[..8], &filled(8)[..]);

        assert_eq!(rx.read(&mut buf, Wait::NoWait), Err(RingError::FetchAnchor));
        assert_eq!(rx.read(&mut buf, Wait::NoWait), Err(RingError::FetchAnchor));

        let anchor = rx.get_anchor().unwrap();
        assert_eq!(anchor, Anchor { offset: 8, payload: "segment" });
        assert_eq!(rx.get_anchor(), Err(RingError::NoAnchor));

        assert_eq!(rx.read(&mut buf, Wait::NoWait), Ok(12));
        assert_eq!(buf[0], 8);
        assert_eq!(rx.read_offset(), 20);
    }

    #[test]
    fn equal_offsets_keep_insertion_order() {
        let (tx, mut rx) = AnchoredRingBuffer::new::<u32>("order", 16).unwrap();
        tx.put_anchor(4, 1);
        tx.put_anchor(2, 0);
        tx.put_anchor(4, 2);

        let offsets: Vec<_> = (0..3).map(|_| rx.get_anchor().unwrap()).collect();
        assert_eq!(
            offsets.iter().map(|a| (a.offset, a.payload)).collect::<Vec<_>>(),
            vec![(2, 0), (4, 1), (4, 2)]
        );
    }

    #[test]
    fn anchor_at_current_wakes_blocked_reader() {
        let (mut tx, mut rx) = AnchoredRingBuffer::new::<&str>("wake", 64).unwrap();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 32];
            let mut got = 0;
            loop {
                match rx.read(&mut buf[got..], Wait::millis(1_000)) {
                    Ok(n) => got += n,
                    Err(RingError::Unblocked) => continue,
                    Err(RingError::FetchAnchor) => {
                        let anchor = rx.get_anchor().unwrap();
                        return (got, anchor.offset);
                    }
                    Err(e) => panic!("unexpected {e:?}"),
                }
            }
        });

        thread::sleep(Duration::from_millis(20));
        tx.write(&filled(10), Wait::NoWait).unwrap();
        let at = tx.put_anchor_at_current("eos");
        assert_eq!(at, 10);

        let (got, offset) = reader.join().unwrap();
        assert_eq!(got, 10);
        assert_eq!(offset, 10);
    }

    #[test]
    fn write_cut_short_by_finish_still_advances_the_anchor_position() {
        let (mut tx, _rx) = AnchoredRingBuffer::new::<&str>("short", 8).unwrap();
        let ring = tx.control().ring().clone();

        let writer = thread::spawn(move || {
            let n = tx.write(&filled(12), Wait::Forever);
            (n, tx.put_anchor_at_current("tail"))
        });
        thread::sleep(Duration::from_millis(30));
        ring.signal_writer_finished();

        let (n, at) = writer.join().unwrap();
        assert_eq!(n, Ok(8));
        assert_eq!(at, 8);
    }

    #[test]
    fn drain_skips_bytes_but_keeps_anchors() {
        let (mut tx, mut rx) = AnchoredRingBuffer::new::<u8>("drain", 64).unwrap();
        tx.write(&filled(30), Wait::NoWait).unwrap();
        tx.put_anchor(25, 9);

        assert_eq!(rx.drain(20), 20);
        assert_eq!(tx.control().pending_anchors(), 1);

        let mut buf = [0u8; 10];
        assert_eq!(rx.read(&mut buf, Wait::NoWait), Ok(5));
        assert_eq!(buf[0], 20);
    }

    #[test]
    fn reset_rewinds_offsets_and_keeps_anchors() {
        let (mut tx, mut rx) = AnchoredRingBuffer::new::<u8>("reset", 32).unwrap();
        let ctl = tx.control();
        tx.write(&filled(12), Wait::NoWait).unwrap();
        let mut buf = [0u8; 4];
        rx.read(&mut buf, Wait::NoWait).unwrap();
        tx.put_anchor(30, 1);

        ctl.reset();
        assert_eq!(rx.read_offset(), 0);
        assert_eq!(ctl.ring().filled(), 0);
        assert_eq!(ctl.pending_anchors(), 1);

        tx.write(&[42], Wait::NoWait).unwrap();
        assert_eq!(rx.read(&mut buf, Wait::NoWait), Ok(1));
        assert_eq!(buf[0], 42);
    }
}
