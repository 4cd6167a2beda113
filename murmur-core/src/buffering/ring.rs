//! Blocking single-producer / single-consumer byte ring.
//!
//! Storage is a `ringbuf::HeapRb<u8>` guarded by a `parking_lot::Mutex`,
//! with two condition variables (`can_read`, `can_write`) for blocking
//! waits. Unlike the lock-free audio-callback ring this crate also uses,
//! both sides here may block with a bounded or unbounded timeout.
//!
//! ## Ownership
//!
//! `RingBuffer::new` hands out exactly one `RingProducer` and one
//! `RingConsumer`. Neither is `Clone`, so a second concurrent reader or
//! writer cannot be expressed. Anything that only needs to steer the ring
//! (abort, reset, wake the reader, query fill level) takes a cloneable
//! `RingControl` instead.
//!
//! ## Read outcomes
//!
//! | situation                              | result                 |
//! |----------------------------------------|------------------------|
//! | request satisfied                      | `Ok(len)`              |
//! | timeout                                | `Ok(bytes so far)`     |
//! | writer finished, bytes remain          | `Ok(remaining)`        |
//! | writer finished, drained               | `Err(WriterFinished)`  |
//! | aborted                                | `Err(Aborted)`         |
//! | `wakeup_reader` before any byte copied | `Err(Unblocked)`       |
//!
//! Bytes already copied out by an interrupted call are always returned as
//! `Ok(n)`, never discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};
use tracing::debug;

use crate::error::RingError;

/// How long a ring operation may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Transfer whatever is possible right now.
    NoWait,
    /// Block up to the given duration.
    For(Duration),
    /// Block until satisfied, aborted, finished or woken.
    Forever,
}

impl Wait {
    pub fn millis(ms: u64) -> Self {
        Wait::For(Duration::from_millis(ms))
    }

    fn deadline(self) -> Deadline {
        match self {
            Wait::NoWait => Deadline::Now,
            Wait::For(d) => Instant::now()
                .checked_add(d)
                .map(Deadline::At)
                .unwrap_or(Deadline::Never),
            Wait::Forever => Deadline::Never,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Now,
    At(Instant),
    Never,
}

impl Deadline {
    /// Park on `cv`. Returns `false` once the deadline has passed.
    ///
    /// A timed-out wait downgrades to `Now` so the caller gets one last
    /// non-blocking pass before giving up.
    fn park(&mut self, cv: &Condvar, guard: &mut MutexGuard<'_, RingState>) -> bool {
        match *self {
            Deadline::Now => false,
            Deadline::Never => {
                cv.wait(guard);
                true
            }
            Deadline::At(t) => {
                if cv.wait_until(guard, t).timed_out() {
                    *self = Deadline::Now;
                }
                true
            }
        }
    }
}

struct RingState {
    rb: HeapRb<u8>,
    aborted: bool,
    read_aborted: bool,
    write_aborted: bool,
    writer_finished: bool,
    unblock_reader: bool,
}

struct Shared {
    name: String,
    capacity: usize,
    state: Mutex<RingState>,
    can_read: Condvar,
    can_write: Condvar,
}

impl Shared {
    fn read(&self, mut dst: Option<&mut [u8]>, len: usize, wait: Wait) -> Result<usize, RingError> {
        if len == 0 {
            return Ok(0);
        }

        let mut deadline = wait.deadline();
        let mut st = self.state.lock();
        let mut done = 0usize;

        while done < len {
            if st.aborted || st.read_aborted {
                return if done > 0 { Ok(done) } else { Err(RingError::Aborted) };
            }
            if st.unblock_reader {
                if done > 0 {
                    // Leave the flag latched; the next call reports it.
                    return Ok(done);
                }
                st.unblock_reader = false;
                return Err(RingError::Unblocked);
            }

            let n = match dst.as_deref_mut() {
                Some(buf) => st.rb.pop_slice(&mut buf[done..len]),
                None => st.rb.skip(len - done),
            };
            if n > 0 {
                done += n;
                self.can_write.notify_one();
                continue;
            }

            if st.writer_finished {
                return if done > 0 {
                    Ok(done)
                } else {
                    Err(RingError::WriterFinished)
                };
            }

            if !deadline.park(&self.can_read, &mut st) {
                return Ok(done);
            }
        }

        Ok(done)
    }

    fn write(&self, src: &[u8], wait: Wait) -> Result<usize, RingError> {
        if src.is_empty() {
            return Ok(0);
        }

        let mut deadline = wait.deadline();
        let mut st = self.state.lock();
        let mut done = 0usize;

        while done < src.len() {
            if st.aborted || st.write_aborted {
                return if done > 0 { Ok(done) } else { Err(RingError::Aborted) };
            }
            if st.writer_finished {
                return if done > 0 {
                    Ok(done)
                } else {
                    Err(RingError::WriterFinished)
                };
            }

            let n = st.rb.push_slice(&src[done..]);
            if n > 0 {
                done += n;
                self.can_read.notify_one();
                continue;
            }

            if !deadline.park(&self.can_write, &mut st) {
                return Ok(done);
            }
        }

        Ok(done)
    }

    fn filled(&self) -> usize {
        self.state.lock().rb.occupied_len()
    }

    fn available(&self) -> usize {
        self.state.lock().rb.vacant_len()
    }

    fn wake_all(&self) {
        self.can_read.notify_all();
        self.can_write.notify_all();
    }
}

/// Constructor namespace for a split byte ring.
pub struct RingBuffer;

impl RingBuffer {
    /// Allocate a ring of `size` bytes and split it into its two halves.
    ///
    /// # Errors
    /// `RingError::InvalidCapacity` when `size < 2`.
    pub fn new(name: impl Into<String>, size: usize) -> Result<(RingProducer, RingConsumer), RingError> {
        if size < 2 {
            return Err(RingError::InvalidCapacity(size));
        }

        let name = name.into();
        debug!(name = name.as_str(), size, "ring buffer created");

        let shared = Arc::new(Shared {
            name,
            capacity: size,
            state: Mutex::new(RingState {
                rb: HeapRb::new(size),
                aborted: false,
                read_aborted: false,
                write_aborted: false,
                writer_finished: false,
                unblock_reader: false,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        });

        Ok((
            RingProducer {
                shared: Arc::clone(&shared),
            },
            RingConsumer { shared },
        ))
    }
}

/// The single writing half of a ring.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Write all of `src`, blocking for space up to `wait`.
    ///
    /// Returns the number of bytes written. The count is short on timeout,
    /// or when an abort or finish lands after some bytes went in; the next
    /// call reports that condition.
    pub fn write(&mut self, src: &[u8], wait: Wait) -> Result<usize, RingError> {
        self.shared.write(src, wait)
    }

    /// Mark the stream finished. The reader drains what is left, then sees
    /// `WriterFinished`.
    pub fn finish(&mut self) {
        self.control().signal_writer_finished();
    }

    pub fn control(&self) -> RingControl {
        RingControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn filled(&self) -> usize {
        self.shared.filled()
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// The single reading half of a ring.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Copy up to `buf.len()` bytes out of the ring.
    pub fn read(&mut self, buf: &mut [u8], wait: Wait) -> Result<usize, RingError> {
        let len = buf.len();
        self.shared.read(Some(buf), len, wait)
    }

    /// Advance past up to `len` bytes without copying them.
    pub fn discard(&mut self, len: usize, wait: Wait) -> Result<usize, RingError> {
        self.shared.read(None, len, wait)
    }

    pub fn control(&self) -> RingControl {
        RingControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn filled(&self) -> usize {
        self.shared.filled()
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Cloneable control handle shared by any task that steers a ring.
#[derive(Clone)]
pub struct RingControl {
    shared: Arc<Shared>,
}

impl RingControl {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn filled(&self) -> usize {
        self.shared.filled()
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    /// Abort both sides. Every blocked and future call returns `Aborted`
    /// until `reset`.
    pub fn abort(&self) {
        self.shared.state.lock().aborted = true;
        self.shared.wake_all();
        debug!(name = self.name(), "ring buffer aborted");
    }

    pub fn abort_read(&self) {
        self.shared.state.lock().read_aborted = true;
        self.shared.wake_all();
    }

    pub fn abort_write(&self) {
        self.shared.state.lock().write_aborted = true;
        self.shared.wake_all();
    }

    /// Drop all buffered bytes and clear every flag.
    pub fn reset(&self) {
        {
            let mut st = self.shared.state.lock();
            st.rb.clear();
            st.aborted = false;
            st.read_aborted = false;
            st.write_aborted = false;
            st.writer_finished = false;
            st.unblock_reader = false;
        }
        self.shared.wake_all();
        debug!(name = self.name(), "ring buffer reset");
    }

    pub fn signal_writer_finished(&self) {
        self.shared.state.lock().writer_finished = true;
        self.shared.wake_all();
    }

    pub fn is_writer_finished(&self) -> bool {
        self.shared.state.lock().writer_finished
    }

    /// One-shot: the reader's current (or next) call returns `Unblocked`
    /// without consuming data.
    pub fn wakeup_reader(&self) {
        self.shared.state.lock().unblock_reader = true;
        self.shared.can_read.notify_all();
    }
}

impl std::fmt::Debug for RingControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingControl")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_tiny_capacity() {
        assert!(matches!(
            RingBuffer::new("tiny", 1),
            Err(RingError::InvalidCapacity(1))
        ));
        assert!(RingBuffer::new("ok", 2).is_ok());
    }

    #[test]
    fn fill_and_available_sum_to_capacity() {
        let (mut tx, mut rx) = RingBuffer::new("conserve", 64).unwrap();
        let ctl = tx.control();
        assert_eq!(ctl.filled() + ctl.available(), 64);

        tx.write(&[1; 40], Wait::NoWait).unwrap();
        assert_eq!(ctl.filled(), 40);
        assert_eq!(ctl.filled() + ctl.available(), 64);

        let mut out = [0u8; 25];
        rx.read(&mut out, Wait::NoWait).unwrap();
        assert_eq!(ctl.filled(), 15);
        assert_eq!(ctl.filled() + ctl.available(), 64);
    }

    #[test]
    fn timeout_returns_partial_read() {
        let (mut tx, mut rx) = RingBuffer::new("partial", 16).unwrap();
        tx.write(&[7, 8, 9], Wait::NoWait).unwrap();

        let mut out = [0u8; 8];
        let n = rx.read(&mut out, Wait::millis(20)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[7, 8, 9]);
    }

    #[test]
    fn write_blocks_until_reader_makes_room() {
        let (mut tx, mut rx) = RingBuffer::new("backpressure", 4).unwrap();
        tx.write(&[1, 2, 3, 4], Wait::NoWait).unwrap();

        let writer = thread::spawn(move || tx.write(&[5, 6], Wait::Forever));
        thread::sleep(Duration::from_millis(30));

        let mut out = [0u8; 6];
        let mut got = 0;
        while got < 6 {
            got += rx.read(&mut out[got..], Wait::millis(200)).unwrap();
        }
        assert_eq!(writer.join().unwrap(), Ok(2));
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn abort_after_partial_write_reports_the_bytes_written() {
        let (mut tx, mut rx) = RingBuffer::new("partial-abort", 4).unwrap();
        let ctl = rx.control();

        let writer = thread::spawn(move || {
            let first = tx.write(&[1, 2, 3, 4, 5, 6], Wait::Forever);
            let second = tx.write(&[7], Wait::NoWait);
            (first, second)
        });
        thread::sleep(Duration::from_millis(30));
        let mut out = [0u8; 1];
        rx.read(&mut out, Wait::NoWait).unwrap();
        thread::sleep(Duration::from_millis(30));
        ctl.abort();

        let (first, second) = writer.join().unwrap();
        assert_eq!(first, Ok(5));
        assert_eq!(second, Err(RingError::Aborted));
    }

    #[test]
    fn finish_after_partial_write_reports_the_bytes_written() {
        let (mut tx, _rx) = RingBuffer::new("partial-finish", 4).unwrap();
        let ctl = tx.control();

        let writer = thread::spawn(move || tx.write(&[1, 2, 3, 4, 5, 6], Wait::Forever));
        thread::sleep(Duration::from_millis(30));
        ctl.signal_writer_finished();

        assert_eq!(writer.join().unwrap(), Ok(4));
    }

    #[test]
    fn discard_skips_without_copy() {
        let (mut tx, mut rx) = RingBuffer::new("discard", 16).unwrap();
        tx.write(b"stale-fresh", Wait::NoWait).unwrap();

        assert_eq!(rx.discard(6, Wait::NoWait), Ok(6));
        let mut out = [0u8; 5];
        rx.read(&mut out, Wait::NoWait).unwrap();
        assert_eq!(&out, b"fresh");
    }

    #[test]
    fn wakeup_reader_is_one_shot_and_keeps_data() {
        let (mut tx, mut rx) = RingBuffer::new("wake", 16).unwrap();
        let ctl = rx.control();

        let reader = thread::spawn(move || {
            let mut out = [0u8; 4];
            let first = rx.read(&mut out, Wait::Forever);
            let second = rx.read(&mut out, Wait::millis(500));
            (first, second, out)
        });

        thread::sleep(Duration::from_millis(30));
        ctl.wakeup_reader();
        thread::sleep(Duration::from_millis(30));
        tx.write(&[1, 2, 3, 4], Wait::NoWait).unwrap();

        let (first, second, out) = reader.join().unwrap();
        assert_eq!(first, Err(RingError::Unblocked));
        assert_eq!(second, Ok(4));
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn abort_releases_blocked_reader_and_writer() {
        let (mut tx, mut rx) = RingBuffer::new("abort", 2).unwrap();
        let ctl = tx.control();
        tx.write(&[0, 0], Wait::NoWait).unwrap();

        let writer = thread::spawn(move || tx.write(&[1], Wait::Forever));
        thread::sleep(Duration::from_millis(20));
        ctl.abort();
        assert_eq!(writer.join().unwrap(), Err(RingError::Aborted));

        let mut out = [0u8; 1];
        assert_eq!(rx.read(&mut out, Wait::Forever), Err(RingError::Aborted));

        ctl.reset();
        assert_eq!(ctl.filled(), 0);
        assert_eq!(rx.read(&mut out, Wait::NoWait), Ok(0));
    }

    #[test]
    fn writer_finished_stops_further_writes() {
        let (mut tx, _rx) = RingBuffer::new("finished", 8).unwrap();
        tx.finish();
        assert_eq!(tx.write(&[1], Wait::Forever), Err(RingError::WriterFinished));
    }
}
