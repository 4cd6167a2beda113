//! Byte and sample transport between producer and consumer tasks.
//!
//! - [`ring`]: blocking SPSC byte ring with abort/reset/wakeup protocol.
//! - [`anchored`]: byte ring with offset-bound out-of-band anchors.
//! - [`chunk`]: PCM format arithmetic and sample conversion.
//!
//! The lock-free sample ring below is only for real-time host callbacks,
//! which must never block. Everything downstream of the HAL uses the
//! blocking byte rings.

pub mod anchored;
pub mod chunk;
pub mod ring;

use ringbuf::{traits::Split, HeapRb};

pub use anchored::{Anchor, AnchoredConsumer, AnchoredControl, AnchoredProducer, AnchoredRingBuffer};
pub use ring::{RingBuffer, RingConsumer, RingControl, RingProducer, Wait};
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half held by a host audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<i16>;

/// Consumer half drained by the HAL `read` path.
pub type SampleConsumer = ringbuf::HeapCons<i16>;

/// Create a lock-free sample ring for a real-time callback.
///
/// `capacity` is clamped to at least one sample.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<i16>::new(capacity.max(1)).split()
}
