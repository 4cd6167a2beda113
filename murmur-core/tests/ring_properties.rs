use std::thread;
use std::time::{Duration, Instant};

use murmur_core::buffering::{AnchoredRingBuffer, RingBuffer, Wait};
use murmur_core::error::RingError;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn bytes_cross_threads_in_order_and_none_are_lost() {
    let (mut producer, mut consumer) = RingBuffer::new("conservation", 97).expect("ring");
    let payload = pattern(50_000);
    let sent = payload.clone();

    let writer = thread::spawn(move || {
        let mut offset = 0usize;
        let mut step = 1usize;
        while offset < sent.len() {
            let end = (offset + step).min(sent.len());
            let n = producer
                .write(&sent[offset..end], Wait::Forever)
                .expect("write");
            offset += n;
            step = step % 173 + 7;
        }
        producer.finish();
    });

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 61];
    loop {
        match consumer.read(&mut buf, Wait::millis(500)) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(RingError::WriterFinished) => break,
            Err(RingError::Unblocked) => continue,
            Err(e) => panic!("unexpected ring error: {e}"),
        }
    }
    writer.join().expect("writer thread");

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

#[test]
fn finished_writer_drains_before_reporting_end() {
    let (mut producer, mut consumer) = RingBuffer::new("drain", 64).expect("ring");
    producer.write(b"tail bytes", Wait::NoWait).expect("write");
    producer.finish();

    let mut buf = [0u8; 64];
    let n = consumer.read(&mut buf, Wait::Forever).expect("drain");
    assert_eq!(&buf[..n], b"tail bytes");
    assert_eq!(
        consumer.read(&mut buf, Wait::Forever),
        Err(RingError::WriterFinished)
    );
    assert_eq!(producer.write(b"late", Wait::NoWait), Err(RingError::WriterFinished));
}

#[test]
fn abort_releases_a_blocked_writer() {
    let (mut producer, consumer) = RingBuffer::new("abort", 8).expect("ring");
    producer.write(&[0u8; 8], Wait::NoWait).expect("fill");
    let control = consumer.control();

    let blocked = thread::spawn(move || producer.write(&[1u8; 4], Wait::Forever));
    thread::sleep(Duration::from_millis(30));
    control.abort();

    let start = Instant::now();
    let result = blocked.join().expect("writer thread");
    assert_eq!(result, Err(RingError::Aborted));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn reset_empties_the_ring_and_rearms_it() {
    let (mut producer, mut consumer) = RingBuffer::new("reset", 32).expect("ring");
    producer.write(b"stale", Wait::NoWait).expect("write");
    producer.finish();

    let control = producer.control();
    control.reset();
    assert_eq!(consumer.filled(), 0);
    assert_eq!(producer.available(), 32);

    producer.write(b"fresh", Wait::NoWait).expect("write after reset");
    let mut buf = [0u8; 5];
    let n = consumer.read(&mut buf, Wait::NoWait).expect("read");
    assert_eq!(&buf[..n], b"fresh");
}

#[test]
fn anchors_surface_exactly_at_their_offsets_in_order() {
    let (mut producer, mut consumer) =
        AnchoredRingBuffer::new::<&'static str>("anchors", 128).expect("ring");
    producer.put_anchor(0, "head");
    producer.write(b"0123", Wait::NoWait).expect("write");
    producer.put_anchor_at_current("middle");
    producer.write(b"456789", Wait::NoWait).expect("write");
    producer.put_anchor_at_current("end");
    producer.finish();

    let mut seen = Vec::new();
    let mut data = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match consumer.read(&mut buf, Wait::NoWait) {
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(RingError::FetchAnchor) => {
                let anchor = consumer.get_anchor().expect("anchor due");
                assert_eq!(anchor.offset, consumer.read_offset());
                seen.push((anchor.offset, anchor.payload));
            }
            Err(RingError::WriterFinished) => break,
            Err(e) => panic!("unexpected ring error: {e}"),
        }
    }

    assert_eq!(data, b"0123456789");
    assert_eq!(seen, vec![(0, "head"), (4, "middle"), (10, "end")]);
    assert_eq!(consumer.get_anchor().map(|a| a.payload), Err(RingError::NoAnchor));
}

#[test]
fn concurrent_anchors_are_never_crossed() {
    let (mut producer, mut consumer) =
        AnchoredRingBuffer::new::<u64>("racing-anchors", 4_096).expect("ring");
    let chunk = pattern(37);

    let writer = thread::spawn(move || {
        let mut placed = Vec::new();
        for round in 0..2_000u64 {
            let n = producer.write(&chunk, Wait::Forever).expect("write");
            assert_eq!(n, chunk.len());
            if round % 3 == 0 {
                let at = producer.put_anchor_at_current(round);
                placed.push(at);
            }
        }
        producer.finish();
        placed
    });

    let mut seen = Vec::new();
    let mut buf = [0u8; 1_024];
    loop {
        match consumer.read(&mut buf, Wait::millis(500)) {
            Ok(_) | Err(RingError::Unblocked) => {}
            Err(RingError::FetchAnchor) => {
                let anchor = consumer.get_anchor().expect("anchor due");
                assert_eq!(
                    anchor.offset,
                    consumer.read_offset(),
                    "read ran past the anchor for round {}",
                    anchor.payload
                );
                seen.push(anchor.offset);
            }
            Err(RingError::WriterFinished) => break,
            Err(e) => panic!("unexpected ring error: {e}"),
        }
    }

    let placed = writer.join().expect("writer thread");
    assert_eq!(seen, placed);
}
