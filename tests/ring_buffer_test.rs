//! Ring buffer under a real producer thread and consumer thread

use astro_capture::ring::{OverflowPolicy, RingBuffer, RingError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const SLOT_LEN: usize = 4;

fn produce(ring: &RingBuffer<u64>, count: u64, done: &AtomicBool) {
    let mut seq = 0;
    while seq < count {
        match ring.acquire_write_slot() {
            Ok(mut slot) => {
                slot.fill(seq);
                slot.finalize();
                seq += 1;
            }
            Err(RingError::Full) => thread::yield_now(),
            Err(e) => panic!("unexpected ring error: {}", e),
        }
    }
    done.store(true, Ordering::Release);
}

fn consume(ring: &RingBuffer<u64>, done: &AtomicBool) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        if let Some(frame) = ring.dequeue() {
            // A torn slot would mix two sequence numbers
            assert!(frame.iter().all(|&v| v == frame[0]));
            seen.push(frame[0]);
            continue;
        }
        if done.load(Ordering::Acquire) && ring.is_empty() {
            return seen;
        }
        thread::yield_now();
    }
}

#[test]
fn test_reject_policy_delivers_everything_in_order() {
    let ring = RingBuffer::<u64>::new(8, SLOT_LEN, OverflowPolicy::Reject).unwrap();
    let done = AtomicBool::new(false);
    let count = 20_000;

    let seen = thread::scope(|s| {
        s.spawn(|| produce(&ring, count, &done));
        s.spawn(|| consume(&ring, &done)).join().unwrap()
    });

    assert_eq!(seen.len() as u64, count);
    assert!(seen.iter().enumerate().all(|(i, &v)| v == i as u64));
    assert_eq!(ring.produced(), count);
    assert_eq!(ring.dropped(), 0);
}

#[test]
fn test_overwrite_policy_accounts_for_every_frame() {
    let ring = RingBuffer::<u64>::new(4, SLOT_LEN, OverflowPolicy::Overwrite).unwrap();
    let done = AtomicBool::new(false);
    let count = 20_000;

    let seen = thread::scope(|s| {
        s.spawn(|| produce(&ring, count, &done));
        s.spawn(|| consume(&ring, &done)).join().unwrap()
    });

    // Losses are allowed, reordering and duplicates are not
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(seen.len() as u64 + ring.dropped(), count);
    assert!(ring.produced() <= count);
    assert!(ring.is_empty());
}

#[test]
fn test_preview_reader_alongside_producer_and_consumer() {
    let ring = RingBuffer::<u64>::new(16, SLOT_LEN, OverflowPolicy::Overwrite).unwrap();
    let done = AtomicBool::new(false);
    let count = 10_000;

    let seen = thread::scope(|s| {
        s.spawn(|| produce(&ring, count, &done));
        s.spawn(|| {
            let mut last = 0u64;
            while !done.load(Ordering::Acquire) {
                if let Some(view) = ring.peek_last() {
                    assert!(view.iter().all(|&v| v == view[0]));
                    assert!(view.sequence() >= last);
                    last = view.sequence();
                }
                thread::yield_now();
            }
        });
        s.spawn(|| consume(&ring, &done)).join().unwrap()
    });

    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(seen.len() as u64 + ring.dropped(), count);

    // Peeking after everything was consumed still shows the newest frame
    let last = ring.peek_last().unwrap();
    assert_eq!(Some(&last[0]), seen.last());
}
