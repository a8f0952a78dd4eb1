//! Hammers the MPSC ring buffer with several producers and one consumer and
//! checks that no byte is lost, duplicated or torn.
//!
//! Each record is self-describing: a little-endian length, a seed, then
//! payload bytes derived from the seed. The consumer walks every contiguous
//! run record by record and validates the payload, which catches torn or
//! misframed records; byte totals are compared at the end.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use hopscotch_ipc::ringbuf::RingState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const RING_BYTES: u64 = 4096;
const PRODUCERS: usize = 4;
const RECORDS_PER_PRODUCER: usize = 20_000;
const MIN_RECORD: u64 = 8;
const MAX_RECORD: u64 = RING_BYTES / 4;

struct TestRing {
    state: RingState,
    data: UnsafeCell<Box<[u8]>>,
}

// The ring protocol hands out disjoint regions; producers only touch their
// reservation and the consumer only touches unreleased runs.
unsafe impl Sync for TestRing {}

impl TestRing {
    fn new(space: u64) -> TestRing {
        let state = RingState::new();
        state.setup(PRODUCERS as u32, space).unwrap();
        TestRing {
            state,
            data: UnsafeCell::new(vec![0u8; space as usize].into_boxed_slice()),
        }
    }

    unsafe fn write(&self, offset: u64, bytes: &[u8]) {
        let base = (*self.data.get()).as_mut_ptr();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset as usize), bytes.len());
    }

    unsafe fn read(&self, offset: u64, len: u64) -> &[u8] {
        let base = (*self.data.get()).as_ptr();
        std::slice::from_raw_parts(base.add(offset as usize), len as usize)
    }
}

fn fill_record(buf: &mut [u8], seed: u32) {
    let len = buf.len() as u32;
    LittleEndian::write_u32(&mut buf[0..4], len);
    LittleEndian::write_u32(&mut buf[4..8], seed);
    let fill = (seed % 251) as u8;
    for byte in &mut buf[8..] {
        *byte = fill;
    }
}

fn check_record(bytes: &[u8]) -> usize {
    assert!(bytes.len() >= 8, "run too short for a record header");
    let len = LittleEndian::read_u32(&bytes[0..4]) as usize;
    assert!(
        (MIN_RECORD as usize..=MAX_RECORD as usize).contains(&len),
        "bogus record length {len}"
    );
    assert!(len <= bytes.len(), "record extends past the consumed run");
    let seed = LittleEndian::read_u32(&bytes[4..8]);
    let fill = (seed % 251) as u8;
    for (i, byte) in bytes[8..len].iter().enumerate() {
        assert_eq!(*byte, fill, "torn record at payload byte {i}");
    }
    len
}

#[test]
fn concurrent_producers_never_tear_records() {
    let ring = TestRing::new(RING_BYTES);
    let produced = AtomicU64::new(0);
    let mut consumed = 0u64;

    std::thread::scope(|scope| {
        for producer_index in 0..PRODUCERS {
            let ring = &ring;
            let produced = &produced;
            scope.spawn(move || {
                let worker = ring.state.register(producer_index).unwrap();
                let mut rng = StdRng::seed_from_u64(0xA11CE + producer_index as u64);
                let mut scratch = vec![0u8; MAX_RECORD as usize];
                for record in 0..RECORDS_PER_PRODUCER {
                    let len = rng.random_range(MIN_RECORD..=MAX_RECORD);
                    let seed = (producer_index * RECORDS_PER_PRODUCER + record) as u32;
                    fill_record(&mut scratch[..len as usize], seed);

                    let mut attempts = 0u64;
                    let offset = loop {
                        match ring.state.acquire(worker, len) {
                            Some(offset) => break offset,
                            None => {
                                attempts += 1;
                                assert!(
                                    attempts < 50_000_000,
                                    "producer {producer_index} starved with a live consumer"
                                );
                                std::hint::spin_loop();
                            }
                        }
                    };
                    unsafe { ring.write(offset, &scratch[..len as usize]) };
                    ring.state.produce(worker);
                    produced.fetch_add(len, Ordering::Relaxed);
                }
                ring.state.unregister(worker);
            });
        }

        // Single consumer, running until every producer thread is done and
        // the ring has been drained.
        let expected_total: u64 = {
            // Recompute the total deterministically from the same seeds.
            let mut total = 0u64;
            for producer_index in 0..PRODUCERS {
                let mut rng = StdRng::seed_from_u64(0xA11CE + producer_index as u64);
                for _ in 0..RECORDS_PER_PRODUCER {
                    total += rng.random_range(MIN_RECORD..=MAX_RECORD);
                }
            }
            total
        };

        let mut idle_spins = 0u64;
        while consumed < expected_total {
            match ring.state.consume() {
                Some((offset, run_len)) => {
                    idle_spins = 0;
                    let run = unsafe { ring.read(offset, run_len) };
                    let mut pos = 0usize;
                    while pos < run.len() {
                        pos += check_record(&run[pos..]);
                    }
                    assert_eq!(pos, run.len(), "run did not end on a record boundary");
                    ring.state.release(run_len);
                    consumed += run_len;
                }
                None => {
                    idle_spins += 1;
                    assert!(
                        idle_spins < 500_000_000,
                        "consumer starved at {consumed}/{expected_total} bytes"
                    );
                    std::hint::spin_loop();
                }
            }
        }
    });

    assert_eq!(consumed, produced.load(Ordering::Relaxed));
    // Nothing left behind.
    assert!(ring.state.consume().is_none());
}
