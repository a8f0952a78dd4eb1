//! Lock-free multi-producer single-consumer ring buffer for variable-length
//! records.
//!
//! Producers reserve a region with [`RingState::acquire`], write their bytes
//! into the data area, then publish with [`RingState::produce`]. The single
//! consumer repeatedly takes the longest contiguous run of published bytes
//! with [`RingState::consume`] and hands it back with [`RingState::release`].
//! A record never spans the physical end of the buffer: when a reservation
//! would cross it, the writer wraps around to offset zero and remembers the
//! old write position in `end` so the consumer knows where the valid data
//! stops.
//!
//! The state lives in a `#[repr(C)]` struct made entirely of atomics so that
//! the same code drives a ring placed in a shared-memory segment and one
//! allocated on the heap in tests.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::MAX_THREADS;

const SPIN_BACKOFF_MIN: u32 = 4;
const SPIN_BACKOFF_MAX: u32 = 128;

/// A packed producer offset: the actual byte offset in the low 32 bits, a
/// 31-bit wrap-around generation counter above it, and the wrap lock in the
/// high bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingOffset(u64);

impl RingOffset {
    pub const OFFSET_MASK: u64 = 0x0000_0000_ffff_ffff;
    pub const WRAP_LOCK: u64 = 0x8000_0000_0000_0000;
    pub const WRAP_COUNTER_MASK: u64 = 0x7fff_ffff_0000_0000;
    /// Sentinel stored in a worker's `seen_off` while it has no reservation
    /// in flight.
    pub const NONE: u64 = u64::MAX & !Self::WRAP_LOCK;

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        RingOffset(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The byte offset into the data area.
    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    #[inline]
    pub fn is_wrap_locked(self) -> bool {
        self.0 & Self::WRAP_LOCK != 0
    }

    /// The wrap-around generation, kept in packed form.
    #[inline]
    pub fn wrap_counter(self) -> u64 {
        self.0 & Self::WRAP_COUNTER_MASK
    }

    /// The packed counter advanced by one generation.
    #[inline]
    pub fn next_wrap_counter(self) -> u64 {
        (self.wrap_counter() + 0x1_0000_0000) & Self::WRAP_COUNTER_MASK
    }
}

/// One producer thread's registration slot.
#[repr(C)]
pub struct WorkerSlot {
    /// The `next` offset this worker observed while reserving, or
    /// [`RingOffset::NONE`] when it has no reservation in flight. The wrap
    /// lock bit marks the value as still being established.
    seen_off: AtomicU64,
    registered: AtomicI32,
}

impl WorkerSlot {
    const fn new() -> Self {
        WorkerSlot {
            seen_off: AtomicU64::new(RingOffset::NONE),
            registered: AtomicI32::new(0),
        }
    }
}

/// Handle returned by [`RingState::register`]; identifies the worker slot in
/// every producer-side call.
#[derive(Clone, Copy, Debug)]
pub struct RingWorker {
    index: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RingSetupError {
    #[error("ring capacity {0} exceeds the largest representable offset")]
    CapacityTooLarge(u64),
}

/// The shared ring buffer state. The data area itself is owned by the
/// caller; this struct only deals in offsets.
#[repr(C)]
pub struct RingState {
    /// Byte capacity of the data area. Written once in `setup`.
    space: AtomicU64,
    /// Producer-side write position, packed as a [`RingOffset`].
    next: AtomicU64,
    /// Where valid data stops when a wrap-around is in flight. Only the
    /// producer holding the wrap lock stores this; [`RingOffset::NONE`]
    /// when no wrap is pending.
    end: AtomicU64,
    /// Consumer-side read position.
    written: AtomicU64,
    nworkers: AtomicU32,
    workers: [WorkerSlot; MAX_THREADS],
}

impl RingState {
    pub const fn new() -> Self {
        RingState {
            space: AtomicU64::new(0),
            next: AtomicU64::new(0),
            end: AtomicU64::new(RingOffset::NONE),
            written: AtomicU64::new(0),
            nworkers: AtomicU32::new(0),
            workers: [const { WorkerSlot::new() }; MAX_THREADS],
        }
    }

    /// (Re-)initialises the ring for a data area of `space` bytes. Must not
    /// race with any other use of the ring; the producer runs this before
    /// publishing the segment.
    pub fn setup(&self, nworkers: u32, space: u64) -> Result<(), RingSetupError> {
        if space >= RingOffset::OFFSET_MASK {
            return Err(RingSetupError::CapacityTooLarge(space));
        }
        self.next.store(0, Ordering::Relaxed);
        self.end.store(RingOffset::NONE, Ordering::Relaxed);
        self.written.store(0, Ordering::Relaxed);
        for worker in &self.workers {
            worker.seen_off.store(RingOffset::NONE, Ordering::Relaxed);
            worker.registered.store(0, Ordering::Relaxed);
        }
        self.nworkers
            .store(nworkers.min(MAX_THREADS as u32), Ordering::Relaxed);
        self.space.store(space, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn space(&self) -> u64 {
        self.space.load(Ordering::Relaxed)
    }

    /// Registers the calling thread as the producer for slot `index`.
    /// Returns `None` when the slot index is out of range.
    pub fn register(&self, index: usize) -> Option<RingWorker> {
        if index >= self.nworkers.load(Ordering::Relaxed) as usize {
            return None;
        }
        let slot = &self.workers[index];
        slot.seen_off.store(RingOffset::NONE, Ordering::Relaxed);
        slot.registered.store(1, Ordering::Release);
        Some(RingWorker { index })
    }

    pub fn unregister(&self, worker: RingWorker) {
        self.workers[worker.index]
            .registered
            .store(0, Ordering::Release);
    }

    /// Reserves `len` bytes and returns the byte offset of the reservation,
    /// or `None` when the buffer cannot currently hold the record. The
    /// reservation stays invisible to the consumer until `produce`.
    pub fn acquire(&self, worker: RingWorker, len: u64) -> Option<u64> {
        let space = self.space();
        debug_assert!(len > 0 && len <= space);
        let slot = &self.workers[worker.index];
        debug_assert_eq!(slot.seen_off.load(Ordering::Relaxed), RingOffset::NONE);

        let mut seen;
        let mut next;
        let mut target;
        loop {
            seen = self.stable_next();
            next = seen.offset();
            debug_assert!(next < space);

            // Advertise the offset we are working against so the consumer
            // will not read past it. The wrap lock bit flags it as not yet
            // stable; the CAS below publishes both values together.
            slot.seen_off
                .store(next | RingOffset::WRAP_LOCK, Ordering::Relaxed);

            // The reservation must never catch up with the unconsumed
            // bytes behind `written`.
            target = next + len;
            let written = self.written.load(Ordering::Relaxed);
            if next < written && target >= written {
                slot.seen_off.store(RingOffset::NONE, Ordering::Release);
                return None;
            }

            if target >= space {
                // The record does not fit before the physical end: wrap
                // around and take the space at the beginning, or reset to
                // zero exactly if we consumed the buffer to the byte.
                let exceed = target > space;
                target = if exceed { RingOffset::WRAP_LOCK | len } else { 0 };
                if (target & RingOffset::OFFSET_MASK) >= written {
                    slot.seen_off.store(RingOffset::NONE, Ordering::Release);
                    return None;
                }
                target |= seen.next_wrap_counter();
            } else {
                target |= seen.wrap_counter();
            }

            if self
                .next
                .compare_exchange_weak(seen.raw(), target, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        // The reservation is in. Drop the wrap lock bit from our advertised
        // offset; the CAS above already fenced the store.
        let advertised = slot.seen_off.load(Ordering::Relaxed);
        slot.seen_off
            .store(advertised & !RingOffset::WRAP_LOCK, Ordering::Relaxed);

        if target & RingOffset::WRAP_LOCK != 0 {
            // We wrapped: record where the valid data ends, then release
            // the wrap lock held in `next`. The release store makes `end`
            // visible before anyone can observe the unlocked `next`.
            debug_assert!(self.written.load(Ordering::Relaxed) <= next);
            debug_assert_eq!(self.end.load(Ordering::Relaxed), RingOffset::NONE);
            self.end.store(next, Ordering::Relaxed);
            self.next
                .store(target & !RingOffset::WRAP_LOCK, Ordering::Release);
            return Some(0);
        }

        Some(next)
    }

    /// Publishes the worker's reservation to the consumer. All bytes must
    /// have been written before this call.
    pub fn produce(&self, worker: RingWorker) {
        let slot = &self.workers[worker.index];
        debug_assert!(slot.registered.load(Ordering::Relaxed) != 0);
        debug_assert_ne!(slot.seen_off.load(Ordering::Relaxed), RingOffset::NONE);
        slot.seen_off.store(RingOffset::NONE, Ordering::Release);
    }

    /// Returns the offset and length of the longest contiguous run of
    /// published bytes, or `None` when nothing is ready.
    pub fn consume(&self) -> Option<(u64, u64)> {
        let mut written = self.written.load(Ordering::Relaxed);
        loop {
            let next = self.stable_next().offset();
            if written == next {
                return None;
            }

            // The run may not extend past any reservation still in flight.
            // Offsets below `written` belong to workers that already
            // wrapped around; they bound the next generation, not this one.
            let mut ready = RingOffset::NONE;
            let nworkers = self.nworkers.load(Ordering::Relaxed) as usize;
            for slot in &self.workers[..nworkers] {
                if slot.registered.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                let seen = self.stable_seen(slot);
                if seen >= written {
                    ready = ready.min(seen);
                }
            }

            if next < written {
                // A wrap-around happened. Either we still have data to
                // drain up to `end`, or we have fully caught up and can
                // move to the start ourselves.
                let end = self.space().min(self.end.load(Ordering::Relaxed));
                if ready == RingOffset::NONE && written == end {
                    if self.end.load(Ordering::Relaxed) != RingOffset::NONE {
                        self.end.store(RingOffset::NONE, Ordering::Relaxed);
                    }
                    written = 0;
                    self.written.store(0, Ordering::Release);
                    continue;
                }
                ready = ready.min(end);
            } else {
                ready = ready.min(next);
            }

            debug_assert!(ready >= written);
            let run = ready - written;
            if run == 0 {
                return None;
            }
            return Some((written, run));
        }
    }

    /// Hands `nbytes` previously obtained from `consume` back to the
    /// producers.
    pub fn release(&self, nbytes: u64) {
        let written = self.written.load(Ordering::Relaxed) + nbytes;
        debug_assert!(written <= self.space());
        let wrapped = if written == self.space() { 0 } else { written };
        self.written.store(wrapped, Ordering::Release);
    }

    /// Loads `next`, spinning while a wrap-around holds it locked.
    #[inline]
    fn stable_next(&self) -> RingOffset {
        let mut backoff = SPIN_BACKOFF_MIN;
        loop {
            let next = RingOffset::from_raw(self.next.load(Ordering::Acquire));
            if !next.is_wrap_locked() {
                return next;
            }
            spin_backoff(&mut backoff);
        }
    }

    /// Loads a worker's `seen_off`, spinning while the worker is mid-CAS.
    #[inline]
    fn stable_seen(&self, slot: &WorkerSlot) -> u64 {
        let mut backoff = SPIN_BACKOFF_MIN;
        loop {
            let seen = RingOffset::from_raw(slot.seen_off.load(Ordering::Acquire));
            if !seen.is_wrap_locked() {
                return seen.raw();
            }
            spin_backoff(&mut backoff);
        }
    }
}

impl Default for RingState {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn spin_backoff(count: &mut u32) {
    for _ in 0..*count {
        std::hint::spin_loop();
    }
    if *count < SPIN_BACKOFF_MAX {
        *count += *count;
    }
}
