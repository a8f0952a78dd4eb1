//! The pieces of the hopscotch profiler that both sides of the shared-memory
//! transport need to agree on: the cycle clock, the segment layout, the
//! multi-producer ring buffer and the wire format.
//!
//! The producer half lives in `hopscotch-client`, the consumer half in
//! `hopscotch-server`. Everything in this crate is deliberately free of any
//! per-process global state so that it can be exercised directly in tests.

pub mod clock;
pub mod ringbuf;
pub mod segment;
pub mod wire;

/// Protocol version stored in the segment header. Attaching requires an
/// exact match (within a small epsilon); there is no range compatibility.
pub const PROTOCOL_VERSION: f32 = 0.91;

/// Upper bound on the number of threads that can record traces in one
/// producer process. This also fixes the number of worker slots in the
/// ring buffer, so it is a compile-time constant on both sides.
pub const MAX_THREADS: usize = 64;

/// Default byte size of the ring buffer data area.
pub const DEFAULT_SHM_BYTES: u64 = 32_000_000;

/// Lock waits shorter than this many cycles are discarded before emission.
pub const DEFAULT_MIN_LOCK_CYCLES: u64 = 1_000;

/// Minimum number of cycles between two heartbeat messages.
pub const DEFAULT_HEARTBEAT_CYCLES: u64 = 100_000_000;

/// After this many cycles without any sign of life from the producer, the
/// consumer reports the connection as `ConnectedNoClient`.
pub const PRODUCER_DEATH_CYCLES: u64 = 3_000_000_000;

/// Consecutive core-scheduling events on the same core closer than this
/// many microseconds are coalesced by the consumer.
pub const CORE_MERGE_MICROS: u64 = 10;
