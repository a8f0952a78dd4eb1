//! The producer side of the hopscotch instrumentation profiler.
//!
//! Link this crate into the process you want to measure, call
//! [`initialize`] once at startup, then bracket interesting code regions
//! with [`scope!`] or the explicit [`enter`]/[`leave`] pairs. A consumer
//! process (see `hopscotch-server`) attaches to the shared-memory segment
//! this crate creates and receives the recorded events.
//!
//! Recording is designed to stay out of the way: when no consumer is
//! attached or listening, events are discarded at negligible cost, and no
//! instrumentation call ever blocks on anything slower than a bounded spin
//! in the shared ring buffer.
//!
//! ```no_run
//! hopscotch_client::initialize().ok();
//! hopscotch_client::set_thread_name("worker");
//! {
//!     hopscotch_client::scope!("render");
//!     // ... measured work ...
//! }
//! hopscotch_client::shutdown();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use once_cell::sync::OnceCell;
use thiserror::Error;

use hopscotch_ipc::segment::{SegmentError, SharedSegment};
use hopscotch_ipc::{clock, DEFAULT_HEARTBEAT_CYCLES, DEFAULT_MIN_LOCK_CYCLES, DEFAULT_SHM_BYTES};

mod block_alloc;
mod recorder;
mod string_table;

pub use hopscotch_ipc::segment::ConnectionState;
pub use string_table::str_hash;

/// Zones are small tags (0..=255) used to categorise scopes; 0 is the
/// default zone.
pub const ZONE_MAX: u16 = 255;
pub const ZONE_DEFAULT: u16 = 0;

/// Runtime overrides for the compile-time defaults.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Byte size of the shared ring buffer data area.
    pub shm_bytes: u64,
    /// Lock waits shorter than this many cycles are discarded.
    pub min_lock_cycles: u64,
    /// Minimum number of cycles between heartbeats.
    pub heartbeat_cycles: u64,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            shm_bytes: DEFAULT_SHM_BYTES,
            min_lock_cycles: DEFAULT_MIN_LOCK_CYCLES,
            heartbeat_cycles: DEFAULT_HEARTBEAT_CYCLES,
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("this architecture has no serialising cycle counter; profiling is disabled")]
    UnsupportedPlatform,
    #[error("the profiler was already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

pub(crate) struct ProducerShared {
    pub segment: SharedSegment,
    pub config: ClientConfig,
    pub next_thread_index: AtomicU32,
    pub enabled: AtomicBool,
}

static PRODUCER: OnceCell<ProducerShared> = OnceCell::new();
static INIT_CLAIMED: AtomicBool = AtomicBool::new(false);

pub(crate) fn producer() -> Option<&'static ProducerShared> {
    PRODUCER
        .get()
        .filter(|shared| shared.enabled.load(Ordering::Relaxed))
}

/// Sets up profiling with default configuration. On failure the process
/// simply runs unprofiled; every instrumentation call becomes a no-op.
pub fn initialize() -> Result<(), SetupError> {
    initialize_with(ClientConfig::default())
}

/// Sets up profiling: estimates the TSC frequency, creates the shared
/// memory segment named after this process's pid, and publishes it.
pub fn initialize_with(config: ClientConfig) -> Result<(), SetupError> {
    if !clock::is_supported() {
        log::error!("profiling disabled: no serialising cycle counter on this architecture");
        return Err(SetupError::UnsupportedPlatform);
    }
    if INIT_CLAIMED.swap(true, Ordering::SeqCst) {
        return Err(SetupError::AlreadyInitialized);
    }

    let tsc_mhz = clock::tsc_frequency_mhz();
    let pid = std::process::id() as i32;
    let segment = SharedSegment::create(pid, config.shm_bytes, tsc_mhz).map_err(|err| {
        log::error!("could not create the profiler's shared memory segment: {err}");
        err
    })?;
    log::info!(
        "profiler segment ready for pid {pid} ({} bytes, TSC {tsc_mhz:.0} MHz)",
        config.shm_bytes
    );

    let shared = ProducerShared {
        segment,
        config,
        next_thread_index: AtomicU32::new(0),
        enabled: AtomicBool::new(true),
    };
    PRODUCER
        .set(shared)
        .map_err(|_| SetupError::AlreadyInitialized)
}

/// Stops recording and withdraws from the shared segment. When no consumer
/// is attached either, the segment is unlinked. Late events from other
/// threads are silently dropped.
pub fn shutdown() {
    if let Some(shared) = PRODUCER.get() {
        shared.enabled.store(false, Ordering::SeqCst);
        shared.segment.disconnect();
    }
}

/// Names the calling thread in the consumer's output. The first call wins;
/// later calls are ignored.
pub fn set_thread_name(name: &str) {
    recorder::set_thread_name(name);
}

/// Opens a scope. Every `enter` must be paired with a [`leave`] on the same
/// thread; prefer the [`scope!`] macro or [`ScopeGuard`].
pub fn enter(file: &'static str, line: u32, fct: &'static str, zone: u16) {
    debug_assert!(zone <= ZONE_MAX);
    recorder::enter(file, line, fct, zone);
}

/// Opens a scope whose name is built at runtime. The name is hashed and
/// interned immediately.
pub fn enter_dynamic(file: &'static str, line: u32, fct: &str, zone: u16) {
    debug_assert!(zone <= ZONE_MAX);
    recorder::enter_dynamic(file, line, fct, zone);
}

/// Closes the innermost open scope. Closing the outermost scope flushes
/// the thread's batch to the consumer.
pub fn leave() {
    recorder::leave();
}

/// Records that the thread starts waiting on the mutex identified by
/// `mutex_addr` (any stable pointer-sized id, typically the mutex address).
pub fn acquire_lock(mutex_addr: u64) {
    recorder::acquire_lock(mutex_addr);
}

/// Ends the wait started by the matching [`acquire_lock`].
pub fn lock_acquired() {
    recorder::lock_acquired();
}

/// Records the point in time the mutex was released.
pub fn release_lock(mutex_addr: u64) {
    recorder::release_lock(mutex_addr);
}

/// RAII scope: enters on construction with the ambient zone, leaves on
/// drop.
pub struct ScopeGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ScopeGuard {
    pub fn new(file: &'static str, line: u32, fct: &'static str) -> ScopeGuard {
        enter(file, line, fct, recorder::current_zone());
        ScopeGuard {
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn with_zone(file: &'static str, line: u32, fct: &'static str, zone: u16) -> ScopeGuard {
        enter(file, line, fct, zone);
        ScopeGuard {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        leave();
    }
}

/// RAII scope with a runtime-built name.
pub struct DynScopeGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl DynScopeGuard {
    pub fn new(file: &'static str, line: u32, fct: &str) -> DynScopeGuard {
        enter_dynamic(file, line, fct, recorder::current_zone());
        DynScopeGuard {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for DynScopeGuard {
    fn drop(&mut self) {
        leave();
    }
}

/// RAII lock wait: construct before blocking on a mutex, drop once the
/// mutex is held.
pub struct LockWaitGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl LockWaitGuard {
    pub fn new(mutex_addr: u64) -> LockWaitGuard {
        acquire_lock(mutex_addr);
        LockWaitGuard {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for LockWaitGuard {
    fn drop(&mut self) {
        lock_acquired();
    }
}

/// RAII zone switch: scopes opened while this guard is alive default to
/// `zone`.
pub struct ZoneGuard {
    previous: u16,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ZoneGuard {
    pub fn new(zone: u16) -> ZoneGuard {
        debug_assert!(zone <= ZONE_MAX);
        ZoneGuard {
            previous: recorder::swap_zone(zone),
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        recorder::swap_zone(self.previous);
    }
}

/// Profiles the enclosing block under the given static name.
#[macro_export]
macro_rules! scope {
    ($name:expr) => {
        let _hopscotch_scope = $crate::ScopeGuard::new(file!(), line!(), $name);
    };
    ($name:expr, $zone:expr) => {
        let _hopscotch_scope = $crate::ScopeGuard::with_zone(file!(), line!(), $name, $zone);
    };
}

/// Profiles the enclosing block under a name built at runtime.
#[macro_export]
macro_rules! dyn_scope {
    ($name:expr) => {
        let _hopscotch_scope = $crate::DynScopeGuard::new(file!(), line!(), $name);
    };
}

/// Switches the ambient zone for the enclosing block.
#[macro_export]
macro_rules! zone {
    ($zone:expr) => {
        let _hopscotch_zone = $crate::ZoneGuard::new($zone);
    };
}
