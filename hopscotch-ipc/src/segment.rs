//! The named shared-memory segment that carries trace data from the
//! instrumented process to the consumer.
//!
//! The segment is laid out as a fixed header (version, TSC frequency,
//! atomic lifecycle state), followed by the ring buffer state, followed by
//! the ring's data area. The producer creates and initialises the segment
//! at startup; the consumer opens it by pid. Both sides announce themselves
//! through bits in the header's atomic state word, and whichever side
//! disconnects last unlinks the OS object.

use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use memmap2::MmapRaw;
use thiserror::Error;

use crate::clock;
use crate::ringbuf::RingState;
use crate::{MAX_THREADS, PROTOCOL_VERSION};

/// Segment names look like `/hop_12345` and are capped at 30 characters to
/// satisfy the smallest portable `shm_open` name limit.
pub const SEGMENT_NAME_PREFIX: &str = "/hop_";
pub const SEGMENT_NAME_MAX: usize = 30;

/// Versions closer than this are considered equal.
const VERSION_EPSILON: f32 = 0.001;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentState: u32 {
        const PRODUCER_CONNECTED = 1;
        const CONSUMER_CONNECTED = 2;
        const CONSUMER_LISTENING = 4;
    }
}

/// Connection state reported to embedders of the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    NoTargetProcess,
    NotConnected,
    Connected,
    ConnectedNoClient,
    PermissionDenied,
    InvalidVersion,
    UnknownError,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("no shared memory segment exists for pid {0}")]
    NotFound(i32),
    #[error("permission denied opening the shared memory segment")]
    PermissionDenied,
    #[error("producer protocol version {producer} does not match supported version {ours}")]
    VersionMismatch { producer: f32, ours: f32 },
    #[error("segment is smaller than its declared size")]
    Truncated,
    #[error("requested data area of {0} bytes exceeds the ring buffer's addressable range")]
    CapacityTooLarge(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SegmentError {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            SegmentError::NotFound(_) => ConnectionState::NotConnected,
            SegmentError::PermissionDenied => ConnectionState::PermissionDenied,
            SegmentError::VersionMismatch { .. } => ConnectionState::InvalidVersion,
            SegmentError::Truncated
            | SegmentError::CapacityTooLarge(_)
            | SegmentError::Io(_) => ConnectionState::UnknownError,
        }
    }
}

/// Fixed fields at the start of the segment. The non-atomic fields are
/// written by the producer before it raises `PRODUCER_CONNECTED` and are
/// immutable afterwards.
#[repr(C)]
struct SegmentHeader {
    client_version: f32,
    tsc_frequency_mhz: f32,
    max_thread_count: u32,
    _pad0: u32,
    data_size: u64,
    last_reset: AtomicU64,
    last_heartbeat: AtomicU64,
    state: AtomicU32,
    _pad1: u32,
}

const HEADER_BYTES: usize = mem::size_of::<SegmentHeader>();
const RING_OFFSET: usize = (HEADER_BYTES + 7) & !7;
const DATA_OFFSET: usize = (RING_OFFSET + mem::size_of::<RingState>() + 7) & !7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Role {
    Producer,
    Consumer,
}

/// A mapped profiler segment, producer- or consumer-side.
#[derive(Debug)]
pub struct SharedSegment {
    map: MmapRaw,
    _file: File,
    name: CString,
    pid: i32,
    role: Role,
    data_size: u64,
    disconnected: AtomicBool,
}

pub fn segment_name(pid: i32) -> CString {
    let mut name = format!("{SEGMENT_NAME_PREFIX}{pid}");
    name.truncate(SEGMENT_NAME_MAX);
    CString::new(name).expect("segment name contains no interior nul")
}

fn last_errno_error(pid: i32) -> SegmentError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT) => SegmentError::NotFound(pid),
        Some(libc::EACCES) => SegmentError::PermissionDenied,
        _ => SegmentError::Io(err),
    }
}

impl SharedSegment {
    /// Producer side: creates (or re-initialises) the segment for `pid`
    /// with a data area of `data_size` bytes, then announces the producer.
    pub fn create(pid: i32, data_size: u64, tsc_mhz: f32) -> Result<SharedSegment, SegmentError> {
        let name = segment_name(pid);
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(last_errno_error(pid));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let total = DATA_OFFSET as u64 + data_size;
        file.set_len(total)?;
        let map = MmapRaw::map_raw(&file)?;

        let segment = SharedSegment {
            map,
            _file: file,
            name,
            pid,
            role: Role::Producer,
            data_size,
            disconnected: AtomicBool::new(false),
        };

        // Populate the immutable header fields before anything is
        // published through the state word.
        unsafe {
            let header = segment.header_ptr();
            std::ptr::addr_of_mut!((*header).client_version).write_volatile(PROTOCOL_VERSION);
            std::ptr::addr_of_mut!((*header).tsc_frequency_mhz).write_volatile(tsc_mhz);
            std::ptr::addr_of_mut!((*header).max_thread_count).write_volatile(MAX_THREADS as u32);
            std::ptr::addr_of_mut!((*header).data_size).write_volatile(data_size);
        }
        segment.header().last_reset.store(clock::now(), Ordering::SeqCst);
        segment.header().last_heartbeat.store(0, Ordering::SeqCst);
        segment
            .ring()
            .setup(MAX_THREADS as u32, data_size)
            .map_err(|_| SegmentError::CapacityTooLarge(data_size))?;

        segment.set_state_bits(SegmentState::PRODUCER_CONNECTED);
        Ok(segment)
    }

    /// Consumer side: opens the segment of an existing producer, verifies
    /// the version, discards stale data by bumping the reset timestamp, and
    /// announces the consumer.
    pub fn open(pid: i32) -> Result<SharedSegment, SegmentError> {
        let name = segment_name(pid);
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(last_errno_error(pid));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let total = file.metadata()?.len();
        if (total as usize) < DATA_OFFSET {
            return Err(SegmentError::Truncated);
        }
        let map = MmapRaw::map_raw(&file)?;

        let segment = SharedSegment {
            map,
            _file: file,
            name,
            pid,
            role: Role::Consumer,
            data_size: 0,
            disconnected: AtomicBool::new(true),
        };

        let producer_version = segment.version();
        if (producer_version - PROTOCOL_VERSION).abs() > VERSION_EPSILON {
            return Err(SegmentError::VersionMismatch {
                producer: producer_version,
                ours: PROTOCOL_VERSION,
            });
        }
        let data_size = unsafe { std::ptr::addr_of!((*segment.header_ptr()).data_size).read_volatile() };
        if total < DATA_OFFSET as u64 + data_size {
            return Err(SegmentError::Truncated);
        }

        let mut segment = segment;
        segment.data_size = data_size;
        segment.disconnected.store(false, Ordering::Relaxed);

        // There can only be one consumer. If another one is (or appears to
        // be) attached, force-clear the listening bit so a dangling
        // listener cannot keep the producer streaming into the void.
        if segment.state().contains(SegmentState::CONSUMER_CONNECTED) {
            log::warn!(
                "another consumer already appears to be attached to pid {pid}; \
                 forcing the listening state off"
            );
            segment.clear_state_bits(SegmentState::CONSUMER_LISTENING);
        }

        // Anything the producer buffered before we attached belongs to a
        // previous consumer run.
        segment.bump_last_reset();
        segment.set_state_bits(SegmentState::CONSUMER_CONNECTED);
        Ok(segment)
    }

    fn header_ptr(&self) -> *mut SegmentHeader {
        self.map.as_mut_ptr() as *mut SegmentHeader
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*self.header_ptr() }
    }

    pub fn ring(&self) -> &RingState {
        unsafe { &*(self.map.as_mut_ptr().add(RING_OFFSET) as *const RingState) }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn version(&self) -> f32 {
        unsafe { std::ptr::addr_of!((*self.header_ptr()).client_version).read_volatile() }
    }

    pub fn tsc_frequency_mhz(&self) -> f32 {
        unsafe { std::ptr::addr_of!((*self.header_ptr()).tsc_frequency_mhz).read_volatile() }
    }

    pub fn max_thread_count(&self) -> u32 {
        unsafe { std::ptr::addr_of!((*self.header_ptr()).max_thread_count).read_volatile() }
    }

    /// Size of the ring buffer data area in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_bits_truncate(self.header().state.load(Ordering::SeqCst))
    }

    fn set_state_bits(&self, bits: SegmentState) {
        self.header().state.fetch_or(bits.bits(), Ordering::SeqCst);
    }

    fn clear_state_bits(&self, bits: SegmentState) {
        self.header().state.fetch_and(!bits.bits(), Ordering::SeqCst);
    }

    pub fn has_connected_producer(&self) -> bool {
        self.state().contains(SegmentState::PRODUCER_CONNECTED)
    }

    pub fn has_connected_consumer(&self) -> bool {
        self.state().contains(SegmentState::CONSUMER_CONNECTED)
    }

    pub fn has_listening_consumer(&self) -> bool {
        self.state()
            .contains(SegmentState::CONSUMER_CONNECTED | SegmentState::CONSUMER_LISTENING)
    }

    /// Consumer side: toggles whether the producer should bother sending.
    pub fn set_listening(&self, listening: bool) {
        if listening {
            self.set_state_bits(SegmentState::CONSUMER_LISTENING);
        } else {
            self.clear_state_bits(SegmentState::CONSUMER_LISTENING);
        }
    }

    pub fn last_reset(&self) -> u64 {
        self.header().last_reset.load(Ordering::SeqCst)
    }

    /// Moves the reset timestamp forward to "now", invalidating everything
    /// produced before this point.
    pub fn bump_last_reset(&self) {
        self.header().last_reset.store(clock::now(), Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.header().last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn set_last_heartbeat(&self, timestamp: u64) {
        self.header()
            .last_heartbeat
            .store(timestamp, Ordering::SeqCst);
    }

    /// Producer side: the writable bytes of a region reserved through the
    /// ring buffer.
    ///
    /// # Safety
    ///
    /// `offset..offset + len` must be a reservation the calling thread
    /// acquired and not yet produced; the ring protocol makes it exclusive.
    pub unsafe fn reserved_bytes(&self, offset: u64, len: u64) -> &mut [u8] {
        debug_assert!(offset + len <= self.data_size);
        let ptr = self.map.as_mut_ptr().add(DATA_OFFSET + offset as usize);
        std::slice::from_raw_parts_mut(ptr, len as usize)
    }

    /// Consumer side: the readable bytes of a run returned by
    /// [`RingState::consume`].
    ///
    /// # Safety
    ///
    /// `offset..offset + len` must be a run obtained from `consume` and not
    /// yet released; producers will not touch it until then.
    pub unsafe fn consumed_bytes(&self, offset: u64, len: u64) -> &[u8] {
        debug_assert!(offset + len <= self.data_size);
        let ptr = self.map.as_ptr().add(DATA_OFFSET + offset as usize);
        std::slice::from_raw_parts(ptr, len as usize)
    }

    /// Withdraws this side from the segment. When the other side is gone
    /// too, the OS object is unlinked. Idempotent; also runs on drop.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.role {
            Role::Producer => self.clear_state_bits(SegmentState::PRODUCER_CONNECTED),
            Role::Consumer => self.clear_state_bits(
                SegmentState::CONSUMER_CONNECTED | SegmentState::CONSUMER_LISTENING,
            ),
        }
        let both_gone = !self
            .state()
            .intersects(SegmentState::PRODUCER_CONNECTED | SegmentState::CONSUMER_CONNECTED);
        if both_gone {
            log::info!("cleaning up shared memory segment {:?}", self.name);
            unsafe {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.disconnect();
    }
}
