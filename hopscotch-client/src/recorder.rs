//! Per-thread event recording and the flush path into the shared segment.
//!
//! Every instrumented thread gets a lazily created recorder holding its
//! ring-buffer worker slot, its growing event arrays and its own string
//! table. Scopes and lock waits are kept on small open-item stacks while
//! they are live and appended to the completed arrays when they close, so
//! the flushed arrays are ordered by end time. The whole batch is framed
//! and pushed through the ring buffer when the outermost scope closes.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;
use std::sync::Once;

use hopscotch_ipc::segment::SharedSegment;
use hopscotch_ipc::wire::{
    self, CoreRecord, LockWaitRecord, MsgHeader, MsgType, UnlockRecord, HEADER_BYTES,
};
use hopscotch_ipc::{clock, ringbuf::RingWorker, MAX_THREADS};

use crate::block_alloc::ChunkedVec;
use crate::string_table::StringTable;
use crate::ProducerShared;

#[derive(Clone, Copy)]
enum FctName {
    Static(&'static str),
    Dynamic(u64),
}

impl FctName {
    fn id(self) -> u64 {
        match self {
            FctName::Static(text) => text.as_ptr() as u64,
            FctName::Dynamic(hash) => hash,
        }
    }
}

#[derive(Clone, Copy)]
struct OpenScope {
    /// Start cycle; low bit set when the function name id is a hash.
    start: u64,
    file: &'static str,
    fct: FctName,
    line: u32,
    zone: u16,
}

#[derive(Clone, Copy)]
struct CompletedTrace {
    start: u64,
    end: u64,
    file: &'static str,
    fct: FctName,
    line: u32,
    depth: u16,
    zone: u16,
}

#[derive(Clone, Copy)]
struct OpenLock {
    mutex: u64,
    start: u64,
    depth: u16,
}

#[derive(Clone, Copy)]
struct CoreSpan {
    start: u64,
    last: u64,
    core: u32,
}

pub(crate) struct ThreadRecorder {
    thread_id: u64,
    thread_index: u32,
    worker: Option<RingWorker>,
    thread_name: Option<Box<str>>,
    thread_name_id: u64,

    open_scopes: Vec<OpenScope>,
    open_locks: Vec<OpenLock>,

    traces: ChunkedVec<CompletedTrace>,
    lock_waits: ChunkedVec<LockWaitRecord>,
    unlocks: ChunkedVec<UnlockRecord>,
    core_events: ChunkedVec<CoreRecord>,
    core_span: Option<CoreSpan>,

    strings: StringTable,
    /// Local copy of the segment's reset timestamp.
    reset_seen: u64,
}

thread_local! {
    static RECORDER: RefCell<Option<ThreadRecorder>> = const { RefCell::new(None) };
    static CURRENT_ZONE: Cell<u16> = const { Cell::new(0) };
}

/// The ambient zone applied to scopes opened through guards.
pub(crate) fn current_zone() -> u16 {
    CURRENT_ZONE.with(|zone| zone.get())
}

pub(crate) fn swap_zone(zone: u16) -> u16 {
    CURRENT_ZONE.with(|cell| cell.replace(zone))
}

/// Runs `f` against this thread's recorder, creating it on first touch.
/// Does nothing when the profiler is uninitialised, shut down, the thread
/// limit was exceeded, or the thread is already tearing down its TLS.
fn with_recorder(f: impl FnOnce(&mut ThreadRecorder, &'static ProducerShared)) {
    let Some(shared) = crate::producer() else {
        return;
    };
    let _ = RECORDER.try_with(|cell| {
        let Ok(mut slot) = cell.try_borrow_mut() else {
            return;
        };
        let recorder = slot.get_or_insert_with(|| ThreadRecorder::new(shared));
        if recorder.worker.is_some() {
            f(recorder, shared);
        }
    });
}

pub(crate) fn enter(file: &'static str, line: u32, fct: &'static str, zone: u16) {
    with_recorder(|recorder, _| {
        let (timestamp, core) = clock::now_with_core();
        recorder.note_core(timestamp, core);
        recorder.open_scopes.push(OpenScope {
            start: timestamp,
            file,
            fct: FctName::Static(fct),
            line,
            zone,
        });
    });
}

pub(crate) fn enter_dynamic(file: &'static str, line: u32, fct: &str, zone: u16) {
    with_recorder(|recorder, _| {
        let (timestamp, core) = clock::now_with_core();
        recorder.note_core(timestamp, core);
        // The name id is a hash, not an address; flag it in the start
        // timestamp so ingestion knows not to expect a static string.
        let fct_id = recorder.strings.intern_dynamic(fct);
        recorder.open_scopes.push(OpenScope {
            start: timestamp | wire::DYNAMIC_NAME_FLAG,
            file,
            fct: FctName::Dynamic(fct_id),
            line,
            zone,
        });
    });
}

pub(crate) fn leave() {
    with_recorder(|recorder, shared| {
        let (timestamp, core) = clock::now_with_core();
        recorder.note_core(timestamp, core);
        let Some(open) = recorder.open_scopes.pop() else {
            // An unmatched leave. Tolerated in release so a drop-in build
            // keeps running; depths are bogus until the next flush.
            debug_assert!(false, "leave() without a matching enter()");
            return;
        };
        let depth = recorder.open_scopes.len() as u16;
        recorder.traces.push(CompletedTrace {
            start: open.start,
            end: timestamp,
            file: open.file,
            fct: open.fct,
            line: open.line,
            depth,
            zone: open.zone,
        });
        if recorder.open_scopes.is_empty() {
            recorder.flush(shared, timestamp);
        }
    });
}

pub(crate) fn acquire_lock(mutex_addr: u64) {
    with_recorder(|recorder, _| {
        let depth = recorder.open_locks.len() as u16;
        recorder.open_locks.push(OpenLock {
            mutex: mutex_addr,
            start: clock::now(),
            depth,
        });
    });
}

pub(crate) fn lock_acquired() {
    with_recorder(|recorder, shared| {
        let end = clock::now();
        let Some(open) = recorder.open_locks.pop() else {
            debug_assert!(false, "lock_acquired() without a matching acquire_lock()");
            return;
        };
        // Uncontended acquisitions are noise; drop anything shorter than
        // the configured minimum.
        if end.saturating_sub(open.start) >= shared.config.min_lock_cycles {
            recorder.lock_waits.push(LockWaitRecord {
                mutex: open.mutex,
                start: open.start,
                end,
                depth: open.depth,
            });
        }
    });
}

pub(crate) fn release_lock(mutex_addr: u64) {
    with_recorder(|recorder, _| {
        recorder.unlocks.push(UnlockRecord {
            mutex: mutex_addr,
            time: clock::now(),
        });
    });
}

pub(crate) fn set_thread_name(name: &str) {
    with_recorder(|recorder, _| {
        if recorder.thread_name.is_none() {
            recorder.thread_name = Some(name.into());
            recorder.thread_name_id = recorder.strings.intern_dynamic(name);
        }
    });
}

impl ThreadRecorder {
    fn new(shared: &'static ProducerShared) -> ThreadRecorder {
        let thread_index = shared.next_thread_index.fetch_add(1, Ordering::Relaxed);
        let worker = if (thread_index as usize) < MAX_THREADS {
            shared.segment.ring().register(thread_index as usize)
        } else {
            static OVERFLOW: Once = Once::new();
            OVERFLOW.call_once(|| {
                log::warn!(
                    "thread limit of {MAX_THREADS} reached; traces from further \
                     threads are discarded"
                );
            });
            None
        };

        ThreadRecorder {
            thread_id: os_thread_id(),
            thread_index,
            worker,
            thread_name: None,
            thread_name_id: 0,
            open_scopes: Vec::with_capacity(64),
            open_locks: Vec::with_capacity(16),
            traces: ChunkedVec::new(),
            lock_waits: ChunkedVec::new(),
            unlocks: ChunkedVec::new(),
            core_events: ChunkedVec::new(),
            core_span: None,
            strings: StringTable::new(),
            reset_seen: shared.segment.last_reset(),
        }
    }

    /// Tracks which core the thread is running on; a change of core closes
    /// the running span and records it as a core-scheduling event.
    fn note_core(&mut self, timestamp: u64, core: u32) {
        if let Some(span) = self.core_span {
            if span.core == core {
                self.core_span = Some(CoreSpan {
                    last: timestamp,
                    ..span
                });
                return;
            }
            // The thread migrated; the finished span becomes an event.
            self.core_events.push(CoreRecord {
                start: span.start,
                end: span.last,
                core: span.core,
            });
        }
        self.core_span = Some(CoreSpan {
            start: timestamp,
            last: timestamp,
            core,
        });
    }

    /// The flush protocol, run when the outermost scope closes.
    fn flush(&mut self, shared: &ProducerShared, timestamp: u64) {
        let segment = &shared.segment;

        // Heartbeat first: it keeps the consumer's liveness tracking fed
        // even when it is not currently listening.
        if segment.has_connected_consumer()
            && timestamp.saturating_sub(segment.last_heartbeat()) > shared.config.heartbeat_cycles
        {
            segment.set_last_heartbeat(timestamp);
            self.send_heartbeat(segment, timestamp);
        }

        if !segment.has_listening_consumer() {
            self.discard_events();
            return;
        }

        // A reset newer than our local copy means the consumer cleared its
        // string database. Events recorded against the old string image
        // cannot be shipped without dangling ids, so this batch dies.
        let reset = segment.last_reset();
        if self.reset_seen < reset {
            self.reset_strings(reset);
            self.discard_events();
            return;
        }

        // Intern everything the batch references. Dynamically named traces
        // already interned their name on enter.
        for i in 0..self.traces.len() {
            let trace = self.traces.get(i);
            self.strings.intern_static(trace.file);
            if let FctName::Static(fct) = trace.fct {
                self.strings.intern_static(fct);
            }
        }

        // Strings go first so every id in the stream is already resolved
        // when the consumer meets it.
        if self.strings.unsent_len() > 0 && !self.send_string_data(segment, timestamp) {
            // The unsent cursor was not advanced; the next flush retries
            // the whole delta.
            self.discard_events();
            return;
        }

        if let Some(span) = self.core_span {
            if span.last > span.start {
                self.core_events.push(CoreRecord {
                    start: span.start,
                    end: span.last,
                    core: span.core,
                });
                self.core_span = Some(CoreSpan {
                    start: span.last,
                    ..span
                });
            }
        }

        self.send_traces(segment, timestamp);
        if !self.lock_waits.is_empty() {
            self.send_lock_waits(segment, timestamp);
        }
        if !self.unlocks.is_empty() {
            self.send_unlocks(segment, timestamp);
        }
        if !self.core_events.is_empty() {
            self.send_core_events(segment, timestamp);
        }

        self.discard_events();
    }

    fn header(&self, msg_type: MsgType, timestamp: u64, count: u32) -> MsgHeader {
        MsgHeader {
            msg_type,
            thread_index: self.thread_index,
            thread_id: self.thread_id,
            timestamp,
            thread_name_id: self.thread_name_id,
            count,
        }
    }

    /// Reserves ring space for `header`, writes the frame, publishes it.
    fn send_message(
        &self,
        segment: &SharedSegment,
        header: MsgHeader,
        write_payload: impl FnOnce(&mut [u8]),
    ) -> bool {
        let total = header.message_len() as u64;
        let Some(worker) = self.worker else {
            return false;
        };

        if total > segment.data_size() {
            static OVERSIZED: Once = Once::new();
            OVERSIZED.call_once(|| {
                log::warn!(
                    "a {total}-byte message cannot fit the {}-byte shared buffer; \
                     the batch is dropped (consider a larger buffer)",
                    segment.data_size()
                );
            });
            return false;
        }

        let Some(offset) = segment.ring().acquire(worker, total) else {
            static FULL: Once = Once::new();
            FULL.call_once(|| {
                log::warn!(
                    "shared buffer is full; dropping a batch (consider a larger \
                     buffer or a faster consumer)"
                );
            });
            return false;
        };

        let frame = unsafe { segment.reserved_bytes(offset, total) };
        wire::encode_header(&mut frame[..HEADER_BYTES], &header);
        let payload_end = HEADER_BYTES + header.payload_len();
        write_payload(&mut frame[HEADER_BYTES..payload_end]);
        frame[payload_end..].fill(0);
        segment.ring().produce(worker);
        true
    }

    fn send_heartbeat(&self, segment: &SharedSegment, timestamp: u64) -> bool {
        self.send_message(segment, self.header(MsgType::Heartbeat, timestamp, 0), |_| {})
    }

    fn send_string_data(&mut self, segment: &SharedSegment, timestamp: u64) -> bool {
        let count = self.strings.unsent_len() as u32;
        let header = self.header(MsgType::StringData, timestamp, count);
        let strings = &self.strings;
        let sent = self.send_message(segment, header, |payload| {
            strings.copy_unsent_into(payload);
        });
        if sent {
            self.strings.mark_sent();
        }
        sent
    }

    fn send_traces(&self, segment: &SharedSegment, timestamp: u64) -> bool {
        let count = self.traces.len();
        let header = self.header(MsgType::Traces, timestamp, count as u32);
        let traces = &self.traces;
        self.send_message(segment, header, |payload| {
            wire::encode_traces(
                payload,
                count,
                traces.iter().map(|trace| wire::TraceRecord {
                    start: trace.start,
                    end: trace.end,
                    file_id: trace.file.as_ptr() as u64,
                    fct_id: trace.fct.id(),
                    line: trace.line,
                    depth: trace.depth,
                    zone: trace.zone,
                }),
            );
        })
    }

    fn send_lock_waits(&self, segment: &SharedSegment, timestamp: u64) -> bool {
        let count = self.lock_waits.len();
        let header = self.header(MsgType::LockWait, timestamp, count as u32);
        let lock_waits = &self.lock_waits;
        self.send_message(segment, header, |payload| {
            wire::encode_lock_waits(payload, count, lock_waits.iter());
        })
    }

    fn send_unlocks(&self, segment: &SharedSegment, timestamp: u64) -> bool {
        let count = self.unlocks.len();
        let header = self.header(MsgType::UnlockEvent, timestamp, count as u32);
        let unlocks = &self.unlocks;
        self.send_message(segment, header, |payload| {
            wire::encode_unlocks(payload, count, unlocks.iter());
        })
    }

    fn send_core_events(&self, segment: &SharedSegment, timestamp: u64) -> bool {
        let count = self.core_events.len();
        let header = self.header(MsgType::CoreEvent, timestamp, count as u32);
        let core_events = &self.core_events;
        self.send_message(segment, header, |payload| {
            wire::encode_core_events(payload, count, core_events.iter());
        })
    }

    fn discard_events(&mut self) {
        self.traces.clear();
        self.lock_waits.clear();
        self.unlocks.clear();
        self.core_events.clear();
        self.open_scopes.clear();
        self.open_locks.clear();
    }

    fn reset_strings(&mut self, reset: u64) {
        self.strings.clear();
        self.reset_seen = reset;
        // The thread name has to survive resets; re-intern it so the next
        // shipped delta carries it again.
        if let Some(name) = self.thread_name.clone() {
            let id = self.strings.intern_dynamic(&name);
            debug_assert_eq!(id, self.thread_name_id);
        }
    }
}

impl Drop for ThreadRecorder {
    fn drop(&mut self) {
        if let (Some(worker), Some(shared)) = (self.worker, crate::producer()) {
            shared.segment.ring().unregister(worker);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn os_thread_id() -> u64 {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }
    } else if #[cfg(target_os = "macos")] {
        fn os_thread_id() -> u64 {
            let mut tid: u64 = 0;
            unsafe {
                libc::pthread_threadid_np(libc::pthread_self(), &mut tid);
            }
            tid
        }
    } else {
        fn os_thread_id() -> u64 {
            0
        }
    }
}
