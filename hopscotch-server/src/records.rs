//! Typed records accumulated for the consumer's collaborator (the viewer),
//! batched per producing thread and handed over wholesale through
//! `take_pending`.

use hopscotch_ipc::wire::{CoreRecord, UnlockRecord};
use rustc_hash::FxHashMap;

/// Completed scopes from one thread, in completion order, struct-of-arrays.
/// `starts` keeps the wire form: the low bit is the dynamic-name flag.
#[derive(Default, Clone)]
pub struct TraceBatch {
    pub starts: Vec<u64>,
    pub ends: Vec<u64>,
    pub file_ids: Vec<u64>,
    pub fct_ids: Vec<u64>,
    pub lines: Vec<u32>,
    pub depths: Vec<u16>,
    pub zones: Vec<u16>,
    pub max_depth: u16,
}

impl TraceBatch {
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn append(&mut self, other: &mut TraceBatch) {
        self.starts.append(&mut other.starts);
        self.ends.append(&mut other.ends);
        self.file_ids.append(&mut other.file_ids);
        self.fct_ids.append(&mut other.fct_ids);
        self.lines.append(&mut other.lines);
        self.depths.append(&mut other.depths);
        self.zones.append(&mut other.zones);
        self.max_depth = self.max_depth.max(other.max_depth);
    }
}

/// Mutex wait spans from one thread, in completion order.
#[derive(Default, Clone)]
pub struct LockWaitBatch {
    pub mutexes: Vec<u64>,
    pub starts: Vec<u64>,
    pub ends: Vec<u64>,
    pub depths: Vec<u16>,
    pub max_depth: u16,
}

impl LockWaitBatch {
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn append(&mut self, other: &mut LockWaitBatch) {
        self.mutexes.append(&mut other.mutexes);
        self.starts.append(&mut other.starts);
        self.ends.append(&mut other.ends);
        self.depths.append(&mut other.depths);
        self.max_depth = self.max_depth.max(other.max_depth);
    }
}

#[derive(Default, Clone)]
pub struct CoreEventBatch {
    pub starts: Vec<u64>,
    pub ends: Vec<u64>,
    pub cores: Vec<u32>,
}

impl CoreEventBatch {
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn push(&mut self, record: CoreRecord) {
        self.starts.push(record.start);
        self.ends.push(record.end);
        self.cores.push(record.core);
    }
}

/// Everything received since the last `take_pending`, keyed by the
/// producing thread's index.
#[derive(Default)]
pub struct PendingData {
    pub traces: FxHashMap<u32, TraceBatch>,
    pub lock_waits: FxHashMap<u32, LockWaitBatch>,
    pub unlocks: FxHashMap<u32, Vec<UnlockRecord>>,
    pub core_events: FxHashMap<u32, CoreEventBatch>,
    /// String entries newly added to the consumer's database, in arrival
    /// order.
    pub strings: Vec<(u64, String)>,
    /// `(thread index, name string id)` pairs, reported once per thread.
    pub thread_names: Vec<(u32, u64)>,
}

impl PendingData {
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
            && self.lock_waits.is_empty()
            && self.unlocks.is_empty()
            && self.core_events.is_empty()
            && self.strings.is_empty()
            && self.thread_names.is_empty()
    }
}

/// Coalesces a thread's core-scheduling events: consecutive events on the
/// same core closer than `min_gap_cycles` merge into one span, and any
/// remaining consecutive run on the same core collapses to its first
/// event.
pub fn merge_core_events(events: Vec<CoreRecord>, min_gap_cycles: u64) -> Vec<CoreRecord> {
    let mut merged: Vec<CoreRecord> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(last) = merged.last_mut() {
            if last.core == event.core {
                if event.start < last.end || event.start - last.end < min_gap_cycles {
                    last.end = last.end.max(event.end);
                }
                continue;
            }
        }
        merged.push(event);
    }
    merged
}
