//! Parses a contiguous run of wire messages and feeds the typed results
//! into the shared pending-data store.

use std::sync::Arc;

use hopscotch_ipc::wire::{
    self, decode_core_events, decode_header, decode_lock_waits, decode_unlocks, MsgType,
    TracesView, WireError, HEADER_BYTES,
};
use parking_lot::Mutex;

use crate::records::{merge_core_events, LockWaitBatch, PendingData, TraceBatch};
use crate::string_db::StringDb;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub messages: usize,
    pub heartbeats: usize,
    /// Messages skipped because they predate the last reset.
    pub stale: usize,
}

impl RunStats {
    fn absorb(&mut self, other: RunStats) {
        self.messages += other.messages;
        self.heartbeats += other.heartbeats;
        self.stale += other.stale;
    }
}

pub(crate) struct Dispatcher {
    string_db: Arc<Mutex<StringDb>>,
    pending: Arc<Mutex<PendingData>>,
    /// Name id already reported per thread index; 0 means none yet.
    thread_names_seen: Vec<u64>,
}

impl Dispatcher {
    pub fn new(string_db: Arc<Mutex<StringDb>>, pending: Arc<Mutex<PendingData>>) -> Dispatcher {
        Dispatcher {
            string_db,
            pending,
            thread_names_seen: Vec::new(),
        }
    }

    pub fn forget_thread_names(&mut self) {
        self.thread_names_seen.clear();
    }

    /// Parses every message in `run`. Messages older than `min_timestamp`
    /// are skipped. `core_merge_cycles` parameterises core-event
    /// coalescing.
    pub fn dispatch_run(
        &mut self,
        run: &[u8],
        min_timestamp: u64,
        core_merge_cycles: u64,
    ) -> Result<RunStats, WireError> {
        let mut stats = RunStats::default();
        let mut pos = 0usize;
        while pos < run.len() {
            let consumed = self.dispatch_message(&run[pos..], min_timestamp, core_merge_cycles)?;
            stats.absorb(consumed.1);
            pos += consumed.0;
        }
        Ok(stats)
    }

    fn dispatch_message(
        &mut self,
        data: &[u8],
        min_timestamp: u64,
        core_merge_cycles: u64,
    ) -> Result<(usize, RunStats), WireError> {
        let header = decode_header(data)?;
        let total = header.message_len();
        if total > data.len() {
            return Err(WireError::TruncatedPayload {
                expected: total,
                available: data.len(),
            });
        }
        let payload = &data[HEADER_BYTES..HEADER_BYTES + header.payload_len()];

        let mut stats = RunStats {
            messages: 1,
            ..RunStats::default()
        };

        // Anything produced before the last reset refers to string ids the
        // database no longer holds.
        if header.timestamp < min_timestamp {
            stats.stale = 1;
            return Ok((total, stats));
        }

        if header.thread_name_id != 0 && self.note_thread_name(header.thread_index, header.thread_name_id)
        {
            self.pending
                .lock()
                .thread_names
                .push((header.thread_index, header.thread_name_id));
        }

        match header.msg_type {
            MsgType::StringData => {
                let mut db = self.string_db.lock();
                let added = db.add_string_data(payload);
                if !added.is_empty() {
                    let mut pending = self.pending.lock();
                    for id in added {
                        let text = db.get(id).unwrap_or_default().to_owned();
                        pending.strings.push((id, text));
                    }
                }
            }
            MsgType::Traces => {
                let view = TracesView::new(payload, header.count as usize)?;
                if !view.is_empty() {
                    let mut batch = TraceBatch::default();
                    for record in view.iter() {
                        batch.starts.push(record.start);
                        batch.ends.push(record.end);
                        batch.file_ids.push(record.file_id);
                        batch.fct_ids.push(record.fct_id);
                        batch.lines.push(record.line);
                        batch.depths.push(record.depth);
                        batch.zones.push(record.zone);
                        batch.max_depth = batch.max_depth.max(record.depth);
                    }
                    self.pending
                        .lock()
                        .traces
                        .entry(header.thread_index)
                        .or_default()
                        .append(&mut batch);
                }
            }
            MsgType::LockWait => {
                let mut batch = LockWaitBatch::default();
                for record in decode_lock_waits(payload, header.count as usize)? {
                    batch.mutexes.push(record.mutex);
                    batch.starts.push(record.start);
                    batch.ends.push(record.end);
                    batch.depths.push(record.depth);
                    batch.max_depth = batch.max_depth.max(record.depth);
                }
                if !batch.is_empty() {
                    self.pending
                        .lock()
                        .lock_waits
                        .entry(header.thread_index)
                        .or_default()
                        .append(&mut batch);
                }
            }
            MsgType::UnlockEvent => {
                let mut events: Vec<wire::UnlockRecord> =
                    decode_unlocks(payload, header.count as usize)?.collect();
                events.sort_by_key(|event| event.time);
                if !events.is_empty() {
                    self.pending
                        .lock()
                        .unlocks
                        .entry(header.thread_index)
                        .or_default()
                        .extend(events);
                }
            }
            MsgType::CoreEvent => {
                let events: Vec<wire::CoreRecord> =
                    decode_core_events(payload, header.count as usize)?.collect();
                let merged = merge_core_events(events, core_merge_cycles);
                if !merged.is_empty() {
                    let mut pending = self.pending.lock();
                    let batch = pending.core_events.entry(header.thread_index).or_default();
                    for event in merged {
                        batch.push(event);
                    }
                }
            }
            MsgType::Heartbeat => {
                stats.heartbeats = 1;
            }
        }

        Ok((total, stats))
    }

    /// Remembers the first name id seen for a thread index; returns true
    /// when this call was the first.
    fn note_thread_name(&mut self, thread_index: u32, name_id: u64) -> bool {
        let index = thread_index as usize;
        if self.thread_names_seen.len() <= index {
            self.thread_names_seen.resize(index + 1, 0);
        }
        if self.thread_names_seen[index] == 0 {
            self.thread_names_seen[index] = name_id;
            true
        } else {
            false
        }
    }
}
