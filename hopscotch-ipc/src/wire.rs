//! The framed binary format carried through the ring buffer.
//!
//! Every message starts with a fixed 40-byte header followed by a payload
//! whose size is derived from the header's `count` field and the message
//! type. All fields are little-endian. Messages are padded to a multiple of
//! eight bytes when reserved, and the parser advances by the same padded
//! length, so there is no end-of-stream marker.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Size of the framing header: type, thread index, thread id, timestamp,
/// thread name id, count, and four bytes of padding to keep payloads
/// 8-byte aligned.
pub const HEADER_BYTES: usize = 40;

/// Bytes per trace in the struct-of-arrays TRACES payload.
pub const TRACE_RECORD_BYTES: usize = 40;
/// Bytes per LOCK_WAIT record: mutex, start, end, depth, padding.
pub const LOCK_WAIT_RECORD_BYTES: usize = 28;
/// Bytes per UNLOCK_EVENT record: mutex, time.
pub const UNLOCK_RECORD_BYTES: usize = 16;
/// Bytes per CORE_EVENT record: start, end, core.
pub const CORE_RECORD_BYTES: usize = 20;

/// Mask for the "dynamic function name" flag carried in the low bit of a
/// trace's start timestamp.
pub const DYNAMIC_NAME_FLAG: u64 = 1;

#[inline]
pub fn align8(len: u64) -> u64 {
    (len + 7) & !7
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Traces = 0,
    StringData = 1,
    LockWait = 2,
    UnlockEvent = 3,
    Heartbeat = 4,
    CoreEvent = 5,
}

impl MsgType {
    fn from_u32(raw: u32) -> Option<MsgType> {
        match raw {
            0 => Some(MsgType::Traces),
            1 => Some(MsgType::StringData),
            2 => Some(MsgType::LockWait),
            3 => Some(MsgType::UnlockEvent),
            4 => Some(MsgType::Heartbeat),
            5 => Some(MsgType::CoreEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message header is truncated ({0} bytes)")]
    TruncatedHeader(usize),
    #[error("message payload is truncated (expected {expected} bytes, have {available})")]
    TruncatedPayload { expected: usize, available: usize },
    #[error("unknown message type {0}")]
    UnknownType(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub thread_index: u32,
    pub thread_id: u64,
    pub timestamp: u64,
    pub thread_name_id: u64,
    /// Record count, or byte count for STRING_DATA.
    pub count: u32,
}

impl MsgHeader {
    /// Size of the payload this header announces, before padding.
    pub fn payload_len(&self) -> usize {
        let count = self.count as usize;
        match self.msg_type {
            MsgType::Traces => count * TRACE_RECORD_BYTES,
            MsgType::StringData => count,
            MsgType::LockWait => count * LOCK_WAIT_RECORD_BYTES,
            MsgType::UnlockEvent => count * UNLOCK_RECORD_BYTES,
            MsgType::CoreEvent => count * CORE_RECORD_BYTES,
            MsgType::Heartbeat => 0,
        }
    }

    /// Total padded length of the message in the ring buffer.
    pub fn message_len(&self) -> usize {
        align8((HEADER_BYTES + self.payload_len()) as u64) as usize
    }
}

pub fn encode_header(buf: &mut [u8], header: &MsgHeader) {
    LittleEndian::write_u32(&mut buf[0..4], header.msg_type as u32);
    LittleEndian::write_u32(&mut buf[4..8], header.thread_index);
    LittleEndian::write_u64(&mut buf[8..16], header.thread_id);
    LittleEndian::write_u64(&mut buf[16..24], header.timestamp);
    LittleEndian::write_u64(&mut buf[24..32], header.thread_name_id);
    LittleEndian::write_u32(&mut buf[32..36], header.count);
    LittleEndian::write_u32(&mut buf[36..40], 0);
}

pub fn decode_header(buf: &[u8]) -> Result<MsgHeader, WireError> {
    if buf.len() < HEADER_BYTES {
        return Err(WireError::TruncatedHeader(buf.len()));
    }
    let raw_type = LittleEndian::read_u32(&buf[0..4]);
    let msg_type = MsgType::from_u32(raw_type).ok_or(WireError::UnknownType(raw_type))?;
    Ok(MsgHeader {
        msg_type,
        thread_index: LittleEndian::read_u32(&buf[4..8]),
        thread_id: LittleEndian::read_u64(&buf[8..16]),
        timestamp: LittleEndian::read_u64(&buf[16..24]),
        thread_name_id: LittleEndian::read_u64(&buf[24..32]),
        count: LittleEndian::read_u32(&buf[32..36]),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    /// Start cycle; the low bit is the dynamic-name flag.
    pub start: u64,
    pub end: u64,
    pub file_id: u64,
    pub fct_id: u64,
    pub line: u32,
    pub depth: u16,
    pub zone: u16,
}

impl TraceRecord {
    #[inline]
    pub fn has_dynamic_name(&self) -> bool {
        self.start & DYNAMIC_NAME_FLAG != 0
    }

    /// Start cycle with the flag bit masked off.
    #[inline]
    pub fn start_time(&self) -> u64 {
        self.start & !DYNAMIC_NAME_FLAG
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockWaitRecord {
    pub mutex: u64,
    pub start: u64,
    pub end: u64,
    pub depth: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnlockRecord {
    pub mutex: u64,
    pub time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreRecord {
    pub start: u64,
    pub end: u64,
    pub core: u32,
}

/// Writes the struct-of-arrays TRACES payload: all ends, all starts, all
/// file ids, all function ids, all line numbers, all depths, all zones.
/// `records` must yield exactly `count` items.
pub fn encode_traces<I>(payload: &mut [u8], count: usize, records: I)
where
    I: Iterator<Item = TraceRecord>,
{
    let starts_base = count * 8;
    let files_base = count * 16;
    let fcts_base = count * 24;
    let lines_base = count * 32;
    let depths_base = count * 36;
    let zones_base = count * 38;
    debug_assert!(payload.len() >= count * TRACE_RECORD_BYTES);

    let mut written = 0;
    for (i, record) in records.enumerate() {
        LittleEndian::write_u64(&mut payload[i * 8..], record.end);
        LittleEndian::write_u64(&mut payload[starts_base + i * 8..], record.start);
        LittleEndian::write_u64(&mut payload[files_base + i * 8..], record.file_id);
        LittleEndian::write_u64(&mut payload[fcts_base + i * 8..], record.fct_id);
        LittleEndian::write_u32(&mut payload[lines_base + i * 4..], record.line);
        LittleEndian::write_u16(&mut payload[depths_base + i * 2..], record.depth);
        LittleEndian::write_u16(&mut payload[zones_base + i * 2..], record.zone);
        written += 1;
    }
    debug_assert_eq!(written, count);
}

/// Borrowed view over a TRACES payload.
pub struct TracesView<'a> {
    payload: &'a [u8],
    count: usize,
}

impl<'a> TracesView<'a> {
    pub fn new(payload: &'a [u8], count: usize) -> Result<TracesView<'a>, WireError> {
        let expected = count * TRACE_RECORD_BYTES;
        if payload.len() < expected {
            return Err(WireError::TruncatedPayload {
                expected,
                available: payload.len(),
            });
        }
        Ok(TracesView { payload, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn record(&self, i: usize) -> TraceRecord {
        assert!(i < self.count);
        let n = self.count;
        TraceRecord {
            end: LittleEndian::read_u64(&self.payload[i * 8..]),
            start: LittleEndian::read_u64(&self.payload[n * 8 + i * 8..]),
            file_id: LittleEndian::read_u64(&self.payload[n * 16 + i * 8..]),
            fct_id: LittleEndian::read_u64(&self.payload[n * 24 + i * 8..]),
            line: LittleEndian::read_u32(&self.payload[n * 32 + i * 4..]),
            depth: LittleEndian::read_u16(&self.payload[n * 36 + i * 2..]),
            zone: LittleEndian::read_u16(&self.payload[n * 38 + i * 2..]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = TraceRecord> + '_ {
        (0..self.count).map(move |i| self.record(i))
    }
}

pub fn encode_lock_waits<I>(payload: &mut [u8], count: usize, records: I)
where
    I: Iterator<Item = LockWaitRecord>,
{
    debug_assert!(payload.len() >= count * LOCK_WAIT_RECORD_BYTES);
    for (i, record) in records.enumerate() {
        let base = i * LOCK_WAIT_RECORD_BYTES;
        LittleEndian::write_u64(&mut payload[base..], record.mutex);
        LittleEndian::write_u64(&mut payload[base + 8..], record.start);
        LittleEndian::write_u64(&mut payload[base + 16..], record.end);
        LittleEndian::write_u16(&mut payload[base + 24..], record.depth);
        LittleEndian::write_u16(&mut payload[base + 26..], 0);
    }
}

pub fn decode_lock_waits(
    payload: &[u8],
    count: usize,
) -> Result<impl Iterator<Item = LockWaitRecord> + '_, WireError> {
    let expected = count * LOCK_WAIT_RECORD_BYTES;
    if payload.len() < expected {
        return Err(WireError::TruncatedPayload {
            expected,
            available: payload.len(),
        });
    }
    Ok((0..count).map(move |i| {
        let base = i * LOCK_WAIT_RECORD_BYTES;
        LockWaitRecord {
            mutex: LittleEndian::read_u64(&payload[base..]),
            start: LittleEndian::read_u64(&payload[base + 8..]),
            end: LittleEndian::read_u64(&payload[base + 16..]),
            depth: LittleEndian::read_u16(&payload[base + 24..]),
        }
    }))
}

pub fn encode_unlocks<I>(payload: &mut [u8], count: usize, records: I)
where
    I: Iterator<Item = UnlockRecord>,
{
    debug_assert!(payload.len() >= count * UNLOCK_RECORD_BYTES);
    for (i, record) in records.enumerate() {
        let base = i * UNLOCK_RECORD_BYTES;
        LittleEndian::write_u64(&mut payload[base..], record.mutex);
        LittleEndian::write_u64(&mut payload[base + 8..], record.time);
    }
}

pub fn decode_unlocks(
    payload: &[u8],
    count: usize,
) -> Result<impl Iterator<Item = UnlockRecord> + '_, WireError> {
    let expected = count * UNLOCK_RECORD_BYTES;
    if payload.len() < expected {
        return Err(WireError::TruncatedPayload {
            expected,
            available: payload.len(),
        });
    }
    Ok((0..count).map(move |i| {
        let base = i * UNLOCK_RECORD_BYTES;
        UnlockRecord {
            mutex: LittleEndian::read_u64(&payload[base..]),
            time: LittleEndian::read_u64(&payload[base + 8..]),
        }
    }))
}

pub fn encode_core_events<I>(payload: &mut [u8], count: usize, records: I)
where
    I: Iterator<Item = CoreRecord>,
{
    debug_assert!(payload.len() >= count * CORE_RECORD_BYTES);
    for (i, record) in records.enumerate() {
        let base = i * CORE_RECORD_BYTES;
        LittleEndian::write_u64(&mut payload[base..], record.start);
        LittleEndian::write_u64(&mut payload[base + 8..], record.end);
        LittleEndian::write_u32(&mut payload[base + 16..], record.core);
    }
}

pub fn decode_core_events(
    payload: &[u8],
    count: usize,
) -> Result<impl Iterator<Item = CoreRecord> + '_, WireError> {
    let expected = count * CORE_RECORD_BYTES;
    if payload.len() < expected {
        return Err(WireError::TruncatedPayload {
            expected,
            available: payload.len(),
        });
    }
    Ok((0..count).map(move |i| {
        let base = i * CORE_RECORD_BYTES;
        CoreRecord {
            start: LittleEndian::read_u64(&payload[base..]),
            end: LittleEndian::read_u64(&payload[base + 8..]),
            core: LittleEndian::read_u32(&payload[base + 16..]),
        }
    }))
}

/// Iterates the `[id: u64][nul-terminated text, padded to 8]` entries of a
/// STRING_DATA payload or a string-table byte image.
pub fn string_entries(data: &[u8]) -> StringEntryIter<'_> {
    StringEntryIter { data, pos: 0 }
}

pub struct StringEntryIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for StringEntryIter<'a> {
    type Item = (u64, &'a str);

    fn next(&mut self) -> Option<(u64, &'a str)> {
        if self.pos + 8 > self.data.len() {
            return None;
        }
        let id = LittleEndian::read_u64(&self.data[self.pos..]);
        let text_start = self.pos + 8;
        let rest = &self.data[text_start..];
        let text_len = rest.iter().position(|&b| b == 0)?;
        let text = std::str::from_utf8(&rest[..text_len]).unwrap_or("");
        self.pos = text_start + align8(text_len as u64 + 1) as usize;
        Some((id, text))
    }
}
