//! The consumer side of the hopscotch profiler.
//!
//! [`Consumer`] is the synchronous building block: it attaches to the
//! shared-memory segment of an instrumented process and pumps wire messages
//! into typed batches on demand. [`Server`] wraps a consumer in its own
//! thread, reconnecting with backoff, watching producer liveness and
//! exposing the accumulated data through [`Server::take_pending`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use hopscotch_ipc::clock;
use hopscotch_ipc::segment::{SegmentError, SharedSegment};
use hopscotch_ipc::{CORE_MERGE_MICROS, PRODUCER_DEATH_CYCLES};

mod dispatcher;
mod records;
mod string_db;

pub use dispatcher::RunStats;
pub use hopscotch_ipc::segment::ConnectionState;
pub use hopscotch_ipc::wire::{CoreRecord, LockWaitRecord, TraceRecord, UnlockRecord};
pub use records::{CoreEventBatch, LockWaitBatch, PendingData, TraceBatch};
pub use string_db::StringDb;

use dispatcher::Dispatcher;

/// A synchronous attachment to one producer's segment. All pumping happens
/// on the caller's thread.
pub struct Consumer {
    segment: Arc<SharedSegment>,
    dispatcher: Dispatcher,
    string_db: Arc<Mutex<StringDb>>,
    pending: Arc<Mutex<PendingData>>,
    core_merge_cycles: u64,
}

impl Consumer {
    /// Attaches to the segment of the process with the given pid. Fails
    /// when there is no segment, the protocol versions differ, or the
    /// segment is inaccessible; [`SegmentError::connection_state`] maps
    /// the failure to a reportable state.
    pub fn attach(pid: i32) -> Result<Consumer, SegmentError> {
        Consumer::attach_with(
            pid,
            Arc::new(Mutex::new(StringDb::new())),
            Arc::new(Mutex::new(PendingData::default())),
        )
    }

    fn attach_with(
        pid: i32,
        string_db: Arc<Mutex<StringDb>>,
        pending: Arc<Mutex<PendingData>>,
    ) -> Result<Consumer, SegmentError> {
        let segment = Arc::new(SharedSegment::open(pid)?);
        let core_merge_cycles = clock::nanos_to_cycles(
            CORE_MERGE_MICROS * 1000,
            segment.tsc_frequency_mhz().max(1.0),
        );
        let mut consumer = Consumer {
            dispatcher: Dispatcher::new(string_db.clone(), pending.clone()),
            segment,
            string_db,
            pending,
            core_merge_cycles,
        };
        // Whatever is sitting in the ring belongs to a previous consumer.
        consumer.drain_ring();
        Ok(consumer)
    }

    /// Consumes one contiguous run of published bytes and dispatches every
    /// message in it. Returns what was processed; all zeros when the ring
    /// was empty.
    pub fn poll(&mut self) -> RunStats {
        let min_timestamp = self.segment.last_reset();
        let Some((offset, len)) = self.segment.ring().consume() else {
            return RunStats::default();
        };
        let run = unsafe { self.segment.consumed_bytes(offset, len) };
        let stats = self
            .dispatcher
            .dispatch_run(run, min_timestamp, self.core_merge_cycles);
        self.segment.ring().release(len);
        match stats {
            Ok(stats) => stats,
            Err(err) => {
                // A malformed frame poisons the rest of the run; drop it
                // and carry on with whatever the producer sends next.
                log::error!("dropping a corrupt message run: {err}");
                RunStats::default()
            }
        }
    }

    /// Toggles whether the producer should ship data at all.
    pub fn set_listening(&self, listening: bool) {
        self.segment.set_listening(listening);
    }

    /// Forgets everything received so far and tells the producers to do
    /// the same: clears the string database and pending data, drains the
    /// ring, and advances the shared reset timestamp.
    pub fn clear(&mut self) {
        self.string_db.lock().clear();
        *self.pending.lock() = PendingData::default();
        self.dispatcher.forget_thread_names();
        self.drain_ring();
        self.segment.bump_last_reset();
    }

    /// Swaps out everything accumulated since the previous call.
    pub fn take_pending(&self) -> PendingData {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn string_db(&self) -> Arc<Mutex<StringDb>> {
        self.string_db.clone()
    }

    pub fn producer_connected(&self) -> bool {
        self.segment.has_connected_producer()
    }

    /// The producer's estimated TSC frequency in MHz.
    pub fn tsc_frequency(&self) -> f32 {
        self.segment.tsc_frequency_mhz()
    }

    /// Byte size of the segment's ring buffer data area.
    pub fn segment_size(&self) -> u64 {
        self.segment.data_size()
    }

    pub fn producer_pid(&self) -> i32 {
        self.segment.pid()
    }

    /// Detaches from the segment, clearing the consumer bits.
    pub fn detach(self) {}

    fn drain_ring(&mut self) {
        while let Some((_, len)) = self.segment.ring().consume() {
            self.segment.ring().release(len);
        }
    }

    fn segment_handle(&self) -> Arc<SharedSegment> {
        self.segment.clone()
    }
}

struct ServerShared {
    state: Mutex<ServerState>,
    pending: Arc<Mutex<PendingData>>,
    string_db: Arc<Mutex<StringDb>>,
    segment: Mutex<Option<Arc<SharedSegment>>>,
}

struct ServerState {
    connection: ConnectionState,
    recording: bool,
    clear_requested: bool,
}

enum Control {
    Stop,
}

/// Owns a consumer thread that keeps trying to attach to the target pid,
/// pumps its messages and tracks producer liveness.
pub struct Server {
    shared: Arc<ServerShared>,
    control_tx: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Spawns the consumer thread for the given target pid. Attachment
    /// failures are retried with backoff until [`Server::stop`].
    pub fn start(pid: i32) -> Server {
        let shared = Arc::new(ServerShared {
            state: Mutex::new(ServerState {
                connection: ConnectionState::NotConnected,
                recording: false,
                clear_requested: false,
            }),
            pending: Arc::new(Mutex::new(PendingData::default())),
            string_db: Arc::new(Mutex::new(StringDb::new())),
            segment: Mutex::new(None),
        });
        let (control_tx, control_rx) = crossbeam_channel::bounded(4);

        let thread = std::thread::Builder::new()
            .name("hopscotch-server".into())
            .spawn({
                let shared = shared.clone();
                move || run_server_loop(&shared, &control_rx, pid)
            })
            .expect("spawning the consumer thread");

        Server {
            shared,
            control_tx,
            thread: Some(thread),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    /// Starts or stops recording. While recording is off the producer
    /// discards its batches locally.
    pub fn set_recording(&self, recording: bool) {
        self.shared.state.lock().recording = recording;
        if let Some(segment) = self.shared.segment.lock().as_ref() {
            segment.set_listening(recording);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.state.lock().recording
    }

    /// Asks the consumer thread to drop everything received so far and
    /// reset the producers' string state.
    pub fn request_clear(&self) {
        self.shared.state.lock().clear_requested = true;
    }

    /// Swaps out everything accumulated since the previous call.
    pub fn take_pending(&self) -> PendingData {
        std::mem::take(&mut *self.shared.pending.lock())
    }

    pub fn string_db(&self) -> Arc<Mutex<StringDb>> {
        self.shared.string_db.clone()
    }

    /// The producer's estimated TSC frequency in MHz, once attached.
    pub fn tsc_frequency(&self) -> Option<f32> {
        self.shared
            .segment
            .lock()
            .as_ref()
            .map(|segment| segment.tsc_frequency_mhz())
    }

    pub fn segment_size(&self) -> Option<u64> {
        self.shared
            .segment
            .lock()
            .as_ref()
            .map(|segment| segment.data_size())
    }

    pub fn producer_pid(&self) -> Option<i32> {
        self.shared.segment.lock().as_ref().map(|segment| segment.pid())
    }

    /// Stops the consumer thread and detaches.
    pub fn stop(&mut self) {
        let _ = self.control_tx.send(Control::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        *self.shared.segment.lock() = None;
        self.shared.state.lock().connection = ConnectionState::NotConnected;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

const RECONNECT_STEP_MS: u64 = 10;
const RECONNECT_MAX_MS: u64 = 500;
const IDLE_WAIT_MS: u64 = 100;
const IDLE_WAIT_NO_PRODUCER_MS: u64 = 1000;

fn run_server_loop(shared: &ServerShared, control_rx: &Receiver<Control>, pid: i32) {
    let mut consumer: Option<Consumer> = None;
    let mut reconnect_ms = RECONNECT_STEP_MS;
    let mut last_signal = clock::now();

    loop {
        if consumer.is_none() {
            match Consumer::attach_with(pid, shared.string_db.clone(), shared.pending.clone()) {
                Ok(attached) => {
                    log::info!("attached to producer pid {pid}");
                    reconnect_ms = RECONNECT_STEP_MS;
                    last_signal = clock::now();
                    let recording = {
                        let mut state = shared.state.lock();
                        state.connection = ConnectionState::Connected;
                        state.recording
                    };
                    attached.set_listening(recording);
                    *shared.segment.lock() = Some(attached.segment_handle());
                    consumer = Some(attached);
                }
                Err(err) => {
                    shared.state.lock().connection = err.connection_state();
                    match control_rx.recv_timeout(Duration::from_millis(reconnect_ms)) {
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    reconnect_ms = (reconnect_ms + RECONNECT_STEP_MS).min(RECONNECT_MAX_MS);
                    continue;
                }
            }
        }

        let active = consumer.as_mut().expect("attached above");

        let clearing = {
            let mut state = shared.state.lock();
            std::mem::take(&mut state.clear_requested)
        };
        if clearing {
            active.clear();
            continue;
        }

        let stats = active.poll();
        if stats.messages > 0 {
            last_signal = clock::now();
            // Keep draining while data is flowing.
            continue;
        }

        let producer_alive = active.producer_connected();
        let silent_for = clock::now().saturating_sub(last_signal);
        let connection = if !producer_alive || silent_for > PRODUCER_DEATH_CYCLES {
            ConnectionState::ConnectedNoClient
        } else {
            ConnectionState::Connected
        };
        shared.state.lock().connection = connection;

        // Nothing to read: wait for a stop request with a timeout, which
        // doubles as the pump interval.
        let wait_ms = if producer_alive {
            IDLE_WAIT_MS
        } else {
            IDLE_WAIT_NO_PRODUCER_MS
        };
        match control_rx.recv_timeout(Duration::from_millis(wait_ms)) {
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    if let Some(active) = consumer {
        active.set_listening(false);
    }
    shared.state.lock().connection = ConnectionState::NotConnected;
}
