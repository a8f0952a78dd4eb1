//! Helpers shared by the end-to-end tests: polling the consumer until a
//! condition holds and folding successive pending batches together.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use hopscotch_server::{Consumer, PendingData};

#[derive(Default, Clone, Copy)]
pub struct PumpTotals {
    pub messages: usize,
    pub heartbeats: usize,
    pub stale: usize,
}

pub fn merge_pending(acc: &mut PendingData, got: PendingData) {
    for (thread, mut batch) in got.traces {
        acc.traces.entry(thread).or_default().append(&mut batch);
    }
    for (thread, mut batch) in got.lock_waits {
        acc.lock_waits.entry(thread).or_default().append(&mut batch);
    }
    for (thread, events) in got.unlocks {
        acc.unlocks.entry(thread).or_default().extend(events);
    }
    for (thread, batch) in got.core_events {
        let target = acc.core_events.entry(thread).or_default();
        for i in 0..batch.len() {
            target.starts.push(batch.starts[i]);
            target.ends.push(batch.ends[i]);
            target.cores.push(batch.cores[i]);
        }
    }
    acc.strings.extend(got.strings);
    acc.thread_names.extend(got.thread_names);
}

/// Pumps the consumer until `done` is satisfied or panics after ten
/// seconds. Returns everything received.
pub fn poll_until(
    consumer: &mut Consumer,
    mut done: impl FnMut(&PendingData) -> bool,
) -> (PendingData, PumpTotals) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut acc = PendingData::default();
    let mut totals = PumpTotals::default();
    loop {
        let stats = consumer.poll();
        totals.messages += stats.messages;
        totals.heartbeats += stats.heartbeats;
        totals.stale += stats.stale;
        merge_pending(&mut acc, consumer.take_pending());
        if done(&acc) {
            return (acc, totals);
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for profiler data"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Pumps the consumer for a fixed window and returns whatever arrived.
pub fn poll_for(consumer: &mut Consumer, window: Duration) -> (PendingData, PumpTotals) {
    let deadline = Instant::now() + window;
    let mut acc = PendingData::default();
    let mut totals = PumpTotals::default();
    while Instant::now() < deadline {
        let stats = consumer.poll();
        totals.messages += stats.messages;
        totals.heartbeats += stats.heartbeats;
        totals.stale += stats.stale;
        merge_pending(&mut acc, consumer.take_pending());
        std::thread::sleep(Duration::from_millis(1));
    }
    (acc, totals)
}

/// Runs producer-side work on a fresh thread so it records under its own
/// thread slot with a clean recorder.
pub fn on_fresh_thread(work: impl FnOnce() + Send) {
    std::thread::scope(|scope| {
        scope.spawn(work).join().expect("producer thread panicked");
    });
}
