//! End-to-end capture scenarios: a producer and a consumer in the same
//! process, wired through the real shared-memory segment.
//!
//! The scenarios share one initialised producer and therefore run
//! sequentially inside a single test. Each one records from a fresh thread
//! so it gets its own thread slot and recorder.

mod common;

use std::time::{Duration, Instant};

use common::{on_fresh_thread, poll_until};
use hopscotch_client as client;
use hopscotch_server::{Consumer, PendingData, TraceBatch};

fn batch_with<'a>(
    data: &'a PendingData,
    pred: impl Fn(&TraceBatch) -> bool,
) -> Option<&'a TraceBatch> {
    data.traces.values().find(|batch| pred(batch))
}

fn resolved<'a>(data: &'a PendingData, id: u64) -> Option<&'a str> {
    data.strings
        .iter()
        .find(|(entry_id, _)| *entry_id == id)
        .map(|(_, text)| text.as_str())
}

/// Traces at equal depth with no deeper frame in between must not overlap.
fn assert_depth_ordering(batch: &TraceBatch) {
    for depth in 0..=batch.max_depth {
        let mut previous_end = 0u64;
        for i in 0..batch.len() {
            if batch.depths[i] < depth {
                // A shallower frame closes the run of siblings.
                previous_end = 0;
            } else if batch.depths[i] == depth {
                let start = batch.starts[i] & !1;
                assert!(
                    start >= previous_end,
                    "sibling scopes at depth {depth} overlap"
                );
                previous_end = batch.ends[i];
            }
        }
    }
}

#[test]
fn capture_scenarios() {
    let _ = env_logger::builder().is_test(true).try_init();
    client::initialize().expect("producer initialisation");
    let pid = std::process::id() as i32;
    let mut consumer = Consumer::attach(pid).expect("consumer attach");
    consumer.set_listening(true);

    single_scope_with_static_name(&mut consumer);
    nested_scopes_with_zone_switch(&mut consumer);
    dynamic_name(&mut consumer);
    mutex_wait_and_release(&mut consumer);

    consumer.detach();
    client::shutdown();
}

/// S1: one top-level scope with static names.
fn single_scope_with_static_name(consumer: &mut Consumer) {
    on_fresh_thread(|| {
        client::enter("f.cpp", 10, "work", 0);
        client::leave();
    });

    let (data, _) = poll_until(consumer, |data| {
        batch_with(data, |batch| batch.lines == [10]).is_some()
    });
    let batch = batch_with(&data, |batch| batch.lines == [10]).unwrap();

    assert_eq!(batch.len(), 1);
    assert_eq!(batch.depths, [0]);
    assert_eq!(batch.zones, [0]);
    assert_eq!(batch.starts[0] & 1, 0, "static names carry no flag");
    assert!(batch.ends[0] >= batch.starts[0]);

    // The string data preceding the trace delivered both names.
    assert_eq!(resolved(&data, batch.file_ids[0]), Some("f.cpp"));
    assert_eq!(resolved(&data, batch.fct_ids[0]), Some("work"));
}

/// S2: nested scopes with a zone switch; the flush is ordered by scope
/// completion, so the inner scope comes first.
fn nested_scopes_with_zone_switch(consumer: &mut Consumer) {
    on_fresh_thread(|| {
        client::enter("a", 1, "outer", 0);
        client::enter("a", 2, "inner", 5);
        client::leave();
        client::leave();
    });

    let (data, _) = poll_until(consumer, |data| {
        batch_with(data, |batch| batch.zones.contains(&5)).is_some()
    });
    let batch = batch_with(&data, |batch| batch.zones.contains(&5)).unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.depths, [1, 0]);
    assert_eq!(batch.zones, [5, 0]);
    assert_eq!(batch.lines, [2, 1]);
    assert_eq!(batch.max_depth, 1);
    // The outer scope surrounds the inner one.
    assert!(batch.ends[1] >= batch.ends[0]);
    assert!(batch.starts[1] & !1 <= batch.starts[0] & !1);
    // Top-level ends are non-decreasing and siblings do not overlap.
    assert!(batch.ends.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_depth_ordering(batch);
}

/// S3: a dynamically named scope ships its name as a hash.
fn dynamic_name(consumer: &mut Consumer) {
    on_fresh_thread(|| {
        client::enter_dynamic("a", 3, "job-42", 0);
        client::leave();
    });

    let expected_id = client::str_hash("job-42");
    let (data, _) = poll_until(consumer, |data| {
        batch_with(data, |batch| batch.lines == [3]).is_some()
    });
    let batch = batch_with(&data, |batch| batch.lines == [3]).unwrap();

    assert_eq!(batch.starts[0] & 1, 1, "dynamic names are flagged");
    assert_eq!(batch.fct_ids[0], expected_id);
    assert_eq!(resolved(&data, expected_id), Some("job-42"));
}

/// S4: a mutex wait followed by a release on a later flush; a pairing pass
/// over the typed records reconstructs the hold duration.
fn mutex_wait_and_release(consumer: &mut Consumer) {
    const MUTEX: u64 = 0xAB;

    on_fresh_thread(|| {
        client::enter("m.rs", 1, "locked_region", 0);
        client::acquire_lock(MUTEX);
        // Make sure the wait is comfortably above the discard threshold.
        let spin_until = Instant::now() + Duration::from_micros(200);
        while Instant::now() < spin_until {
            std::hint::spin_loop();
        }
        client::lock_acquired();
        client::leave();

        client::enter("m.rs", 2, "unlock_site", 0);
        client::release_lock(MUTEX);
        client::leave();
    });

    let (data, _) = poll_until(consumer, |data| {
        data.lock_waits.values().any(|batch| !batch.is_empty())
            && data.unlocks.values().any(|events| !events.is_empty())
    });

    let waits = data
        .lock_waits
        .values()
        .find(|batch| !batch.is_empty())
        .unwrap();
    assert_eq!(waits.mutexes, [MUTEX]);
    let wait_start = waits.starts[0];
    let acquired_at = waits.ends[0];
    assert!(acquired_at >= wait_start);

    let unlocks = data
        .unlocks
        .values()
        .find(|events| !events.is_empty())
        .unwrap();
    assert_eq!(unlocks.len(), 1);
    assert_eq!(unlocks[0].mutex, MUTEX);

    // Pair the unlock with the preceding wait on the same mutex.
    let hold = unlocks[0].time.checked_sub(acquired_at);
    assert!(hold.is_some(), "unlock precedes acquisition");
}
