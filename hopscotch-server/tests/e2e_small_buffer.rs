//! S6: a ring buffer too small for a full trace batch. The oversized
//! TRACES frame is dropped and the producer's counters recover, while
//! heartbeats keep flowing and a later, smaller flush gets through.

mod common;

use std::time::Duration;

use common::{on_fresh_thread, poll_for, poll_until};
use hopscotch_client as client;
use hopscotch_server::Consumer;

/// Small enough that a TRACES frame with a dozen records (40 header +
/// 13 * 40 payload bytes) cannot be reserved.
const TINY_RING_BYTES: u64 = 256;

#[test]
fn oversized_batch_is_dropped_and_the_producer_recovers() {
    let _ = env_logger::builder().is_test(true).try_init();
    client::initialize_with(client::ClientConfig {
        shm_bytes: TINY_RING_BYTES,
        ..Default::default()
    })
    .expect("producer initialisation");
    let pid = std::process::id() as i32;
    let mut consumer = Consumer::attach(pid).expect("consumer attach");
    consumer.set_listening(true);
    assert_eq!(consumer.segment_size(), TINY_RING_BYTES);

    // Thirteen completed scopes flushed at once: the frame is larger than
    // the whole data area and must be dropped.
    on_fresh_thread(|| {
        client::enter("s.rs", 1, "outer", 0);
        for _ in 0..12 {
            client::enter("s.rs", 2, "inner", 0);
            client::leave();
        }
        client::leave();
    });

    let (data, totals) = poll_for(&mut consumer, Duration::from_millis(300));
    assert!(
        data.traces.is_empty(),
        "an oversized TRACES frame was delivered"
    );
    // Liveness is unaffected: the first flush still heartbeats.
    assert!(totals.heartbeats >= 1, "no heartbeat while dropping batches");

    // A later flush with fewer pending records fits and goes through,
    // proving the trace counters were reset rather than wedged.
    on_fresh_thread(|| {
        client::enter("s.rs", 3, "small", 0);
        client::leave();
    });
    let (data, _) = poll_until(&mut consumer, |data| {
        data.traces.values().any(|batch| batch.lines == [3])
    });
    let batch = data.traces.values().find(|b| b.lines == [3]).unwrap();
    assert_eq!(batch.len(), 1);
    assert!(data
        .strings
        .iter()
        .any(|(id, text)| *id == batch.fct_ids[0] && text == "small"));

    consumer.detach();
    client::shutdown();
}
