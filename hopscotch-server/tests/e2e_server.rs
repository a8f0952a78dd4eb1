//! The threaded server against a live producer in the same process:
//! attach-by-retry, recording toggle, pending hand-off and shutdown.

use std::time::{Duration, Instant};

use hopscotch_client as client;
use hopscotch_server::{ConnectionState, PendingData, Server};

#[test]
fn server_thread_attaches_and_delivers_batches() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Start the server first: it must retry until the producer appears.
    let pid = std::process::id() as i32;
    let mut server = Server::start(pid);
    server.set_recording(true);

    std::thread::sleep(Duration::from_millis(50));
    client::initialize().expect("producer initialisation");

    // Wait until the server's thread made it through attach.
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.connection_state() != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "server never attached");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.producer_pid(), Some(pid));
    assert!(server.segment_size().is_some());
    assert!(server.tsc_frequency().unwrap_or(0.0) > 0.0);

    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                client::set_thread_name("busy-bee");
                for _ in 0..5 {
                    client::enter("srv.rs", 21, "served", 0);
                    client::leave();
                }
            })
            .join()
            .expect("producer thread panicked");
    });

    let mut received = PendingData::default();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let got = server.take_pending();
        for (thread, mut batch) in got.traces {
            received.traces.entry(thread).or_default().append(&mut batch);
        }
        received.strings.extend(got.strings);
        received.thread_names.extend(got.thread_names);
        if received.traces.values().map(|b| b.len()).sum::<usize>() >= 5 {
            break;
        }
        assert!(Instant::now() < deadline, "server never delivered traces");
        std::thread::sleep(Duration::from_millis(10));
    }

    // The thread name travelled with the frames and resolves in the
    // server's string database.
    assert_eq!(received.thread_names.len(), 1);
    let (_, name_id) = received.thread_names[0];
    assert_eq!(
        server.string_db().lock().get(name_id),
        Some("busy-bee"),
        "thread name did not resolve"
    );
    assert!(server
        .string_db()
        .lock()
        .find_matching("SERVED")
        .iter()
        .any(|id| received.traces.values().any(|b| b.fct_ids.contains(id))));

    server.stop();
    assert_eq!(server.connection_state(), ConnectionState::NotConnected);
    client::shutdown();
}
