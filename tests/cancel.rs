mod common;

use std::thread;
use std::time::Duration;

use common::{wait_until, Event, Harness};

const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn canceling_after_a_chunk_was_sent_releases_the_id_on_both_sides() {
    let harness = Harness::new(0, 15, 4, 1, 15, 10);

    let mut stream = harness.a.protocol.begin_request(0).unwrap();
    let id = stream.id();
    stream.feed(b"partial").unwrap();
    stream.flush().unwrap();
    drop(stream);

    harness.a.protocol.cancel(id).unwrap();

    assert!(wait_until(
        || harness.b.events().iter().any(|e| matches!(e, Event::Cancel { id: eid } if *eid == id)),
        TIMEOUT
    ));
    assert!(wait_until(
        || harness.a.events().iter().any(|e| matches!(e, Event::CancelAck { id: eid } if *eid == id)),
        TIMEOUT
    ));

    // The id is back in a's pool and reusable immediately.
    let reused = harness.a.protocol.begin_request(0).unwrap();
    assert_eq!(reused.id(), id);
}

#[test]
fn canceling_before_any_chunk_is_sent_emits_no_frame() {
    let harness = Harness::new(0, 15, 4, 1, 15, 10);

    let stream = harness.a.protocol.begin_request(0).unwrap();
    let id = stream.id();
    drop(stream);

    harness.a.protocol.cancel(id).unwrap();

    // Nothing has gone out for this id yet, so there's nothing to cancel on
    // the wire: b never sees a cancel, and a never sees an ack for one.
    thread::sleep(Duration::from_millis(200));
    assert!(!harness.b.events().iter().any(|e| matches!(e, Event::Cancel { id: eid } if *eid == id)));
    assert!(!harness.a.events().iter().any(|e| matches!(e, Event::CancelAck { id: eid } if *eid == id)));
}

#[test]
fn canceling_twice_is_idempotent() {
    let harness = Harness::new(0, 15, 4, 1, 15, 10);

    let mut stream = harness.a.protocol.begin_request(0).unwrap();
    let id = stream.id();
    stream.feed(b"partial").unwrap();
    stream.flush().unwrap();
    drop(stream);

    harness.a.protocol.cancel(id).unwrap();
    harness.a.protocol.cancel(id).unwrap();

    assert!(wait_until(
        || harness.a.events().iter().filter(|e| matches!(e, Event::CancelAck { id: eid } if *eid == id)).count() == 1,
        TIMEOUT
    ));
}
