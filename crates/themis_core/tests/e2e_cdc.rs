//! Change-data-capture scenarios: monotonicity, resume, streaming.

use std::time::Duration;
use themis_core::changefeed::{CdcStream, StreamFrame};
use themis_core::config::SseConfig;
use themis_core::{Database, Entity, Value};

fn put_users(db: &Database, count: u64) {
    for n in 1..=count {
        let mut entity = Entity::new(format!("users:u{n}"));
        entity.set_field("n", Value::Int(i64::try_from(n).unwrap()));
        db.put(&entity).unwrap();
    }
}

#[test]
fn sequences_are_strictly_increasing_without_gaps() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 10);

    let events = db.changefeed().unwrap().query(0, 100, None, None).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=10).collect();
    assert_eq!(sequences, expected);
}

#[test]
fn resume_is_exclusive_and_complete() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 10);

    // A consumer resuming from L=5 sees exactly 6..10.
    let events = db.changefeed().unwrap().query(5, 100, None, None).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![6, 7, 8, 9, 10]);

    // No duplicates across a chunked resume.
    let first = db.changefeed().unwrap().query(0, 4, None, None).unwrap();
    let cursor = first.last().unwrap().sequence;
    let second = db.changefeed().unwrap().query(cursor, 100, None, None).unwrap();
    let mut all: Vec<u64> = first.iter().chain(&second).map(|e| e.sequence).collect();
    let deduped = all.clone();
    all.dedup();
    assert_eq!(all, deduped);
    assert_eq!(all.len(), 10);
}

#[test]
fn deletes_produce_delete_events() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 2);
    db.delete("users:u1").unwrap();

    let events = db.changefeed().unwrap().query(0, 100, None, None).unwrap();
    assert_eq!(events.len(), 3);
    let last = events.last().unwrap();
    assert_eq!(last.key, "users:u1");
    assert_eq!(
        last.event_type,
        themis_core::changefeed::CdcEventType::Delete
    );
    assert!(last.value.is_none());
}

#[test]
fn prefix_filter_scopes_events() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 3);
    let mut order = Entity::new("orders:1");
    order.set_field("amt", Value::Int(5));
    db.put(&order).unwrap();

    let events = db
        .changefeed()
        .unwrap()
        .query(0, 100, Some("orders:"), None)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key, "orders:1");
}

#[test]
fn retention_drops_history() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 10);

    let removed = db.changefeed().unwrap().retention(6).unwrap();
    assert_eq!(removed, 5);
    let events = db.changefeed().unwrap().query(0, 100, None, None).unwrap();
    assert_eq!(events.first().unwrap().sequence, 6);
}

#[test]
fn long_poll_blocks_until_write() {
    let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
    let log = db.changefeed().unwrap().clone();

    let waiter = std::thread::spawn(move || {
        log.query(0, 10, None, Some(Duration::from_secs(5))).unwrap()
    });
    std::thread::sleep(Duration::from_millis(50));
    put_users(&db, 1);

    let events = waiter.join().unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn stream_scenario_resume_then_heartbeat() {
    let db = Database::open_in_memory().unwrap();
    put_users(&db, 10);

    let config = SseConfig {
        heartbeat_ms: 100,
        ..SseConfig::default()
    };
    let (mut rx, handle) =
        CdcStream::spawn(db.changefeed().unwrap().clone(), 5, None, config);

    // Header first, carrying the retry hint.
    assert!(matches!(
        rx.recv().await.unwrap(),
        StreamFrame::Header { retry_ms: 3000 }
    ));

    // Events 6..10, exactly.
    let mut sequences = Vec::new();
    while sequences.len() < 5 {
        match rx.recv().await.unwrap() {
            StreamFrame::Event(event) => sequences.push(event.sequence),
            StreamFrame::Heartbeat | StreamFrame::Header { .. } => {}
        }
    }
    assert_eq!(sequences, vec![6, 7, 8, 9, 10]);

    // Then heartbeats while idle.
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, StreamFrame::Heartbeat);
    assert_eq!(handle.dropped(), 0);
    handle.close();
}
