//! Change-data-capture log and streaming.
//!
//! The log is append-only at `changefeed:<seq20>` in its own column
//! family. The orchestrator appends exactly one event per entity mutation
//! inside the commit batch, so the event's sequence IS the commit
//! sequence. Consumers either poll (with an optional bounded long-poll) or
//! attach a stream session that emits SSE-formatted frames with exclusive
//! `last_event_id` resume, a drop-oldest ring buffer, heartbeats, and an
//! optional per-second rate cap.

use crate::config::SseConfig;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use themis_storage::{ColumnFamily, KvStore, WriteBatch};
use tokio::sync::mpsc;
use tracing::debug;

const SEQ_WIDTH: usize = 20;

/// The kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CdcEventType {
    /// Entity inserted or replaced.
    Put,
    /// Entity removed.
    Delete,
}

/// One change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcEvent {
    /// Commit sequence; strictly increasing, no gaps under steady state.
    pub sequence: u64,
    /// Mutation kind.
    #[serde(rename = "type")]
    pub event_type: CdcEventType,
    /// The entity key (`<table>:<pk>`).
    pub key: String,
    /// New field values for puts; absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Commit wall-clock time.
    pub timestamp_ms: u64,
    /// Free-form metadata (writer id, request id).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl CdcEvent {
    /// The log key for a sequence.
    #[must_use]
    pub fn key_for(sequence: u64) -> Vec<u8> {
        format!("changefeed:{sequence:0SEQ_WIDTH$}").into_bytes()
    }
}

/// The change-data log.
///
/// Owns `changefeed:*`. The append path is a pure batch-op builder; reads
/// never block appends.
pub struct CdcLog {
    store: Arc<KvStore>,
    /// Latest appended sequence, guarded for long-poll wakeups.
    latest: Mutex<u64>,
    appended: Condvar,
}

impl CdcLog {
    /// Opens the log, recovering the latest sequence from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the tail scan fails.
    pub fn open(store: Arc<KvStore>) -> CoreResult<Self> {
        let tail = store.scan_prefix(ColumnFamily::Changefeed, b"changefeed:", Some(1), true)?;
        let latest = match tail.first() {
            Some((key, _)) => parse_sequence(key)?,
            None => 0,
        };
        debug!(latest, "change-data log opened");
        Ok(Self {
            store,
            latest: Mutex::new(latest),
            appended: Condvar::new(),
        })
    }

    /// Builds the batch operation appending `event`.
    ///
    /// Called by the commit coordinator inside the entity's batch; the
    /// event's `sequence` must be the batch's commit sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the event fails to serialize.
    pub fn append_op(&self, event: &CdcEvent, batch: &mut WriteBatch) -> CoreResult<()> {
        let bytes = serde_json::to_vec(event)
            .map_err(|e| CoreError::invalid_operation(e.to_string()))?;
        batch.put(ColumnFamily::Changefeed, CdcEvent::key_for(event.sequence), bytes);
        Ok(())
    }

    /// Publishes a committed sequence to long-poll waiters.
    pub fn notify_appended(&self, sequence: u64) {
        let mut latest = self.latest.lock();
        if sequence > *latest {
            *latest = sequence;
        }
        self.appended.notify_all();
    }

    /// The latest appended sequence (0 when empty).
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        *self.latest.lock()
    }

    /// Reads events with `sequence > from_seq`, ascending, at most
    /// `limit`, optionally filtered to keys starting with `key_prefix`.
    ///
    /// With `long_poll`, an empty result waits (bounded) for the next
    /// append, then rescans once.
    ///
    /// # Errors
    ///
    /// Returns an error if stored events fail to decode.
    pub fn query(
        &self,
        from_seq: u64,
        limit: usize,
        key_prefix: Option<&str>,
        long_poll: Option<Duration>,
    ) -> CoreResult<Vec<CdcEvent>> {
        let events = self.scan(from_seq, limit, key_prefix)?;
        if !events.is_empty() {
            return Ok(events);
        }
        let Some(wait) = long_poll else {
            return Ok(events);
        };

        let deadline = Instant::now() + wait;
        let mut latest = self.latest.lock();
        while *latest <= from_seq {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            self.appended.wait_for(&mut latest, deadline - now);
        }
        drop(latest);
        self.scan(from_seq, limit, key_prefix)
    }

    fn scan(
        &self,
        from_seq: u64,
        limit: usize,
        key_prefix: Option<&str>,
    ) -> CoreResult<Vec<CdcEvent>> {
        let lo = CdcEvent::key_for(from_seq.saturating_add(1));
        let entries = self.store.scan_range(
            ColumnFamily::Changefeed,
            std::ops::Bound::Included(lo),
            std::ops::Bound::Unbounded,
            None,
            false,
        )?;

        let mut out = Vec::new();
        for (_, bytes) in entries {
            let event: CdcEvent = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::invalid_operation(format!("corrupt CDC event: {e}")))?;
            if key_prefix.is_some_and(|p| !event.key.starts_with(p)) {
                continue;
            }
            out.push(event);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Deletes events with `sequence < before_seq`. Returns the removed
    /// count.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep commit fails.
    pub fn retention(&self, before_seq: u64) -> CoreResult<usize> {
        let hi = CdcEvent::key_for(before_seq);
        let entries = self.store.scan_range(
            ColumnFamily::Changefeed,
            std::ops::Bound::Included(b"changefeed:".to_vec()),
            std::ops::Bound::Excluded(hi),
            None,
            false,
        )?;
        let removed = entries.len();
        let mut batch = WriteBatch::new();
        for (key, _) in entries {
            batch.delete(ColumnFamily::Changefeed, key);
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CdcLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcLog")
            .field("latest", &self.latest_sequence())
            .finish_non_exhaustive()
    }
}

fn parse_sequence(key: &[u8]) -> CoreResult<u64> {
    let text = std::str::from_utf8(key)
        .map_err(|_| CoreError::invalid_operation("non-UTF-8 changefeed key"))?;
    text.strip_prefix("changefeed:")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoreError::invalid_operation("malformed changefeed key"))
}

/// A frame emitted by a stream session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Stream header carrying the client retry hint.
    Header {
        /// `retry:` value in milliseconds.
        retry_ms: u64,
    },
    /// One change event.
    Event(CdcEvent),
    /// Keepalive comment.
    Heartbeat,
}

impl StreamFrame {
    /// Renders the frame as SSE wire text.
    #[must_use]
    pub fn to_sse(&self) -> String {
        match self {
            StreamFrame::Header { retry_ms } => format!("retry: {retry_ms}\n\n"),
            StreamFrame::Event(event) => {
                let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
                format!("id: {}\ndata: {data}\n\n", event.sequence)
            }
            StreamFrame::Heartbeat => ": heartbeat\n\n".to_string(),
        }
    }
}

/// Handle observing and stopping a stream session.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    /// Events dropped by ring-buffer overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signals the session to stop after its current iteration.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A stream session over the log.
///
/// Runs as a cooperative task: polls the log from the resume cursor, files
/// events through a bounded ring buffer (drop-oldest on overflow, with an
/// observable counter), and emits frames into an async channel the
/// transport drains. Resume via `last_event_id` is exclusive: the first
/// emitted event has `sequence > last_event_id`.
pub struct CdcStream;

impl CdcStream {
    /// Spawns a session on the current tokio runtime.
    ///
    /// Returns the frame receiver and a control handle. The session ends
    /// when the receiver is dropped or the handle is closed.
    #[must_use]
    pub fn spawn(
        log: Arc<CdcLog>,
        last_event_id: u64,
        key_prefix: Option<String>,
        config: SseConfig,
    ) -> (mpsc::Receiver<StreamFrame>, StreamHandle) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let handle = StreamHandle {
            dropped: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let task_handle = handle.clone();
        tokio::spawn(Self::run(log, last_event_id, key_prefix, config, tx, task_handle));
        (rx, handle)
    }

    /// The session body; public for callers that manage their own tasks.
    pub async fn run(
        log: Arc<CdcLog>,
        last_event_id: u64,
        key_prefix: Option<String>,
        config: SseConfig,
        tx: mpsc::Sender<StreamFrame>,
        handle: StreamHandle,
    ) {
        if tx
            .send(StreamFrame::Header {
                retry_ms: config.retry_ms,
            })
            .await
            .is_err()
        {
            return;
        }

        let mut cursor = last_event_id;
        let mut ring: VecDeque<CdcEvent> = VecDeque::with_capacity(config.buffer_size);
        let mut last_heartbeat = Instant::now();
        let mut rate_window = Instant::now();
        let mut sent_in_window: u32 = 0;
        let poll_interval = Duration::from_millis(50);

        loop {
            if handle.closed.load(Ordering::Acquire) || tx.is_closed() {
                return;
            }

            // Pull new events into the ring, dropping oldest on overflow.
            match log.query(cursor, config.max_events_per_poll, key_prefix.as_deref(), None) {
                Ok(events) => {
                    for event in events {
                        cursor = cursor.max(event.sequence);
                        if ring.len() >= config.buffer_size {
                            ring.pop_front();
                            handle.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        ring.push_back(event);
                    }
                }
                Err(err) => {
                    debug!(error = %err, "stream poll failed, retrying");
                }
            }

            // Drain the ring, honoring the rate cap.
            while let Some(event) = ring.front() {
                if config.max_events_per_second > 0 {
                    if rate_window.elapsed() >= Duration::from_secs(1) {
                        rate_window = Instant::now();
                        sent_in_window = 0;
                    }
                    if sent_in_window >= config.max_events_per_second {
                        break;
                    }
                }
                match tx.try_send(StreamFrame::Event(event.clone())) {
                    Ok(()) => {
                        ring.pop_front();
                        sent_in_window += 1;
                        last_heartbeat = Instant::now();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }

            if last_heartbeat.elapsed() >= Duration::from_millis(config.heartbeat_ms) {
                if tx.send(StreamFrame::Heartbeat).await.is_err() {
                    return;
                }
                last_heartbeat = Instant::now();
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<KvStore>, Arc<CdcLog>) {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let log = Arc::new(CdcLog::open(Arc::clone(&store)).unwrap());
        (store, log)
    }

    fn append(store: &KvStore, log: &CdcLog, sequence: u64, key: &str) {
        let event = CdcEvent {
            sequence,
            event_type: CdcEventType::Put,
            key: key.to_string(),
            value: Some(serde_json::json!({"n": sequence})),
            timestamp_ms: 1_700_000_000_000 + sequence,
            metadata: BTreeMap::new(),
        };
        let mut batch = WriteBatch::new();
        log.append_op(&event, &mut batch).unwrap();
        store.write_batch(batch).unwrap();
        log.notify_appended(sequence);
    }

    #[test]
    fn query_from_cursor_is_exclusive() {
        let (store, log) = setup();
        for seq in 1..=10 {
            append(&store, &log, seq, &format!("users:u{seq}"));
        }

        let events = log.query(5, 100, None, None).unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![6, 7, 8, 9, 10]);

        let events = log.query(0, 3, None, None).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn prefix_filter() {
        let (store, log) = setup();
        append(&store, &log, 1, "users:a");
        append(&store, &log, 2, "orders:1");
        append(&store, &log, 3, "users:b");

        let events = log.query(0, 100, Some("users:"), None).unwrap();
        let keys: Vec<&str> = events.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["users:a", "users:b"]);
    }

    #[test]
    fn latest_sequence_recovers_on_open() {
        let (store, log) = setup();
        append(&store, &log, 1, "users:a");
        append(&store, &log, 2, "users:b");
        drop(log);

        let log = CdcLog::open(store).unwrap();
        assert_eq!(log.latest_sequence(), 2);
    }

    #[test]
    fn long_poll_wakes_on_append() {
        let (store, log) = setup();
        let log2 = Arc::clone(&log);
        let store2 = Arc::clone(&store);

        let waiter = std::thread::spawn(move || {
            log2.query(0, 10, None, Some(Duration::from_secs(5))).unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        append(&store2, &log, 1, "users:a");

        let events = waiter.join().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn long_poll_times_out_empty() {
        let (_, log) = setup();
        let start = Instant::now();
        let events = log
            .query(0, 10, None, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn retention_drops_old_events() {
        let (store, log) = setup();
        for seq in 1..=10 {
            append(&store, &log, seq, "users:a");
        }
        let removed = log.retention(6).unwrap();
        assert_eq!(removed, 5);

        let events = log.query(0, 100, None, None).unwrap();
        assert_eq!(events.first().unwrap().sequence, 6);
    }

    #[test]
    fn sse_rendering() {
        let event = CdcEvent {
            sequence: 7,
            event_type: CdcEventType::Delete,
            key: "users:gone".to_string(),
            value: None,
            timestamp_ms: 1,
            metadata: BTreeMap::new(),
        };
        let sse = StreamFrame::Event(event).to_sse();
        assert!(sse.starts_with("id: 7\ndata: "));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains("\"DELETE\""));

        assert_eq!(
            StreamFrame::Header { retry_ms: 3000 }.to_sse(),
            "retry: 3000\n\n"
        );
        assert_eq!(StreamFrame::Heartbeat.to_sse(), ": heartbeat\n\n");
    }

    #[tokio::test]
    async fn stream_resumes_exclusively() {
        let (store, log) = setup();
        for seq in 1..=10 {
            append(&store, &log, seq, &format!("users:u{seq}"));
        }

        let config = SseConfig {
            heartbeat_ms: 10_000,
            ..SseConfig::default()
        };
        let (mut rx, handle) = CdcStream::spawn(Arc::clone(&log), 5, None, config);

        // First frame is the header with the retry hint.
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, StreamFrame::Header { retry_ms: 3000 }));

        let mut sequences = Vec::new();
        while sequences.len() < 5 {
            match rx.recv().await.unwrap() {
                StreamFrame::Event(event) => sequences.push(event.sequence),
                StreamFrame::Heartbeat | StreamFrame::Header { .. } => {}
            }
        }
        assert_eq!(sequences, vec![6, 7, 8, 9, 10]);
        assert_eq!(handle.dropped(), 0);
        handle.close();
    }

    #[tokio::test]
    async fn stream_heartbeats_when_idle() {
        let (_, log) = setup();
        let config = SseConfig {
            heartbeat_ms: 30,
            ..SseConfig::default()
        };
        let (mut rx, handle) = CdcStream::spawn(log, 0, None, config);

        let _header = rx.recv().await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, StreamFrame::Heartbeat);
        handle.close();
    }

    #[tokio::test]
    async fn stream_filters_by_prefix() {
        let (store, log) = setup();
        append(&store, &log, 1, "orders:1");
        append(&store, &log, 2, "users:a");

        let config = SseConfig {
            heartbeat_ms: 10_000,
            ..SseConfig::default()
        };
        let (mut rx, handle) =
            CdcStream::spawn(log, 0, Some("users:".to_string()), config);

        let _header = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            StreamFrame::Event(event) => assert_eq!(event.key, "users:a"),
            other => panic!("expected event, got {other:?}"),
        }
        handle.close();
    }
}
