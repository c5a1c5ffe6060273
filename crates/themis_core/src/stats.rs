//! Database statistics and telemetry.
//!
//! Metrics counters for monitoring database behavior. All counters are
//! atomic and can be read while operations are in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Database metrics registry.
///
/// Counters are monotonically increasing; snapshot them with
/// [`DatabaseStats::snapshot`].
#[derive(Debug, Default)]
pub struct DatabaseStats {
    /// Total entity reads.
    reads: AtomicU64,
    /// Total entity writes (puts and merges).
    writes: AtomicU64,
    /// Total entity deletes.
    deletes: AtomicU64,
    /// Total AQL queries executed.
    queries: AtomicU64,
    /// Total index lookups served.
    index_lookups: AtomicU64,
    /// Total full-table scans (no usable index).
    table_scans: AtomicU64,
    /// Total vector searches.
    vector_searches: AtomicU64,
    /// Total spatial searches.
    spatial_searches: AtomicU64,
    /// Total CDC events appended.
    cdc_events: AtomicU64,
    /// Total field decrypt failures tolerated on reads.
    decrypt_failures: AtomicU64,
    /// Total entities removed by TTL cleanup.
    ttl_removed: AtomicU64,
    /// Total errors surfaced to callers.
    errors: AtomicU64,
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total entity reads.
    pub reads: u64,
    /// Total entity writes.
    pub writes: u64,
    /// Total entity deletes.
    pub deletes: u64,
    /// Total AQL queries executed.
    pub queries: u64,
    /// Total index lookups served.
    pub index_lookups: u64,
    /// Total full-table scans.
    pub table_scans: u64,
    /// Total vector searches.
    pub vector_searches: u64,
    /// Total spatial searches.
    pub spatial_searches: u64,
    /// Total CDC events appended.
    pub cdc_events: u64,
    /// Total tolerated decrypt failures.
    pub decrypt_failures: u64,
    /// Total entities removed by TTL cleanup.
    pub ttl_removed: u64,
    /// Total errors surfaced to callers.
    pub errors: u64,
}

impl DatabaseStats {
    /// Creates a zeroed registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_index_lookup(&self) {
        self.index_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_table_scan(&self) {
        self.table_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_vector_search(&self) {
        self.vector_searches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spatial_search(&self) {
        self.spatial_searches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cdc_event(&self) {
        self.cdc_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ttl_removed(&self, count: u64) {
        self.ttl_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            index_lookups: self.index_lookups.load(Ordering::Relaxed),
            table_scans: self.table_scans.load(Ordering::Relaxed),
            vector_searches: self.vector_searches.load(Ordering::Relaxed),
            spatial_searches: self.spatial_searches.load(Ordering::Relaxed),
            cdc_events: self.cdc_events.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            ttl_removed: self.ttl_removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
