//! Metrics reporting seam.
//!
//! The store reports counters and levels per insert, delete and recount.
//! A sink that fails (panics) never fails the operation that reported to it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;

pub const ENTRIES_INSERTED: &str = "entries_inserted";
pub const BYTES_INSERTED: &str = "bytes_inserted";
pub const INSERT_FAILURES: &str = "insert_failures";
pub const BUCKETS_CREATED: &str = "buckets_created";
pub const BUCKETS_DELETED: &str = "buckets_deleted";
pub const ENTRIES_DELETED: &str = "entries_deleted";
pub const BUCKET_RECOUNTS: &str = "bucket_recounts";
pub const STORES_CLOSED: &str = "bucket_stores_closed";
pub const LIVE_ENTRIES: &str = "live_entries";
pub const LIVE_BYTES: &str = "live_bytes";
pub const LIVE_BUCKETS: &str = "live_buckets";

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, by: u64);
    fn level(&self, name: &'static str, value: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _by: u64) {}
    fn level(&self, _name: &'static str, _value: u64) {}
}

/// Keeps the latest counters and levels in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    levels: Mutex<HashMap<&'static str, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn level_of(&self, name: &str) -> Option<u64> {
        self.levels.lock().get(name).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, by: u64) {
        *self.counters.lock().entry(name).or_insert(0) += by;
    }

    fn level(&self, name: &'static str, value: u64) {
        self.levels.lock().insert(name, value);
    }
}

/// Runs `f` against the sink, swallowing any panic it raises.
pub(crate) fn report(sink: &dyn MetricsSink, f: impl FnOnce(&dyn MetricsSink)) {
    if catch_unwind(AssertUnwindSafe(|| f(sink))).is_err() {
        log::warn!("metrics sink panicked; report dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn increment(&self, _name: &'static str, _by: u64) {
            panic!("sink down");
        }
        fn level(&self, _name: &'static str, _value: u64) {
            panic!("sink down");
        }
    }

    #[test]
    fn in_memory_metrics_accumulate() {
        let metrics = InMemoryMetrics::new();
        report(&metrics, |m| m.increment(ENTRIES_INSERTED, 2));
        report(&metrics, |m| m.increment(ENTRIES_INSERTED, 3));
        report(&metrics, |m| m.level(LIVE_BUCKETS, 4));
        assert_eq!(metrics.counter(ENTRIES_INSERTED), 5);
        assert_eq!(metrics.level_of(LIVE_BUCKETS), Some(4));
        assert_eq!(metrics.counter(BUCKETS_DELETED), 0);
    }

    #[test]
    fn panicking_sink_is_contained() {
        report(&PanickingSink, |m| m.increment(ENTRIES_INSERTED, 1));
    }
}
