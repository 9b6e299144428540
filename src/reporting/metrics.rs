//! Counters and timings for property reads and mutation retries.
//!
//! Sinks are passed in by the caller; nothing in the crate records into
//! process-wide state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counter names recorded by the crate.
pub mod names {
    pub const PROPERTY_READ: &str = "reader.property_read";
    pub const READER_DURATION: &str = "reader.duration";
    pub const GROUP_READ: &str = "reader.group_read";
    pub const SEQUENCE_RETRY: &str = "mutation.sequence_retry";
    pub const DOCUMENTS_INSERTED: &str = "mutation.inserted";
    pub const DOCUMENTS_UPDATED: &str = "mutation.updated";
    pub const DOCUMENTS_DELETED: &str = "mutation.deleted";
    pub const WRITE_ERRORS: &str = "mutation.write_errors";
}

/// Destination for crate metrics.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &str, by: u64);

    fn observe(&self, histogram: &str, value: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: &str, _by: u64) {}

    fn observe(&self, _histogram: &str, _value: Duration) {}
}

/// Keeps counters and observations in memory so callers can inspect them.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    observations: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn observation_count(&self, name: &str) -> usize {
        self.observations
            .lock()
            .map(|observations| observations.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: &str, by: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(counter.to_string()).or_insert(0) += by;
        }
    }

    fn observe(&self, histogram: &str, value: Duration) {
        if let Ok(mut observations) = self.observations.lock() {
            observations
                .entry(histogram.to_string())
                .or_default()
                .push(value);
        }
    }
}
