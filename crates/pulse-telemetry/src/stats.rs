use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Lifetime pipeline counters. Cheap to bump from any thread; read as an
/// atomic-ish snapshot for host app debug screens.
pub struct PipelineStats {
    tracked: Counter,
    suppressed: Counter,
    deduplicated: Counter,
    delivered: Counter,
    requeued: Counter,
    dropped: Counter,
    flush_attempts: Counter,
    flush_failures: Counter,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            tracked: Counter::new(),
            suppressed: Counter::new(),
            deduplicated: Counter::new(),
            delivered: Counter::new(),
            requeued: Counter::new(),
            dropped: Counter::new(),
            flush_attempts: Counter::new(),
            flush_failures: Counter::new(),
        }
    }

    pub fn record_tracked(&self) {
        self.tracked.increment(1);
    }

    pub fn record_suppressed(&self) {
        self.suppressed.increment(1);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.increment(1);
    }

    pub fn record_delivered(&self, n: u64) {
        self.delivered.increment(n);
    }

    pub fn record_requeued(&self, n: u64) {
        self.requeued.increment(n);
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.increment(n);
    }

    pub fn record_flush_attempt(&self) {
        self.flush_attempts.increment(1);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tracked: self.tracked.get(),
            suppressed: self.suppressed.get(),
            deduplicated: self.deduplicated.get(),
            delivered: self.delivered.get(),
            requeued: self.requeued.get(),
            dropped: self.dropped.get(),
            flush_attempts: self.flush_attempts.get(),
            flush_failures: self.flush_failures.get(),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Events accepted by a tracking call.
    pub tracked: u64,
    /// Events discarded by server-pushed filters.
    pub suppressed: u64,
    /// Repeat error events collapsed into a pending count.
    pub deduplicated: u64,
    /// Events acknowledged by the ingest endpoint.
    pub delivered: u64,
    /// Events written back after a failed delivery.
    pub requeued: u64,
    /// Events intentionally discarded (session timeout, eviction).
    pub dropped: u64,
    pub flush_attempts: u64,
    pub flush_failures: u64,
}
