//! Cheap in-process counters describing engine health.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters incremented from the engine loop; reads are lock-free so a
/// status surface can poll without touching pipeline state.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks_consumed: AtomicU64,
    pub ticks_duplicate: AtomicU64,
    pub ticks_out_of_order: AtomicU64,
    pub layer1_runs: AtomicU64,
    pub layer1_skipped: AtomicU64,
    pub layer1_closes: AtomicU64,
    pub entries_executed: AtomicU64,
    pub entries_rejected: AtomicU64,
    pub escalations: AtomicU64,
    pub advisory_timeouts: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub sink_overflows: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub ticks_consumed: u64,
    pub ticks_duplicate: u64,
    pub ticks_out_of_order: u64,
    pub layer1_runs: u64,
    pub layer1_skipped: u64,
    pub layer1_closes: u64,
    pub entries_executed: u64,
    pub entries_rejected: u64,
    pub escalations: u64,
    pub advisory_timeouts: u64,
    pub jobs_failed: u64,
    pub sink_overflows: u64,
}

impl EngineMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_consumed: self.ticks_consumed.load(Ordering::Relaxed),
            ticks_duplicate: self.ticks_duplicate.load(Ordering::Relaxed),
            ticks_out_of_order: self.ticks_out_of_order.load(Ordering::Relaxed),
            layer1_runs: self.layer1_runs.load(Ordering::Relaxed),
            layer1_skipped: self.layer1_skipped.load(Ordering::Relaxed),
            layer1_closes: self.layer1_closes.load(Ordering::Relaxed),
            entries_executed: self.entries_executed.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            advisory_timeouts: self.advisory_timeouts.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            sink_overflows: self.sink_overflows.load(Ordering::Relaxed),
        }
    }
}
