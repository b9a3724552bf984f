//! Run statistics and the performance report.
//!
//! Live counters are atomics updated from worker threads; a
//! [`PerformanceReport`] is a serializable snapshot of them taken on demand,
//! at every checkpoint, and at the end of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live per-stage counters.
#[derive(Debug, Default)]
pub struct StageStats {
    processed: AtomicU64,
    faults: AtomicU64,
    filtered: AtomicU64,
    skipped_disabled: AtomicU64,
    restarts: AtomicU64,
    busy_nanos: AtomicU64,
}

impl StageStats {
    pub fn record_call(&self, elapsed: Duration, faulted: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if faulted {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str, disabled: bool) -> StageReport {
        let processed = self.processed.load(Ordering::Relaxed);
        let busy_nanos = self.busy_nanos.load(Ordering::Relaxed);
        StageReport {
            name: name.to_string(),
            processed,
            faults: self.faults.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            skipped_disabled: self.skipped_disabled.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            total_time_us: busy_nanos / 1_000,
            avg_time_us: if processed == 0 {
                0.0
            } else {
                busy_nanos as f64 / processed as f64 / 1_000.0
            },
            disabled,
        }
    }
}

/// Live run-level counters.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub discarded: AtomicU64,
    pub faults: AtomicU64,
}

impl RunCounters {
    pub fn add_discarded(&self, count: u64) {
        if count > 0 {
            self.discarded.fetch_add(count, Ordering::Relaxed);
        }
    }
}

/// Snapshot of one stage's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    /// Stage calls made, faulted or not
    pub processed: u64,
    pub faults: u64,
    /// Entities the selection filter routed around this stage
    pub filtered: u64,
    /// Entities that skipped this stage because it was disabled
    pub skipped_disabled: u64,
    pub restarts: u64,
    pub total_time_us: u64,
    pub avg_time_us: f64,
    pub disabled: bool,
}

/// Snapshot of a run's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub entities_dispatched: u64,
    pub entities_completed: u64,
    pub entities_discarded: u64,
    pub faults: u64,
    pub elapsed_ms: u64,
    pub stages: Vec<StageReport>,
}

impl PerformanceReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Completed entities per second over the elapsed time
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ms == 0 {
            0.0
        } else {
            self.entities_completed as f64 * 1000.0 / self.elapsed_ms as f64
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Final record of a run, available after its terminal callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Why the run aborted, when it did
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: PerformanceReport,
}
