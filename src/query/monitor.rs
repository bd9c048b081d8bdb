//! Stage monitoring hooks.
//!
//! The interpreter reports stage boundaries and mapped statements through a
//! [`Monitor`]; the default implementation does nothing. The recording
//! variant collects counters and statement texts for tests and diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::query::algebra::Query;
use crate::query::fragment::Fragment;

/// Hooks invoked at interpreter stage boundaries. All methods default to
/// no-ops.
pub trait Monitor: Send + Sync {
    fn stage_started(&self) {}

    /// One query has been planned and fetched; `rows` is the fetched table
    /// length.
    fn query_mapped(&self, _query: &Query, _fragment: &Fragment, _rows: usize) {}

    fn stage_completed(&self) {}

    fn result_computed(&self, _result: &Result<serde_json::Value>) {}
}

/// Monitor that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {}

/// Snapshot of the counters collected by a [`RecordingMonitor`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub stages_started: u64,
    pub stages_completed: u64,
    pub queries_mapped: u64,
    pub results_computed: u64,
    /// SQL text of every mapped statement, in execution order.
    pub statements: Vec<String>,
}

/// Monitor recording counters and statement texts; usable concurrently.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    stages_started: AtomicU64,
    stages_completed: AtomicU64,
    queries_mapped: AtomicU64,
    results_computed: AtomicU64,
    statements: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        RecordingMonitor::default()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            stages_started: self.stages_started.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            queries_mapped: self.queries_mapped.load(Ordering::Relaxed),
            results_computed: self.results_computed.load(Ordering::Relaxed),
            statements: self
                .statements
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }
}

impl Monitor for RecordingMonitor {
    fn stage_started(&self) {
        self.stages_started.fetch_add(1, Ordering::Relaxed);
    }

    fn query_mapped(&self, _query: &Query, fragment: &Fragment, _rows: usize) {
        self.queries_mapped.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(fragment.sql().to_string());
        }
    }

    fn stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn result_computed(&self, _result: &Result<serde_json::Value>) {
        self.results_computed.fetch_add(1, Ordering::Relaxed);
    }
}
