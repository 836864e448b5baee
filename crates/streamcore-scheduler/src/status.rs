//! Lock-free pipeline metrics, grounded on the workspace's own
//! atomics-based `PipelineStatus` (audio bus crate): a struct of plain
//! atomics updated from the hot path without a mutex, plus a plain
//! serializable snapshot for the host application and test assertions.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Real-time pipeline counters with atomic fields for lock-free updates.
///
/// Shared via `Arc<PipelineStatus>`; every setter/incrementer is called only
/// from the pipeline task, but readers (a UI polling loop, a test) may be on
/// any thread.
#[derive(Debug)]
pub struct PipelineStatus {
    ticks_processed: AtomicU64,
    decodes_dispatched: AtomicU64,
    decodes_completed: AtomicU64,
    decodes_failed: AtomicU64,
    silent_ticks: AtomicU64,
    dropped_ticks: AtomicU64,
    last_decode_duration_ms: AtomicU64,
    last_commit_cursor_abs_ms: AtomicI64,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            decodes_dispatched: AtomicU64::new(0),
            decodes_completed: AtomicU64::new(0),
            decodes_failed: AtomicU64::new(0),
            silent_ticks: AtomicU64::new(0),
            dropped_ticks: AtomicU64::new(0),
            last_decode_duration_ms: AtomicU64::new(0),
            last_commit_cursor_abs_ms: AtomicI64::new(0),
        }
    }
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Getters ---

    pub fn ticks_processed(&self) -> u64 {
        self.ticks_processed.load(Ordering::Relaxed)
    }

    pub fn decodes_dispatched(&self) -> u64 {
        self.decodes_dispatched.load(Ordering::Relaxed)
    }

    pub fn decodes_completed(&self) -> u64 {
        self.decodes_completed.load(Ordering::Relaxed)
    }

    pub fn decodes_failed(&self) -> u64 {
        self.decodes_failed.load(Ordering::Relaxed)
    }

    pub fn silent_ticks(&self) -> u64 {
        self.silent_ticks.load(Ordering::Relaxed)
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    pub fn last_decode_duration_ms(&self) -> u64 {
        self.last_decode_duration_ms.load(Ordering::Relaxed)
    }

    pub fn last_commit_cursor_abs_ms(&self) -> i64 {
        self.last_commit_cursor_abs_ms.load(Ordering::Relaxed)
    }

    // --- Mutators, called only from the pipeline task ---

    pub fn increment_ticks_processed(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decodes_dispatched(&self) {
        self.decodes_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decodes_completed(&self) {
        self.decodes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decodes_failed(&self) {
        self.decodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_silent_ticks(&self) {
        self.silent_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped_ticks(&self) {
        self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_decode_duration_ms(&self, value: u64) {
        self.last_decode_duration_ms.store(value, Ordering::Relaxed);
    }

    pub fn set_last_commit_cursor_abs_ms(&self, value: i64) {
        self.last_commit_cursor_abs_ms.store(value, Ordering::Relaxed);
    }

    /// Resets all counters to zero; called at the start of each session so
    /// metrics never leak across restarts of the same scheduler instance.
    pub fn reset(&self) {
        self.ticks_processed.store(0, Ordering::Relaxed);
        self.decodes_dispatched.store(0, Ordering::Relaxed);
        self.decodes_completed.store(0, Ordering::Relaxed);
        self.decodes_failed.store(0, Ordering::Relaxed);
        self.silent_ticks.store(0, Ordering::Relaxed);
        self.dropped_ticks.store(0, Ordering::Relaxed);
        self.last_decode_duration_ms.store(0, Ordering::Relaxed);
        self.last_commit_cursor_abs_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatusSnapshot {
        PipelineStatusSnapshot {
            ticks_processed: self.ticks_processed(),
            decodes_dispatched: self.decodes_dispatched(),
            decodes_completed: self.decodes_completed(),
            decodes_failed: self.decodes_failed(),
            silent_ticks: self.silent_ticks(),
            dropped_ticks: self.dropped_ticks(),
            last_decode_duration_ms: self.last_decode_duration_ms(),
            last_commit_cursor_abs_ms: self.last_commit_cursor_abs_ms(),
        }
    }
}

/// Plain serializable snapshot of [`PipelineStatus`] for a host application
/// or an IPC boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PipelineStatusSnapshot {
    pub ticks_processed: u64,
    pub decodes_dispatched: u64,
    pub decodes_completed: u64,
    pub decodes_failed: u64,
    pub silent_ticks: u64,
    pub dropped_ticks: u64,
    pub last_decode_duration_ms: u64,
    pub last_commit_cursor_abs_ms: i64,
}
