//! Process-wide counters for Convene coordination.
//!
//! Increments are relaxed atomics. [`Metrics::flush`] emits the current values
//! as one `tracing::info!` event, e.g. when a session ends.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    turns_dispatched: AtomicU64,
    turns_failed: AtomicU64,
    tasks_dispatched: AtomicU64,
    waits_timed_out: AtomicU64,
    sessions_finished: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            turns_dispatched: AtomicU64::new(0),
            turns_failed: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            waits_timed_out: AtomicU64::new(0),
            sessions_finished: AtomicU64::new(0),
        }
    }

    pub fn inc_turns_dispatched(&self) {
        self.turns_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_turns_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_waits_timed_out(&self) {
        self.waits_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_finished(&self) {
        self.sessions_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turns_dispatched(&self) -> u64 {
        self.turns_dispatched.load(Ordering::Relaxed)
    }

    pub fn turns_failed(&self) -> u64 {
        self.turns_failed.load(Ordering::Relaxed)
    }

    pub fn tasks_dispatched(&self) -> u64 {
        self.tasks_dispatched.load(Ordering::Relaxed)
    }

    pub fn waits_timed_out(&self) -> u64 {
        self.waits_timed_out.load(Ordering::Relaxed)
    }

    pub fn sessions_finished(&self) -> u64 {
        self.sessions_finished.load(Ordering::Relaxed)
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            turns_dispatched = self.turns_dispatched(),
            turns_failed = self.turns_failed(),
            tasks_dispatched = self.tasks_dispatched(),
            waits_timed_out = self.waits_timed_out(),
            sessions_finished = self.sessions_finished(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.turns_dispatched.store(0, Ordering::Relaxed);
        self.turns_failed.store(0, Ordering::Relaxed);
        self.tasks_dispatched.store(0, Ordering::Relaxed);
        self.waits_timed_out.store(0, Ordering::Relaxed);
        self.sessions_finished.store(0, Ordering::Relaxed);
    }
}
