//! Global atomic counters for engine observability.
//!
//! Counters are bumped silently at the call site. [`Metrics::flush`] emits
//! the current values as one `tracing::info!` event, typically when a run
//! finishes or halts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide metrics.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    fixes_attempted: AtomicU64,
    fixes_succeeded: AtomicU64,
    fixes_failed: AtomicU64,
    lock_conflicts: AtomicU64,
    rollbacks_applied: AtomicU64,
    bus_redeliveries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            fixes_attempted: AtomicU64::new(0),
            fixes_succeeded: AtomicU64::new(0),
            fixes_failed: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
            rollbacks_applied: AtomicU64::new(0),
            bus_redeliveries: AtomicU64::new(0),
        }
    }

    pub fn inc_fixes_attempted(&self) {
        self.fixes_attempted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fixes_attempted", "counter incremented");
    }

    pub fn inc_fixes_succeeded(&self) {
        self.fixes_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fixes_succeeded", "counter incremented");
    }

    pub fn inc_fixes_failed(&self) {
        self.fixes_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fixes_failed", "counter incremented");
    }

    pub fn inc_lock_conflicts(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "lock_conflicts", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks_applied", "counter incremented");
    }

    pub fn inc_bus_redeliveries(&self) {
        self.bus_redeliveries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "bus_redeliveries", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            fixes_attempted = self.fixes_attempted(),
            fixes_succeeded = self.fixes_succeeded(),
            fixes_failed = self.fixes_failed(),
            lock_conflicts = self.lock_conflicts(),
            rollbacks_applied = self.rollbacks_applied(),
            bus_redeliveries = self.bus_redeliveries(),
        );
    }

    pub fn fixes_attempted(&self) -> u64 {
        self.fixes_attempted.load(Ordering::Relaxed)
    }

    pub fn fixes_succeeded(&self) -> u64 {
        self.fixes_succeeded.load(Ordering::Relaxed)
    }

    pub fn fixes_failed(&self) -> u64 {
        self.fixes_failed.load(Ordering::Relaxed)
    }

    pub fn lock_conflicts(&self) -> u64 {
        self.lock_conflicts.load(Ordering::Relaxed)
    }

    pub fn rollbacks_applied(&self) -> u64 {
        self.rollbacks_applied.load(Ordering::Relaxed)
    }

    pub fn bus_redeliveries(&self) -> u64 {
        self.bus_redeliveries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.fixes_attempted.store(0, Ordering::Relaxed);
        self.fixes_succeeded.store(0, Ordering::Relaxed);
        self.fixes_failed.store(0, Ordering::Relaxed);
        self.lock_conflicts.store(0, Ordering::Relaxed);
        self.rollbacks_applied.store(0, Ordering::Relaxed);
        self.bus_redeliveries.store(0, Ordering::Relaxed);
    }
}
