//! Lock manager counters: cheap atomic increments on the hot path, with a
//! consistent point-in-time snapshot for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counters, safe to read concurrently with any
/// lock manager operation. Snapshot via [`LockManagerStats::snapshot`].
#[derive(Debug, Default)]
pub struct LockManagerStats {
    locks_granted: AtomicU64,
    waits_entered: AtomicU64,
    conversions: AtomicU64,
    deadlocks_detected: AtomicU64,
    aborts: AtomicU64,
    resources_reclaimed: AtomicU64,
}

/// A point-in-time copy of [`LockManagerStats`], cheap to clone and print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockManagerStatsSnapshot {
    pub locks_granted: u64,
    pub waits_entered: u64,
    pub conversions: u64,
    pub deadlocks_detected: u64,
    pub aborts: u64,
    pub resources_reclaimed: u64,
}

impl LockManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_grant(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self) {
        self.waits_entered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conversion(&self) {
        self.conversions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock(&self) {
        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaim(&self) {
        self.resources_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockManagerStatsSnapshot {
        LockManagerStatsSnapshot {
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            waits_entered: self.waits_entered.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            resources_reclaimed: self.resources_reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = LockManagerStats::new();
        assert_eq!(stats.snapshot(), LockManagerStatsSnapshot::default());
    }

    #[test]
    fn recording_increments_the_right_counter() {
        let stats = LockManagerStats::new();
        stats.record_grant();
        stats.record_grant();
        stats.record_deadlock();
        let snap = stats.snapshot();
        assert_eq!(snap.locks_granted, 2);
        assert_eq!(snap.deadlocks_detected, 1);
        assert_eq!(snap.waits_entered, 0);
    }
}
