//! The lock manager's view of a transaction: just enough surface to check
//! abort/timeout state and to request an abort. Everything else about a
//! transaction's lifecycle belongs to the caller, not this crate.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::common::JobId;

/// Hooks the lock manager needs from whatever owns a job's lifecycle. A
/// real transaction manager implements this over its own transaction
/// table; [`SimpleTxnContext`] is a minimal standalone implementation
/// usable in tests or single-job callers.
pub trait TxnContext: Send + Sync {
    /// Stable identifier correlating this context with its job's arena
    /// slot and wait-queue entries.
    fn job_id(&self) -> JobId;

    /// True once the job has been aborted, by itself or by the lock
    /// manager's deadlock detector. A lock manager operation observing
    /// this mid-wait unwinds immediately.
    fn is_aborted(&self) -> bool;

    /// True once the job's deadline has passed. `lock` treats this the
    /// same as an externally requested abort.
    fn is_timeout(&self) -> bool;

    /// Marks the job timed out. Called by [`crate::LockManager`] when a
    /// bounded wait elapses without the deadline already being set.
    fn set_timeout(&self, timed_out: bool);

    /// Marks the job aborted, e.g. because it was chosen as a deadlock
    /// victim. `reason` is informational only.
    fn request_abort(&self, reason: &str);
}

/// Minimal [`TxnContext`] backed by two atomics. Sufficient for tests and
/// for callers that track transaction state themselves and only need a
/// plain handle to hand to the lock manager.
#[derive(Debug)]
pub struct SimpleTxnContext {
    job_id: JobId,
    aborted: AtomicBool,
    timed_out: AtomicBool,
}

impl SimpleTxnContext {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            aborted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }
}

impl TxnContext for SimpleTxnContext {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn is_timeout(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    fn set_timeout(&self, timed_out: bool) {
        self.timed_out.store(timed_out, Ordering::Release);
    }

    fn request_abort(&self, reason: &str) {
        warn!(job_id = self.job_id, reason, "job aborted");
        self.aborted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_neither_aborted_nor_timed_out() {
        let ctx = SimpleTxnContext::new(1);
        assert!(!ctx.is_aborted());
        assert!(!ctx.is_timeout());
    }

    #[test]
    fn request_abort_sets_the_flag() {
        let ctx = SimpleTxnContext::new(1);
        ctx.request_abort("deadlock victim");
        assert!(ctx.is_aborted());
    }

    #[test]
    fn set_timeout_is_independent_of_abort() {
        let ctx = SimpleTxnContext::new(1);
        ctx.set_timeout(true);
        assert!(ctx.is_timeout());
        assert!(!ctx.is_aborted());
    }
}
