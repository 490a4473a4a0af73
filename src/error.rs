//! Structured error types for the lock manager, following the same
//! `thiserror`-derived, constructor-plus-predicate shape used throughout
//! the transaction subsystem this crate grew out of.

use thiserror::Error;

use crate::common::JobId;
use crate::matrix::LockMode;

/// Result type alias for lock manager operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// The four error families the lock manager can surface. Every failure path
/// in `LockManager` returns one of these; the manager itself never retries.
#[derive(Debug, Error)]
pub enum LockError {
    /// The caller's job was already aborted at call entry.
    #[error("job {job_id} is already aborted")]
    TxnAborted { job_id: JobId },

    /// The manager decided the caller must abort: either its deadline
    /// passed while it held no latch, or it was chosen as a deadlock
    /// victim.
    #[error(
        "job {job_id} timed out waiting for {mode:?} lock on dataset {dataset_id} entity {entity_hash}"
    )]
    TxnTimedOut {
        job_id: JobId,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
    },

    /// An impossible state was observed: unlocking a resource that isn't
    /// locked, finding an incompatible pair of holders during max-mode
    /// recompute, or a request missing from an expected queue. Not
    /// recoverable; indicates a caller or manager bug.
    #[error("lock manager invariant violated: {0}")]
    InvariantViolation(String),

    /// The underlying wait primitive was interrupted.
    #[error("wait interrupted for job {job_id}: {reason}")]
    Interrupted { job_id: JobId, reason: String },
}

impl LockError {
    pub fn txn_aborted(job_id: JobId) -> Self {
        LockError::TxnAborted { job_id }
    }

    pub fn txn_timed_out(job_id: JobId, dataset_id: i32, entity_hash: i32, mode: LockMode) -> Self {
        LockError::TxnTimedOut {
            job_id,
            dataset_id,
            entity_hash,
            mode,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        LockError::InvariantViolation(msg.into())
    }

    pub fn interrupted(job_id: JobId, reason: impl Into<String>) -> Self {
        LockError::Interrupted {
            job_id,
            reason: reason.into(),
        }
    }

    /// True for the two failure modes a caller might retry after backing
    /// off (timeout/deadlock); `InvariantViolation` and `Interrupted` are
    /// not retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LockError::TxnTimedOut { .. })
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, LockError::InvariantViolation(_))
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            LockError::TxnAborted { job_id } => Some(*job_id),
            LockError::TxnTimedOut { job_id, .. } => Some(*job_id),
            LockError::Interrupted { job_id, .. } => Some(*job_id),
            LockError::InvariantViolation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_is_retriable() {
        let err = LockError::txn_timed_out(1, 7, -1, LockMode::X);
        assert!(err.is_retriable());
        assert_eq!(err.job_id(), Some(1));
    }

    #[test]
    fn invariant_violation_is_not_retriable() {
        let err = LockError::invariant("unlock of unknown resource");
        assert!(!err.is_retriable());
        assert!(err.is_invariant_violation());
        assert_eq!(err.job_id(), None);
    }

    #[test]
    fn display_messages_are_descriptive() {
        let err = LockError::txn_aborted(42);
        assert_eq!(err.to_string(), "job 42 is already aborted");
    }
}
