//! Thread-local cache of dataset-level intention locks a job already holds,
//! so a hot loop locking many entities in the same dataset doesn't pay for
//! a redundant `IS`/`IX` acquisition on every call. Mirrors the
//! thread-local statement cache pattern used elsewhere in the transaction
//! subsystem this crate grew out of.

use std::cell::RefCell;

use crate::common::JobId;
use crate::matrix::LockMode;

#[derive(Default)]
struct CacheEntry {
    job_id: JobId,
    datasets: Vec<(i32, LockMode)>,
}

thread_local! {
    static CACHE: RefCell<CacheEntry> = RefCell::new(CacheEntry::default());
}

/// Per-thread cache of dataset intention locks already known to be held by
/// the job currently running on this thread.
pub struct DatasetLockCache;

impl DatasetLockCache {
    /// Returns true only if this thread's cache was populated by `job_id`
    /// and its cached mode for `dataset_id` equals `wanted` exactly. An
    /// `IX` entry does not satisfy a later `IS` request; a cache miss (or a
    /// mismatched job id) always falls through to a real acquisition.
    pub fn contains(job_id: JobId, dataset_id: i32, wanted: LockMode) -> bool {
        CACHE.with(|cell| {
            let entry = cell.borrow();
            if entry.job_id != job_id {
                return false;
            }
            entry
                .datasets
                .iter()
                .any(|(d, held)| *d == dataset_id && *held == wanted)
        })
    }

    /// Records that `job_id` now holds `mode` intention lock on
    /// `dataset_id`. Clears stale entries from a previous job if this
    /// thread has moved on to a different one.
    pub fn record(job_id: JobId, dataset_id: i32, mode: LockMode) {
        CACHE.with(|cell| {
            let mut entry = cell.borrow_mut();
            if entry.job_id != job_id {
                entry.job_id = job_id;
                entry.datasets.clear();
            }
            if let Some(slot) = entry.datasets.iter_mut().find(|(d, _)| *d == dataset_id) {
                if mode > slot.1 {
                    slot.1 = mode;
                }
            } else {
                entry.datasets.push((dataset_id, mode));
            }
        });
    }

    /// Drops all cached entries for `job_id`, e.g. after `release_locks`.
    pub fn clear(job_id: JobId) {
        CACHE.with(|cell| {
            let mut entry = cell.borrow_mut();
            if entry.job_id == job_id {
                entry.datasets.clear();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports_hits() {
        DatasetLockCache::clear(101);
        assert!(!DatasetLockCache::contains(101, 7, LockMode::IS));
        DatasetLockCache::record(101, 7, LockMode::IS);
        assert!(DatasetLockCache::contains(101, 7, LockMode::IS));
    }

    #[test]
    fn ix_does_not_cover_a_later_is_request() {
        DatasetLockCache::clear(202);
        DatasetLockCache::record(202, 3, LockMode::IX);
        assert!(!DatasetLockCache::contains(202, 3, LockMode::IS));
    }

    #[test]
    fn is_does_not_cover_an_ix_request() {
        DatasetLockCache::clear(303);
        DatasetLockCache::record(303, 3, LockMode::IS);
        assert!(!DatasetLockCache::contains(303, 3, LockMode::IX));
    }

    #[test]
    fn switching_jobs_on_a_thread_clears_the_cache() {
        DatasetLockCache::clear(404);
        DatasetLockCache::record(404, 1, LockMode::IS);
        assert!(!DatasetLockCache::contains(405, 1, LockMode::IS));
    }
}
