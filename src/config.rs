//! Lock manager configuration, in the `Config` + `Default` shape used
//! throughout the transaction subsystem's submodules.

use std::time::Duration;

/// Tunables for [`crate::LockManager`].
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// How long a freed arena chunk must sit empty before
    /// `SlotArena::maybe_shrink` gives it back to the allocator.
    pub shrink_timer: Duration,
    /// Number of buckets in the resource group table. Fixed after
    /// `LockManager::start`; never resized.
    pub group_table_size: usize,
    /// Whether `lock` runs the online deadlock check before blocking.
    /// `try_lock` never runs it regardless of this setting, since a
    /// non-blocking call has nothing to deadlock against.
    pub enable_deadlock_detection: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            shrink_timer: Duration::from_secs(60),
            group_table_size: 1024,
            enable_deadlock_detection: true,
        }
    }
}
