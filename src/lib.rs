//! A hierarchical, two-mode-granularity lock manager for transactional
//! workloads: intention locks (`IS`/`IX`) guard datasets, plain `S`/`X`
//! locks guard individual entities, and an online detector aborts the
//! requesting job rather than let a wait cycle form.
//!
//! The public surface is small and centers on [`LockManager`]:
//!
//! ```no_run
//! use rusty_lock_manager::{LockManager, LockMode, SimpleTxnContext};
//!
//! let manager = LockManager::new();
//! let ctx = SimpleTxnContext::new(1);
//! manager.lock(&ctx, 7, 42, LockMode::X, None).unwrap();
//! manager.unlock(&ctx, 7, 42).unwrap();
//! manager.release_locks(&ctx).unwrap();
//! ```

pub mod arena;
pub mod common;
pub mod config;
pub mod dataset_cache;
pub mod deadlock;
pub mod error;
pub mod lock_manager;
pub mod matrix;
pub mod resource_table;
pub mod stats;
pub mod txn;

pub use common::{JobId, SlotId};
pub use config::LockManagerConfig;
pub use error::{LockError, LockResult};
pub use lock_manager::{LockManager, DATASET_ENTITY};
pub use matrix::{Action, LockMode};
pub use stats::{LockManagerStats, LockManagerStatsSnapshot};
pub use txn::{SimpleTxnContext, TxnContext};
