//! Safety and recovery
//!
//! Per-resource mutual exclusion and startup recovery of stale locks.

pub mod lock_manager;
pub mod reaper;

pub use lock_manager::{InstanceGuard, LockGuard, LockManager, LockStats};
pub use reaper::StaleLockReaper;
