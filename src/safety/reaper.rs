/// Startup sweep of lock markers left by an uncleanly terminated coordinator
use crate::config::types::{LockResult, ReapPolicy};
use crate::safety::lock_manager::LockManager;
use log::info;

pub struct StaleLockReaper<'a> {
    locks: &'a LockManager,
    policy: ReapPolicy,
}

impl<'a> StaleLockReaper<'a> {
    pub fn new(locks: &'a LockManager, policy: ReapPolicy) -> Self {
        Self { locks, policy }
    }

    /// Run once before accepting requests. Returns the number of markers removed.
    pub fn sweep(&self) -> LockResult<usize> {
        let removed = match self.policy {
            ReapPolicy::Unconditional => self.locks.sweep_stale()?,
            ReapPolicy::Expired => self.locks.sweep_expired()?,
        };
        info!(
            "Stale lock sweep ({:?}) removed {} marker(s) from {}",
            self.policy,
            removed,
            self.locks.lock_dir().display()
        );
        Ok(removed)
    }
}
