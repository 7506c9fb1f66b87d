//! Deadlock handler: the single entry point the lock manager talks to.
//!
//! Detector mutation, conflict retrieval and victim wakeup run inside one
//! fair, reentrant section so concurrent lock requests observe a total order
//! of `add`/`remove` operations.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use polydb_common::prelude::*;
use std::fmt;

use crate::lockable::LockableId;
use crate::resolver::{resolver_for, DeadlockResolver};
use crate::transaction::{Transaction, TxnRef};
use crate::{detector_for, DeadlockDetector};

/// Deadlock handler statistics.
#[derive(Debug, Clone, Default)]
pub struct DeadlockStats {
    pub detection_runs: u64,
    pub deadlocks_resolved: u64,
    pub victims_woken: u64,
    pub removals: u64,
}

/// Serializes detection and resolution for the whole process.
///
/// Built once at startup and shared (typically behind an `Arc`) with the
/// lock manager and transaction manager.
pub struct DeadlockHandler {
    detector: Box<dyn DeadlockDetector>,
    resolver: Box<dyn DeadlockResolver>,
    section: ReentrantMutex<()>,
    stats: RwLock<DeadlockStats>,
}

impl DeadlockHandler {
    pub fn new(detector: Box<dyn DeadlockDetector>, resolver: Box<dyn DeadlockResolver>) -> Self {
        Self {
            detector,
            resolver,
            section: ReentrantMutex::new(()),
            stats: RwLock::new(DeadlockStats::default()),
        }
    }

    /// Build the configured detector and victim selection policy.
    pub fn from_config(config: &DeadlockConfig) -> Self {
        info!(
            "Deadlock handler using {} detector, {:?} victim selection",
            config.detector, config.victim_selection
        );
        Self::new(
            detector_for(config.detector),
            resolver_for(config.victim_selection),
        )
    }

    /// Record that `txn` requests `lockable` currently held by `owners`, and
    /// resolve any deadlock this creates.
    ///
    /// Returns `true` when a deadlock was detected and a victim woken; the
    /// caller must not grant the lock yet.
    ///
    /// # Panics
    ///
    /// If the detector reports the requesting transaction as conflicting
    /// with itself. That is a bookkeeping bug, not a runtime condition.
    pub fn add_and_resolve_deadlock(
        &self,
        lockable: &LockableId,
        txn: &TxnRef,
        owners: &[TxnRef],
    ) -> bool {
        let guard = self.section.lock();

        self.detector.add(lockable, txn, owners);
        let conflicting = self.detector.conflicting_transactions();
        self.stats.write().detection_runs += 1;

        if conflicting.is_empty() {
            ReentrantMutexGuard::unlock_fair(guard);
            return false;
        }

        let requester = txn.id();
        if !self.detector.reports_requester() {
            assert!(
                conflicting.iter().all(|t| t.id() != requester),
                "{} detector reported requesting {} as conflicting with itself on {}",
                self.detector.name(),
                requester,
                lockable
            );
        }

        let victim = self.resolver.resolve_deadlock(&conflicting);
        {
            let mut stats = self.stats.write();
            stats.deadlocks_resolved += 1;
            if victim.is_some() {
                stats.victims_woken += 1;
            }
        }

        if let Some(victim) = victim {
            warn!(
                "Deadlock detected on {} requested by {}, victim: {}",
                lockable,
                requester,
                victim.id()
            );
        }

        ReentrantMutexGuard::unlock_fair(guard);
        true
    }

    /// Forget `txn`'s interest in `lockable` after release, commit or abort.
    pub fn remove(&self, lockable: &LockableId, txn: &TxnRef) {
        let guard = self.section.lock();
        self.detector.remove(lockable, txn);
        self.stats.write().removals += 1;
        trace!("Removed {} from {} bookkeeping", txn.id(), lockable);
        ReentrantMutexGuard::unlock_fair(guard);
    }

    /// Get statistics.
    pub fn stats(&self) -> DeadlockStats {
        self.stats.read().clone()
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }
}

impl fmt::Debug for DeadlockHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockHandler")
            .field("detector", &self.detector.name())
            .field("stats", &self.stats())
            .finish()
    }
}
