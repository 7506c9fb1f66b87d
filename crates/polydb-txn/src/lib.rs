//! # PolyDB Transaction
//!
//! Deadlock detection and resolution for PolyDB transactions:
//! - Transaction handles with a cooperative wait/wakeup primitive
//! - Exact wait-for graph detection
//! - Request-sequence heuristic detection
//! - Pluggable victim selection
//! - A handler serializing detection for the lock manager
//!
//! The lock manager decides lock compatibility and owns the owner sets. It
//! reports every request and release to a [`DeadlockHandler`]:
//!
//! ```text
//! lock manager ── add_and_resolve_deadlock ──> DeadlockHandler
//!                                               │ add / conflicting_transactions
//!                                               ▼
//!                                          DeadlockDetector
//!                                               │ non-empty verdict
//!                                               ▼
//!                                          DeadlockResolver ──> victim.wakeup()
//! ```

pub mod deadlock;
pub mod handler;
pub mod lockable;
pub mod resolver;
pub mod sequence;
pub mod transaction;

// Re-export key types for convenience
pub use deadlock::{GraphStats, WaitForGraph};
pub use handler::{DeadlockHandler, DeadlockStats};
pub use lockable::LockableId;
pub use resolver::{
    resolver_for, DeadlockResolver, FirstTransactionResolver, OldestTransactionResolver,
    YoungestTransactionResolver,
};
pub use sequence::RequestSequenceDetector;
pub use transaction::{Transaction, TxnHandle, TxnRef, TxnSequencer, WaitOutcome};

use polydb_common::config::DeadlockDetectorKind;

/// Deadlock detector strategy.
///
/// Implementations are driven by [`DeadlockHandler`], which calls them under
/// its own section; they must still be `Send + Sync` to be shared.
pub trait DeadlockDetector: Send + Sync {
    /// `requester` now waits for `lockable`, currently held by `owners`.
    fn add(&self, lockable: &LockableId, requester: &TxnRef, owners: &[TxnRef]);

    /// `txn` released `lockable`, committed, or aborted. Idempotent.
    fn remove(&self, lockable: &LockableId, txn: &TxnRef);

    /// Transactions involved in a detected conflict, consumed by this call.
    fn conflicting_transactions(&self) -> Vec<TxnRef>;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether a verdict may name the requester itself as the victim.
    fn reports_requester(&self) -> bool {
        false
    }
}

/// Build the detector for a configured strategy.
pub fn detector_for(kind: DeadlockDetectorKind) -> Box<dyn DeadlockDetector> {
    match kind {
        DeadlockDetectorKind::Graph => Box::new(WaitForGraph::new()),
        DeadlockDetectorKind::RequestSequence => Box::new(RequestSequenceDetector::new()),
    }
}
