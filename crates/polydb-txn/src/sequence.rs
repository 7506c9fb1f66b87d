//! Request-sequence deadlock detection.
//!
//! A low-overhead heuristic: every lockable remembers the lowest sequence
//! number among the transactions known to be interested in it. A requester
//! that arrived later than that is flagged as the conflicting transaction,
//! the way wait-die lets a younger transaction die instead of waiting behind
//! an older one.
//!
//! This is best-effort. False positives cost an unnecessary abort, and since
//! `remove` throws away the history of a lockable, real cycles can be missed.
//! Deployments using it rely on the lock wait timeout as the backstop.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use polydb_common::prelude::*;
use std::sync::{Arc, Weak};

use crate::lockable::LockableId;
use crate::transaction::{Transaction, TxnRef};
use crate::DeadlockDetector;

/// Per-lockable sequence bookkeeping with a single critical-transaction slot.
#[derive(Debug, Default)]
pub struct RequestSequenceDetector {
    sequences: DashMap<LockableId, u64>,
    critical: Mutex<Option<Weak<dyn Transaction>>>,
}

impl RequestSequenceDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest sequence number currently recorded for `lockable`.
    pub fn recorded_sequence(&self, lockable: &LockableId) -> Option<u64> {
        self.sequences.get(lockable).map(|s| *s)
    }

    /// Number of lockables with a recorded sequence number.
    pub fn tracked_lockables(&self) -> usize {
        self.sequences.len()
    }
}

impl DeadlockDetector for RequestSequenceDetector {
    fn add(&self, lockable: &LockableId, requester: &TxnRef, owners: &[TxnRef]) {
        let sequence = requester.sequence_number();

        match self.sequences.entry(lockable.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(sequence);
            }
            Entry::Occupied(mut entry) => {
                if sequence > *entry.get() {
                    trace!(
                        "{} (seq {}) arrived after seq {} on {}",
                        requester.id(),
                        sequence,
                        entry.get(),
                        lockable
                    );
                    drop(entry);
                    *self.critical.lock() = Some(Arc::downgrade(requester));
                    return;
                }

                if let Some(oldest) = owners.iter().map(|o| o.sequence_number()).min() {
                    if oldest < *entry.get() {
                        *entry.get_mut() = oldest;
                    }
                }
            }
        }
    }

    fn remove(&self, lockable: &LockableId, _txn: &TxnRef) {
        self.sequences.remove(lockable);
    }

    fn conflicting_transactions(&self) -> Vec<TxnRef> {
        self.critical
            .lock()
            .take()
            .and_then(|w| w.upgrade())
            .into_iter()
            .collect()
    }

    fn name(&self) -> &'static str {
        "request-sequence"
    }

    fn reports_requester(&self) -> bool {
        true
    }
}
