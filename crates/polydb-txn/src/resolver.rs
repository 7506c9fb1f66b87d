//! Victim selection for detected deadlocks.

use polydb_common::prelude::*;

use crate::transaction::{Transaction, TxnRef};

/// Picks one participant of a conflict and wakes it.
pub trait DeadlockResolver: Send + Sync {
    /// Wake exactly one transaction from `conflicting`, returning it.
    /// An empty list is a no-op.
    fn resolve_deadlock(&self, conflicting: &[TxnRef]) -> Option<TxnRef> {
        let victim = self.select_victim(conflicting)?;
        victim.wakeup();
        Some(victim)
    }

    /// Choose the victim without waking it.
    fn select_victim(&self, conflicting: &[TxnRef]) -> Option<TxnRef>;
}

/// Wakes the first transaction reported by the detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstTransactionResolver;

impl DeadlockResolver for FirstTransactionResolver {
    fn select_victim(&self, conflicting: &[TxnRef]) -> Option<TxnRef> {
        conflicting.first().cloned()
    }
}

/// Wakes the most recently started transaction (highest sequence number).
#[derive(Debug, Default, Clone, Copy)]
pub struct YoungestTransactionResolver;

impl DeadlockResolver for YoungestTransactionResolver {
    fn select_victim(&self, conflicting: &[TxnRef]) -> Option<TxnRef> {
        conflicting
            .iter()
            .max_by_key(|t| (t.sequence_number(), t.id()))
            .cloned()
    }
}

/// Wakes the oldest transaction (lowest sequence number).
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestTransactionResolver;

impl DeadlockResolver for OldestTransactionResolver {
    fn select_victim(&self, conflicting: &[TxnRef]) -> Option<TxnRef> {
        conflicting
            .iter()
            .min_by_key(|t| (t.sequence_number(), t.id()))
            .cloned()
    }
}

/// Build the resolver for a configured policy.
pub fn resolver_for(selection: VictimSelection) -> Box<dyn DeadlockResolver> {
    match selection {
        VictimSelection::First => Box::new(FirstTransactionResolver),
        VictimSelection::Youngest => Box::new(YoungestTransactionResolver),
        VictimSelection::Oldest => Box::new(OldestTransactionResolver),
    }
}
