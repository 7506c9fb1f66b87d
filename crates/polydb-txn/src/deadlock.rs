//! Wait-for graph deadlock detection for PolyDB.
//!
//! Exact strategy: every lock request adds `requester -> owner` edges and a
//! DFS from the most recently added requester looks for a cycle:
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1 (cycle = deadlock!)
//! ```
//! The graph holds only weak handles; transactions are owned by the
//! transaction manager.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use polydb_common::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::lockable::LockableId;
use crate::transaction::{Transaction, TxnRef};
use crate::DeadlockDetector;

/// Wait-for graph statistics.
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    pub edges_added: u64,
    pub txns_removed: u64,
    pub detection_runs: u64,
    pub cycles_found: u64,
}

/// Wait-for graph for deadlock detection.
pub struct WaitForGraph {
    /// Adjacency list: waiter -> holders it waits for
    edges: DashMap<TxnId, HashSet<TxnId>>,
    /// Non-owning handles of every node seen in `edges`
    handles: DashMap<TxnId, Weak<dyn Transaction>>,
    /// Requester of the most recent `add`; detection starts here
    last_added: Mutex<Option<TxnId>>,
    stats: RwLock<GraphStats>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: DashMap::new(),
            handles: DashMap::new(),
            last_added: Mutex::new(None),
            stats: RwLock::new(GraphStats::default()),
        }
    }

    fn track(&self, txn: &TxnRef) {
        self.handles
            .entry(txn.id())
            .or_insert_with(|| Arc::downgrade(txn));
    }

    /// Record that `waiter` now additionally waits for every id in `holders`.
    fn add_edges(&self, waiter: TxnId, holders: impl IntoIterator<Item = TxnId>) {
        let mut added = 0;
        {
            let mut waits = self.edges.entry(waiter).or_default();
            for holder in holders {
                // An owner upgrading its own lock does not wait on itself.
                if holder != waiter && waits.insert(holder) {
                    added += 1;
                }
            }
        }

        if added > 0 {
            self.stats.write().edges_added += added;
            trace!("{} waits for {} more transaction(s)", waiter, added);
        }
        *self.last_added.lock() = Some(waiter);
    }

    /// Drop a transaction: its own waits and every wait on it.
    fn remove_txn(&self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for mut holders in self.edges.iter_mut() {
            holders.value_mut().remove(&txn_id);
        }
        self.handles.remove(&txn_id);

        let mut last = self.last_added.lock();
        if *last == Some(txn_id) {
            *last = None;
        }
        drop(last);

        self.stats.write().txns_removed += 1;
    }

    /// DFS from `current`. Returns the node whose outgoing edge closes a cycle.
    fn find_cycle(
        &self,
        current: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        visited.insert(current);
        path.insert(current);

        // Copy out so no shard guard is held across the recursion.
        let holders: Vec<TxnId> = self
            .edges
            .get(&current)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();

        for holder in holders {
            if path.contains(&holder) {
                return Some(current);
            }
            if visited.contains(&holder) {
                continue;
            }
            if let Some(closing) = self.find_cycle(holder, visited, path) {
                return Some(closing);
            }
        }

        path.remove(&current);
        None
    }

    /// Get statistics.
    pub fn stats(&self) -> GraphStats {
        self.stats.read().clone()
    }

    /// Get number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(|e| e.value().len()).sum()
    }

    /// Get number of transactions with an adjacency entry.
    pub fn txn_count(&self) -> usize {
        self.edges.len()
    }

    /// Check if a transaction is waiting.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.edges
            .get(&txn_id)
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }

    /// Transactions `waiter` currently waits for.
    pub fn waits_for(&self, waiter: TxnId) -> Vec<TxnId> {
        let mut holders: Vec<TxnId> = self
            .edges
            .get(&waiter)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("txn_count", &self.txn_count())
            .field("edge_count", &self.edge_count())
            .finish()
    }
}

impl DeadlockDetector for WaitForGraph {
    fn add(&self, _lockable: &LockableId, requester: &TxnRef, owners: &[TxnRef]) {
        self.track(requester);
        for owner in owners {
            self.track(owner);
        }
        self.add_edges(requester.id(), owners.iter().map(|o| o.id()));
    }

    fn remove(&self, _lockable: &LockableId, txn: &TxnRef) {
        self.remove_txn(txn.id());
    }

    fn conflicting_transactions(&self) -> Vec<TxnRef> {
        let Some(start) = *self.last_added.lock() else {
            return Vec::new();
        };
        self.stats.write().detection_runs += 1;

        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        let Some(closing) = self.find_cycle(start, &mut visited, &mut path) else {
            return Vec::new();
        };

        // Deliver each detected cycle once.
        *self.last_added.lock() = None;

        let victim = self.handles.get(&closing).and_then(|w| w.upgrade());
        match victim {
            Some(txn) => {
                self.stats.write().cycles_found += 1;
                debug!("Cycle reached from {} is closed by {}", start, closing);
                vec![txn]
            }
            None => {
                // A dropped transaction neither holds nor awaits anything.
                debug!("Pruning dropped {} from wait-for graph", closing);
                self.remove_txn(closing);
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "graph"
    }
}
