//! End-to-end deadlock tests
//!
//! Drives the handler the way a lock manager would: real threads block on
//! exclusive locks and deadlock victims are released through `wakeup`.

use parking_lot::Mutex;
use polydb_common::prelude::*;
use polydb_txn::{
    DeadlockHandler, LockableId, Transaction, TxnHandle, TxnRef, TxnSequencer, WaitOutcome,
};
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal exclusive-only lock table standing in for the lock manager.
struct LockTable {
    handler: Arc<DeadlockHandler>,
    owners: Mutex<HashMap<LockableId, Arc<TxnHandle>>>,
    timeout: Duration,
}

impl LockTable {
    fn new(config: &DeadlockConfig) -> Self {
        Self {
            handler: Arc::new(DeadlockHandler::from_config(config)),
            owners: Mutex::new(HashMap::new()),
            timeout: config.lock_wait_timeout,
        }
    }

    fn acquire(&self, txn: &Arc<TxnHandle>, lockable: &LockableId) -> Result<()> {
        let txn_ref: TxnRef = txn.clone();
        let deadline = Instant::now() + self.timeout;
        let mut reported: Option<TxnId> = None;

        loop {
            txn.check_not_victim()?;

            let owner = {
                let mut owners = self.owners.lock();
                match owners.get(lockable) {
                    None => {
                        owners.insert(lockable.clone(), txn.clone());
                        None
                    }
                    Some(o) if o.id() == txn.id() => None,
                    Some(o) => Some(o.clone()),
                }
            };

            let Some(owner) = owner else {
                // Granted: record interest with no owners to wait for.
                self.handler.add_and_resolve_deadlock(lockable, &txn_ref, &[]);
                return txn.check_not_victim();
            };

            if reported != Some(owner.id()) {
                reported = Some(owner.id());
                let owner_ref: TxnRef = owner;
                if self
                    .handler
                    .add_and_resolve_deadlock(lockable, &txn_ref, &[owner_ref])
                {
                    txn.check_not_victim()?;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransactionError::LockTimeout(txn.id()).into());
            }
            match txn.wait_for(remaining.min(POLL)) {
                WaitOutcome::Woken => txn.check_not_victim()?,
                WaitOutcome::Finished => return Err(TransactionError::Finished(txn.id()).into()),
                WaitOutcome::TimedOut => {}
            }
        }
    }

    /// Release everything `txn` holds and everything it waited on.
    fn finish(&self, txn: &Arc<TxnHandle>, touched: &[LockableId]) {
        let txn_ref: TxnRef = txn.clone();
        // Forget the waits before handing the locks over, so a new owner
        // never sees edges through a finished transaction.
        for lockable in touched {
            self.handler.remove(lockable, &txn_ref);
        }
        self.owners.lock().retain(|_, o| o.id() != txn.id());
        txn.finish();
    }

    /// Acquire `lockables` in order, then release; returns the first failure.
    fn run(&self, txn: &Arc<TxnHandle>, lockables: &[LockableId], hold: Duration) -> Result<()> {
        let mut touched = Vec::new();
        let mut result = Ok(());
        for lockable in lockables {
            touched.push(lockable.clone());
            if let Err(e) = self.acquire(txn, lockable) {
                result = Err(e);
                break;
            }
            thread::sleep(hold);
        }
        self.finish(txn, &touched);
        result
    }
}

fn entity(id: u64) -> LockableId {
    LockableId::Entity(EntityId(id))
}

fn is_deadlock(result: &Result<()>) -> bool {
    matches!(
        result,
        Err(Error::Transaction(TransactionError::Deadlock(_)))
    )
}

/// T1 holds A and wants B, T2 holds B and wants A.
fn crossed_pair(config: DeadlockConfig) -> (Result<()>, Result<()>, Arc<LockTable>) {
    let table = Arc::new(LockTable::new(&config));
    let sequencer = TxnSequencer::new();
    let t1 = sequencer.begin();
    let t2 = sequencer.begin();
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |txn: Arc<TxnHandle>, first: LockableId, second: LockableId| {
        let table = table.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            let mut touched = vec![first.clone()];
            let mut result = table.acquire(&txn, &first);
            barrier.wait();
            if result.is_ok() {
                touched.push(second.clone());
                result = table.acquire(&txn, &second);
            }
            table.finish(&txn, &touched);
            result
        })
    };

    let h1 = spawn(t1, entity(1), entity(2));
    let h2 = spawn(t2, entity(2), entity(1));
    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();
    (r1, r2, table)
}

#[test]
fn test_graph_resolves_crossed_locks() {
    init_tracing();
    let (r1, r2, table) = crossed_pair(DeadlockConfig::default());

    // Exactly one side is sacrificed, the other commits.
    assert!(is_deadlock(&r1) ^ is_deadlock(&r2), "{:?} / {:?}", r1, r2);
    assert!(r1.is_ok() || r2.is_ok());

    let stats = table.handler.stats();
    assert_eq!(stats.deadlocks_resolved, 1);
    assert_eq!(stats.victims_woken, 1);
}

#[test]
fn test_request_sequence_sacrifices_younger() {
    init_tracing();
    let (r1, r2, _table) = crossed_pair(DeadlockConfig {
        detector: DeadlockDetectorKind::RequestSequence,
        ..DeadlockConfig::default()
    });

    // T2 started later, so it is the one that dies.
    assert!(r1.is_ok(), "{:?}", r1);
    assert!(is_deadlock(&r2), "{:?}", r2);
    assert_eq!(r2.unwrap_err().sqlstate(), "40P01");
}

#[test]
fn test_victim_blocked_in_wait_is_released() {
    init_tracing();
    let table = Arc::new(LockTable::new(&DeadlockConfig::default()));
    let sequencer = TxnSequencer::new();
    let t1 = sequencer.begin();
    let t2 = sequencer.begin();

    table.acquire(&t1, &entity(1)).unwrap();
    table.acquire(&t2, &entity(2)).unwrap();

    // T2 blocks on entity 1 first.
    let waiter = {
        let table = table.clone();
        let t2 = t2.clone();
        thread::spawn(move || {
            let result = table.acquire(&t2, &entity(1));
            table.finish(&t2, &[entity(1), entity(2)]);
            result
        })
    };
    while !t2.is_waiting() {
        thread::yield_now();
    }

    // T1 closing the cycle wakes T2 and then gets its lock.
    table.acquire(&t1, &entity(2)).unwrap();
    let result = waiter.join().unwrap();

    assert!(is_deadlock(&result), "{:?}", result);
    assert!(t2.is_victim());
    assert!(!t1.is_victim());
    table.finish(&t1, &[entity(1), entity(2)]);
}

#[test]
fn test_three_way_cycle() {
    init_tracing();
    let table = Arc::new(LockTable::new(&DeadlockConfig::default()));
    let sequencer = TxnSequencer::new();
    let txns: Vec<Arc<TxnHandle>> = (0..3).map(|_| sequencer.begin()).collect();
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = txns
        .iter()
        .enumerate()
        .map(|(i, txn)| {
            let table = table.clone();
            let barrier = barrier.clone();
            let txn = txn.clone();
            let own = entity(i as u64);
            let next = entity(((i + 1) % 3) as u64);
            thread::spawn(move || {
                table.acquire(&txn, &own).unwrap();
                barrier.wait();
                let result = table.acquire(&txn, &next);
                table.finish(&txn, &[own, next]);
                result
            })
        })
        .collect();

    let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let deadlocks = results.iter().filter(|r| is_deadlock(r)).count();

    assert!(deadlocks >= 1, "{:?}", results);
    assert!(results.iter().any(|r| r.is_ok()), "{:?}", results);
    assert!(results.iter().all(|r| r.is_ok() || is_deadlock(r)));
}

#[test]
fn test_no_deadlock_without_conflict() {
    init_tracing();
    let table = Arc::new(LockTable::new(&DeadlockConfig::default()));
    let sequencer = Arc::new(TxnSequencer::new());

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let table = table.clone();
            let sequencer = sequencer.clone();
            thread::spawn(move || {
                let txn = sequencer.begin();
                table.run(&txn, &[entity(i * 2), entity(i * 2 + 1)], Duration::ZERO)
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(table.handler.stats().deadlocks_resolved, 0);
}

#[test]
fn test_contended_workload_terminates() {
    init_tracing();
    for detector in [
        DeadlockDetectorKind::Graph,
        DeadlockDetectorKind::RequestSequence,
    ] {
        let table = Arc::new(LockTable::new(&DeadlockConfig {
            detector,
            lock_wait_timeout: Duration::from_secs(1),
            ..DeadlockConfig::default()
        }));
        let sequencer = Arc::new(TxnSequencer::new());

        let handles: Vec<_> = (0..6u64)
            .map(|i| {
                let table = table.clone();
                let sequencer = sequencer.clone();
                thread::spawn(move || {
                    let order = if i % 2 == 0 {
                        [entity(1), entity(2)]
                    } else {
                        [entity(2), entity(1)]
                    };
                    (0..10)
                        .map(|_| {
                            let txn = sequencer.begin();
                            table.run(&txn, &order, Duration::from_micros(200))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Result<()>> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(results.len(), 60);
        assert!(
            results.iter().all(|r| match r {
                Ok(()) => true,
                Err(e) => e.is_retryable(),
            }),
            "{} produced a non-retryable failure",
            detector
        );
        assert!(results.iter().any(|r| r.is_ok()), "{} committed nothing", detector);
    }
}
