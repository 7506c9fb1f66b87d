//! Transaction handles as seen by the deadlock subsystem.
//!
//! The detector never owns a transaction. It only needs:
//! - a stable, ordered identity
//! - a sequence number assigned at start (arrival order)
//! - a `wakeup` that forces a blocked transaction out of its wait

use parking_lot::{Condvar, Mutex};
use polydb_common::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Contract a transaction must fulfil to take part in deadlock detection.
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Unique transaction identity.
    fn id(&self) -> TxnId;

    /// Monotonically increasing number assigned when the transaction started.
    fn sequence_number(&self) -> u64;

    /// Release the transaction's thread from whatever lock wait it is in.
    ///
    /// Must be idempotent, callable from any thread, and a no-op on a
    /// transaction that has already finished.
    fn wakeup(&self);
}

/// Shared handle to a transaction.
pub type TxnRef = Arc<dyn Transaction>;

/// Why a call to [`TxnHandle::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by the deadlock resolver; the transaction must abort.
    Woken,
    /// The wait deadline passed.
    TimedOut,
    /// The transaction finished while waiting.
    Finished,
}

#[derive(Debug, Default)]
struct WaitState {
    waiters: usize,
    victim: bool,
    finished: bool,
}

/// Concrete transaction handle with a condvar-based suspend/resume primitive.
pub struct TxnHandle {
    id: TxnId,
    sequence: u64,
    state: Mutex<WaitState>,
    condvar: Condvar,
}

impl TxnHandle {
    pub fn new(id: TxnId, sequence: u64) -> Self {
        Self {
            id,
            sequence,
            state: Mutex::new(WaitState::default()),
            condvar: Condvar::new(),
        }
    }

    /// Block until woken or finished.
    pub fn wait(&self) -> WaitOutcome {
        let mut state = self.state.lock();
        state.waiters += 1;
        while !state.victim && !state.finished {
            self.condvar.wait(&mut state);
        }
        state.waiters -= 1;
        Self::outcome(&state)
    }

    /// Block until woken, finished, or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiters += 1;

        let outcome = loop {
            if state.victim || state.finished {
                break Self::outcome(&state);
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                // A wakeup may have raced with the deadline.
                if state.victim || state.finished {
                    break Self::outcome(&state);
                }
                break WaitOutcome::TimedOut;
            }
        };

        state.waiters -= 1;
        outcome
    }

    fn outcome(state: &WaitState) -> WaitOutcome {
        if state.victim {
            WaitOutcome::Woken
        } else {
            WaitOutcome::Finished
        }
    }

    /// Mark the transaction as committed or aborted and release any waiter.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        if state.waiters > 0 {
            self.condvar.notify_all();
        }
    }

    /// Whether the transaction has been chosen as a deadlock victim.
    pub fn is_victim(&self) -> bool {
        self.state.lock().victim
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Whether some thread is currently blocked in `wait`.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiters > 0
    }

    /// Fail with a deadlock error once this transaction has been woken as a victim.
    pub fn check_not_victim(&self) -> Result<()> {
        if self.is_victim() {
            return Err(TransactionError::Deadlock(self.id).into());
        }
        Ok(())
    }
}

impl Transaction for TxnHandle {
    fn id(&self) -> TxnId {
        self.id
    }

    fn sequence_number(&self) -> u64 {
        self.sequence
    }

    fn wakeup(&self) {
        let mut state = self.state.lock();
        if state.finished || state.victim {
            return;
        }
        // The mark is sticky: a wakeup that lands before the victim starts
        // waiting is observed by its next wait.
        state.victim = true;
        if state.waiters > 0 {
            self.condvar.notify_all();
        }
        trace!("Woke {} (waiters: {})", self.id, state.waiters);
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnHandle")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Process-wide source of transaction ids and sequence numbers.
#[derive(Debug)]
pub struct TxnSequencer {
    next_id: AtomicU64,
    next_sequence: AtomicU64,
}

impl TxnSequencer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Start a new transaction.
    pub fn begin(&self) -> Arc<TxnHandle> {
        let id = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        Arc::new(TxnHandle::new(id, sequence))
    }
}

impl Default for TxnSequencer {
    fn default() -> Self {
        Self::new()
    }
}
