//! The per-transaction state shared by every [`crate::record::OperationReferenceEntry`]
//! it produced, and the latch a reader waits on while that transaction is
//! still resolving.
//!
//! A transaction whose operation count exceeds [`LATCH_SPIN_THRESHOLD`]
//! installs a real latch so a waiting reader parks instead of burning a
//! core; smaller transactions resolve fast enough that a spin-yield loop
//! is cheaper than the latch's own bookkeeping.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Above this many operations, a commit installs a [`Latch`] for waiters
/// instead of relying on spin-yield.
pub const LATCH_SPIN_THRESHOLD: usize = 10;

/// Lifecycle of a transaction as observed by concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    /// Still being committed (or never committed, for the lifetime of a
    /// read-only transaction's staged writes, which never reach this type).
    InProgress = 0,
    /// Committed; its writes are visible.
    Committed = 1,
    /// Rolled back; its writes must never be observed.
    Reverted = 2,
}

impl TxState {
    fn from_u8(v: u8) -> TxState {
        match v {
            0 => TxState::InProgress,
            1 => TxState::Committed,
            _ => TxState::Reverted,
        }
    }
}

/// A one-shot countdown gate a reader can block on instead of spinning.
#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    fn new() -> Self {
        Latch {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.condvar.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Shared state wrapper referenced by every log entry a write transaction
/// produced. Readers that land on an entry still `InProgress` block on
/// [`TransactionStateWrapper::wait_until_resolved`] until the owning
/// transaction commits or reverts.
#[derive(Debug)]
pub struct TransactionStateWrapper {
    state: AtomicU8,
    latch: Option<Latch>,
}

impl TransactionStateWrapper {
    /// A fresh wrapper in `InProgress` state. `operation_count` decides
    /// whether a latch is installed (see [`LATCH_SPIN_THRESHOLD`]).
    pub fn new(operation_count: usize) -> Arc<Self> {
        Arc::new(TransactionStateWrapper {
            state: AtomicU8::new(TxState::InProgress as u8),
            latch: if operation_count > LATCH_SPIN_THRESHOLD {
                Some(Latch::new())
            } else {
                None
            },
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to a terminal state and release any waiting readers.
    pub fn resolve(&self, final_state: TxState) {
        debug_assert_ne!(final_state, TxState::InProgress);
        self.state.store(final_state as u8, Ordering::Release);
        if let Some(latch) = &self.latch {
            latch.release();
        }
    }

    /// Block (via latch or spin-yield) until this wrapper leaves
    /// `InProgress`.
    pub fn wait_until_resolved(&self) {
        if let Some(latch) = &self.latch {
            if self.state() == TxState::InProgress {
                latch.wait();
            }
            return;
        }
        while self.state() == TxState::InProgress {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn small_transaction_has_no_latch_and_spins_until_resolved() {
        let wrapper = TransactionStateWrapper::new(2);
        assert_eq!(wrapper.state(), TxState::InProgress);
        let w2 = Arc::clone(&wrapper);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            w2.resolve(TxState::Committed);
        });
        wrapper.wait_until_resolved();
        assert_eq!(wrapper.state(), TxState::Committed);
        handle.join().unwrap();
    }

    #[test]
    fn large_transaction_installs_a_latch() {
        let wrapper = TransactionStateWrapper::new(LATCH_SPIN_THRESHOLD + 1);
        let w2 = Arc::clone(&wrapper);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            w2.resolve(TxState::Reverted);
        });
        wrapper.wait_until_resolved();
        assert_eq!(wrapper.state(), TxState::Reverted);
        handle.join().unwrap();
    }
}
