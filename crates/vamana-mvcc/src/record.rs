//! Per-key-hash versioned container linking to log-addressed operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::Key;
use crate::wrapper::TransactionStateWrapper;

/// One write staged against a particular key hash, pointing at the
/// operation log entry that carries its payload and at the shared
/// wrapper that tells readers whether the owning transaction has
/// resolved yet.
#[derive(Debug, Clone)]
pub struct OperationReferenceEntry {
    /// Address of the [`crate::log::OperationLogRecord`] this entry describes.
    pub operation_address: u64,
    /// Snapshot id of the transaction that produced this write.
    pub tx_id: u64,
    /// The key this write was staged against (kept alongside the hash to
    /// resolve collisions in [`crate::store::MvccStore::read`]).
    pub key: Key,
    /// Shared lifecycle state of the owning transaction.
    pub wrapper: Arc<TransactionStateWrapper>,
}

/// Per-key-hash bucket: a high-watermark of transactions that have
/// observed this record, plus every write staged against it.
///
/// The watermark and the queue are independently synchronized: bumping
/// `max_transaction_id` never takes the queue's lock, and appending to the
/// queue never touches the watermark. Both sides of [`crate::store::MvccStore::read`]
/// /`commit`'s snapshot-isolation check only needs them to be individually
/// linearizable, not jointly atomic.
#[derive(Debug, Default)]
pub struct MVCCRecord {
    max_transaction_id: AtomicU64,
    queue: Mutex<Vec<OperationReferenceEntry>>,
}

impl MVCCRecord {
    /// A fresh, empty record.
    pub fn new() -> Self {
        MVCCRecord {
            max_transaction_id: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Current watermark: the highest snapshot id that has observed this
    /// record.
    pub fn max_transaction_id(&self) -> u64 {
        self.max_transaction_id.load(Ordering::Acquire)
    }

    /// Bump the watermark up to `candidate`, never down. Returns the
    /// watermark after the call.
    pub fn bump_max_transaction_id(&self, candidate: u64) -> u64 {
        let mut current = self.max_transaction_id.load(Ordering::Acquire);
        loop {
            if current >= candidate {
                return current;
            }
            match self.max_transaction_id.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Append one staged write.
    pub fn push(&self, entry: OperationReferenceEntry) {
        self.queue.lock().push(entry);
    }

    /// Snapshot of every entry currently queued, for the scans in
    /// [`crate::store::MvccStore::read`]. Cloned out from under the lock so
    /// callers never hold it across a latch wait.
    pub fn snapshot(&self) -> Vec<OperationReferenceEntry> {
        self.queue.lock().clone()
    }
}
