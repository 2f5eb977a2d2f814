//! The MVCC operation log itself: snapshot-isolated reads, atomic commit
//! with rollback on write-write conflict, and the plumbing that feeds
//! resolved transactions into the [`crate::gc::GarbageCollector`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use vamana_core::{Fallback, NoFallback, Result, VamanaError};

use crate::gc::{GarbageCollector, GcState};
use crate::key::Key;
use crate::log::{OpType, OperationLog, OperationLogRecord};
use crate::record::{MVCCRecord, OperationReferenceEntry};
use crate::transaction::{PendingOp, Transaction, TxKind};
use crate::wrapper::{TransactionStateWrapper, TxState};

/// Snapshot-isolated key/value operation log.
///
/// `F` is the authoritative fallback store consulted by [`MvccStore::read`]
/// when no operation log entry resolves a key (a B-tree or other persistent
/// store backing values the log hasn't touched). Defaults to [`NoFallback`]
/// for standalone use and tests.
pub struct MvccStore<F: Fallback = NoFallback> {
    global_snapshot_id: AtomicU64,
    records: DashMap<u64, Arc<MVCCRecord>>,
    log: OperationLog,
    gc: GarbageCollector,
    fallback: F,
}

impl MvccStore<NoFallback> {
    /// A store with no authoritative fallback: unresolved reads return `None`.
    pub fn new() -> Self {
        MvccStore::with_fallback(NoFallback)
    }
}

impl Default for MvccStore<NoFallback> {
    fn default() -> Self {
        MvccStore::new()
    }
}

impl<F: Fallback> MvccStore<F> {
    /// A store backed by `fallback` for keys with no visible MVCC entry.
    pub fn with_fallback(fallback: F) -> Self {
        MvccStore {
            global_snapshot_id: AtomicU64::new(0),
            records: DashMap::new(),
            log: OperationLog::new(),
            gc: GarbageCollector::new(),
            fallback,
        }
    }

    /// The garbage collector tracking this store's resolved transactions.
    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// Current global snapshot id (the most recently allocated write's, or
    /// the highest watermark any commit has advanced past).
    pub fn current_snapshot_id(&self) -> u64 {
        self.global_snapshot_id.load(Ordering::Acquire)
    }

    /// Begin a read-only transaction at the current global snapshot.
    pub fn start_read_transaction(&self) -> Transaction {
        Transaction::new(self.current_snapshot_id(), TxKind::Read)
    }

    /// Begin a write transaction, atomically incrementing the global
    /// snapshot id and taking the new value as this transaction's id.
    ///
    /// Registers the new id with the GC map as [`GcState::InProgress`]
    /// immediately, so a concurrent [`GarbageCollector::find_max_min_id`]
    /// call can see it and refuse to treat it as resolved before this
    /// transaction commits or reverts.
    pub fn start_write_transaction(&self) -> Transaction {
        let id = self.global_snapshot_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.gc.record(id, GcState::InProgress);
        Transaction::new(id, TxKind::Write)
    }

    fn ensure_record(&self, key_hash: u64) -> Arc<MVCCRecord> {
        Arc::clone(
            self.records
                .entry(key_hash)
                .or_insert_with(|| Arc::new(MVCCRecord::new())),
        )
    }

    /// Stage a write of `value` at `key`. Allocates a log entry immediately;
    /// the per-key version chain is only touched at [`MvccStore::commit`].
    ///
    /// # Errors
    /// Returns [`VamanaError::InvariantViolation`] if `tx` is a read-only
    /// transaction.
    pub fn put(&self, tx: &mut Transaction, key: impl Into<Key>, value: Vec<u8>) -> Result<()> {
        self.stage(tx, key.into(), OpType::Put, value)
    }

    /// Stage a tombstone for `key`.
    ///
    /// # Errors
    /// Returns [`VamanaError::InvariantViolation`] if `tx` is a read-only
    /// transaction.
    pub fn remove(&self, tx: &mut Transaction, key: impl Into<Key>) -> Result<()> {
        self.stage(tx, key.into(), OpType::Remove, Vec::new())
    }

    fn stage(&self, tx: &mut Transaction, key: Key, op_type: OpType, value: Vec<u8>) -> Result<()> {
        if tx.kind != TxKind::Write {
            return Err(VamanaError::InvariantViolation(
                "cannot stage a write against a read-only transaction".into(),
            ));
        }
        let key_hash = key.hash_code();
        let address = self.log.append(OperationLogRecord::Write {
            key: key.clone(),
            value,
            op_type,
        });
        tx.operations.push(PendingOp {
            address,
            key_hash,
            key,
        });
        Ok(())
    }

    /// Resolve `key` as visible at `tx`'s snapshot.
    ///
    /// Bumps the touched record's watermark up to `tx.snapshot_id` before
    /// scanning, per the snapshot invariant: once this has run, no write
    /// with a smaller snapshot id may still commit against the record.
    pub fn read(&self, tx: &Transaction, key: impl Into<Key>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        let key_hash = key.hash_code();
        let record = self.ensure_record(key_hash);
        let watermark = record.bump_max_transaction_id(tx.snapshot_id);

        let mut entries = record.snapshot();
        entries.retain(|e| e.tx_id <= watermark);
        entries.sort_by(|a, b| b.tx_id.cmp(&a.tx_id));

        for entry in &entries {
            entry.wrapper.wait_until_resolved();
            if entry.wrapper.state() == TxState::Reverted {
                continue;
            }
            if entry.key != key {
                continue;
            }
            return Ok(self.resolve_value(entry.address));
        }

        Ok(self.fallback.lookup(key.as_bytes()))
    }

    fn resolve_value(&self, address: u64) -> Option<Vec<u8>> {
        match &*self.log.get(address) {
            OperationLogRecord::Write { op_type, value, .. } => match op_type {
                OpType::Put => Some(value.clone()),
                OpType::Remove => None,
            },
            OperationLogRecord::Completion { .. } => {
                unreachable!("a staged write's address never points at a completion record")
            }
        }
    }

    /// Commit a write transaction: insert its staged operations into each
    /// touched record's version chain, failing the whole transaction if any
    /// record's watermark has already advanced past this transaction's
    /// snapshot (a reader observed the record after this transaction's
    /// snapshot was taken but before it committed).
    ///
    /// A no-op for read-only transactions or write transactions with no
    /// staged operations.
    ///
    /// # Errors
    /// Returns [`VamanaError::WriteConflict`] if a touched record's
    /// watermark already exceeds `tx.snapshot_id`.
    pub fn commit(&self, tx: Transaction) -> Result<()> {
        if tx.kind != TxKind::Write {
            return Ok(());
        }
        if tx.operations.is_empty() {
            // No record touched this transaction's id, but it was already
            // registered as in-progress in the GC map at
            // `start_write_transaction`; resolve it so an empty write
            // transaction doesn't permanently block the GC prefix.
            self.gc.record(tx.snapshot_id, GcState::Committed);
            return Ok(());
        }

        let wrapper = TransactionStateWrapper::new(tx.operations.len());

        for op in &tx.operations {
            let record = self.ensure_record(op.key_hash);
            record.push(OperationReferenceEntry {
                operation_address: op.address,
                tx_id: tx.snapshot_id,
                key: op.key.clone(),
                wrapper: Arc::clone(&wrapper),
            });

            if tx.snapshot_id < record.max_transaction_id() {
                wrapper.resolve(TxState::Reverted);
                self.log.append(OperationLogRecord::Completion { aborted: true });
                self.gc.record(tx.snapshot_id, GcState::Reverted);
                return Err(VamanaError::WriteConflict {
                    txn_id: tx.snapshot_id,
                    reason: format!(
                        "record for key hash {} observed by a snapshot newer than this transaction",
                        op.key_hash
                    ),
                });
            }
            // Per §3's commit-completion invariant, every record this
            // transaction touched must carry a watermark at least as high
            // as its own snapshot id once it commits — otherwise an
            // earlier-snapshot writer arriving later would see a stale
            // `max_transaction_id` and wrongly believe it hadn't lost the
            // race yet.
            record.bump_max_transaction_id(tx.snapshot_id);
        }

        let mut current = self.global_snapshot_id.load(Ordering::Acquire);
        while current < tx.snapshot_id {
            match self.global_snapshot_id.compare_exchange_weak(
                current,
                tx.snapshot_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        wrapper.resolve(TxState::Committed);
        self.log.append(OperationLogRecord::Completion { aborted: false });
        self.gc.record(tx.snapshot_id, GcState::Committed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_read_commit_round_trip() {
        let store = MvccStore::new();
        let mut t1 = store.start_write_transaction();
        store.put(&mut t1, "k", b"v1".to_vec()).unwrap();
        store.commit(t1).unwrap();

        let t2 = store.start_read_transaction();
        let value = store.read(&t2, "k").unwrap();
        assert_eq!(value, Some(b"v1".to_vec()));
    }

    #[test]
    fn remove_resolves_to_none_not_a_fallback_lookup() {
        let store = MvccStore::new();
        let mut t1 = store.start_write_transaction();
        store.put(&mut t1, "k", b"v1".to_vec()).unwrap();
        store.commit(t1).unwrap();

        let mut t2 = store.start_write_transaction();
        store.remove(&mut t2, "k").unwrap();
        store.commit(t2).unwrap();

        let t3 = store.start_read_transaction();
        assert_eq!(store.read(&t3, "k").unwrap(), None);
    }

    #[test]
    fn unwritten_key_falls_back() {
        struct AlwaysFive;
        impl Fallback for AlwaysFive {
            fn lookup(&self, _key: &[u8]) -> Option<Vec<u8>> {
                Some(vec![5])
            }
        }
        let store = MvccStore::with_fallback(AlwaysFive);
        let t1 = store.start_read_transaction();
        assert_eq!(store.read(&t1, "missing").unwrap(), Some(vec![5]));
    }

    #[test]
    fn earlier_snapshot_writer_loses_to_a_reader_that_already_observed_the_record() {
        let store = MvccStore::new();
        let mut t1 = store.start_write_transaction();
        let mut t2 = store.start_write_transaction();
        assert!(t1.snapshot_id() < t2.snapshot_id());

        store.put(&mut t2, "k", b"v2".to_vec()).unwrap();
        store.commit(t2).unwrap();

        store.put(&mut t1, "k", b"v1".to_vec()).unwrap();
        let err = store.commit(t1).unwrap_err();
        assert!(matches!(err, VamanaError::WriteConflict { .. }));
    }

    #[test]
    fn reverted_write_is_never_observed() {
        let store = MvccStore::new();
        let mut loser = store.start_write_transaction();
        let mut winner = store.start_write_transaction();

        store.put(&mut winner, "k", b"winner".to_vec()).unwrap();
        store.commit(winner).unwrap();

        store.put(&mut loser, "k", b"loser".to_vec()).unwrap();
        assert!(store.commit(loser).is_err());

        let t = store.start_read_transaction();
        assert_eq!(store.read(&t, "k").unwrap(), Some(b"winner".to_vec()));
    }

    #[test]
    fn read_only_transaction_cannot_stage_writes() {
        let store = MvccStore::new();
        let mut t = store.start_read_transaction();
        assert!(store.put(&mut t, "k", vec![1]).is_err());
    }

    #[test]
    fn start_write_transaction_increments_snapshot_id_by_exactly_one() {
        let store = MvccStore::new();
        let t1 = store.start_write_transaction();
        let t2 = store.start_write_transaction();
        assert_eq!(t2.snapshot_id(), t1.snapshot_id() + 1);
    }

    #[test]
    fn commit_with_no_operations_is_a_no_op() {
        let store = MvccStore::new();
        let t = store.start_write_transaction();
        assert!(store.commit(t).is_ok());
    }
}
