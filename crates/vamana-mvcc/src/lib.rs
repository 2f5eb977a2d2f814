//! Lock-friendly MVCC operation log: a versioned hash-indexed store mapping
//! key-hash to an ordered queue of operation references, with
//! snapshot-isolated reads, atomic commit-or-rollback on write-write
//! conflict, and a garbage collector that reclaims resolved transaction
//! state behind the oldest live snapshot.
//!
//! - [`store::MvccStore`]: `start_read_transaction` / `start_write_transaction`,
//!   `put` / `remove` / `read` / `commit`.
//! - [`gc::GarbageCollector`]: `find_max_min_id`, `find_missing_or_active_transaction_ids`,
//!   `remove_transactions_range`.
//! - [`key::Key`]: the flat byte-string key type, hashed with a fixed-seed
//!   xxhash64 instance.
//!
//! No durability: this crate models in-memory MVCC semantics only, as a
//! non-goal of operation-log durability across process crashes. A real
//! deployment would sit this on top of a write-ahead log the concurrency
//! layer replays on recovery; that layer is out of scope here.

#![warn(missing_docs)]

pub mod gc;
pub mod key;
pub mod log;
pub mod record;
pub mod store;
pub mod transaction;
pub mod wrapper;

pub use gc::{GarbageCollector, GcState, TransactionGcEntry};
pub use key::Key;
pub use log::{OpType, OperationLog, OperationLogRecord};
pub use record::{MVCCRecord, OperationReferenceEntry};
pub use store::MvccStore;
pub use transaction::{Transaction, TxKind};
pub use wrapper::{TransactionStateWrapper, TxState, LATCH_SPIN_THRESHOLD};

// Re-exported for convenience so callers don't need a direct `vamana-core`
// dependency just to supply a fallback store.
pub use vamana_core::{Fallback, NoFallback};
