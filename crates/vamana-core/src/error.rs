//! Error types shared across the index and the operation log.
//!
//! We use `thiserror` for automatic `Display`/`Error` impls, the same as the
//! rest of this lineage's crates.
//!
//! ## Error kinds
//!
//! - **Invariant violation**: a programming error (double-acquiring a vertex
//!   lock, releasing an unheld one, GC asked to resolve a snapshot below its
//!   own watermark). Fatal, never retried.
//! - **Write conflict**: an MVCC commit lost to a later reader's snapshot
//!   observation. Surfaced to the caller, who may retry with a fresh
//!   transaction.
//! - **Config error**: a `VamanaParams`/PQ construction invariant failed
//!   (e.g. `pqCompression` doesn't divide the vector size).
//! - **Interrupted**: a latch wait was interrupted while resolving an
//!   MVCC read. The core defines no recovery for this.
//! - **Lookup miss**: distinguishes a `REMOVE` tombstone from a genuinely
//!   absent key; callers disambiguate via the B-tree fallback collaborator.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VamanaError>;

/// Unified error type for the ANN index and the MVCC operation log.
#[derive(Debug, Error)]
pub enum VamanaError {
    /// A programming invariant was violated (double lock acquire, GC
    /// watermark ordering violation, and similar).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An MVCC commit detected a later reader's snapshot observation on one
    /// of the records it touched.
    #[error("write conflict on transaction {txn_id}: {reason}")]
    WriteConflict {
        /// The transaction that lost the race.
        txn_id: u64,
        /// Human-readable description of the losing record.
        reason: String,
    },

    /// A construction-time parameter was invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A latch wait inside `read` was interrupted.
    #[error("interrupted while waiting on transaction state")]
    Interrupted,

    /// Low-level I/O failure (on-disk graph read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk layout did not match the expected page/record format.
    #[error("corrupt on-disk layout: {0}")]
    Corruption(String),
}

impl VamanaError {
    /// A write conflict that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VamanaError::WriteConflict { .. })
    }

    /// A fatal programming error that should never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VamanaError::InvariantViolation(_) | VamanaError::Corruption(_)
        )
    }
}
