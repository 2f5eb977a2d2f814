//! Garbage collection over resolved transactions: find the longest
//! contiguous prefix of committed/reverted transactions behind the oldest
//! live snapshot, and reclaim it.
//!
//! The GC map coalesces reclaimed runs into `[key, upToId]` ranges so a
//! long-lived store doesn't carry one entry per transaction forever — once
//! a prefix is known resolved, neighboring resolved entries fold into a
//! single range rather than staying as separate map entries.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use vamana_core::{Result, VamanaError};

/// Outcome of a transaction as tracked by the GC map. Distinct from
/// [`crate::wrapper::TxState`]: this is the GC's own bookkeeping, populated
/// once a transaction's wrapper has resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// Committed and visible.
    Committed,
    /// Rolled back.
    Reverted,
    /// Not yet resolved; blocks any contiguous prefix from extending past it.
    InProgress,
}

/// One entry in the GC map: `key`'s resolution state, plus `up_to_id`
/// describing a coalesced range `[key, up_to_id]` of previously-merged
/// transactions sharing that outcome.
#[derive(Debug, Clone, Copy)]
pub struct TransactionGcEntry {
    /// This entry's resolution state.
    pub state: GcState,
    /// The last transaction id folded into this entry's range (`== key`
    /// for an entry that hasn't been coalesced with anything yet).
    pub up_to_id: u64,
}

impl TransactionGcEntry {
    /// A fresh, uncoalesced entry for a single transaction id.
    pub fn singleton(id: u64, state: GcState) -> Self {
        TransactionGcEntry {
            state,
            up_to_id: id,
        }
    }
}

/// The sorted transaction-outcome map the GC walks, plus the operations
/// that find and reclaim its resolved prefix.
#[derive(Debug, Default)]
pub struct GarbageCollector {
    transactions_gc_map: Mutex<BTreeMap<u64, TransactionGcEntry>>,
}

impl GarbageCollector {
    /// An empty GC map.
    pub fn new() -> Self {
        GarbageCollector {
            transactions_gc_map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a transaction's terminal outcome.
    pub fn record(&self, id: u64, state: GcState) {
        self.transactions_gc_map
            .lock()
            .insert(id, TransactionGcEntry::singleton(id, state));
    }

    /// Read-only snapshot of the current GC map, for tests and callers that
    /// want to inspect coalescing without mutating it.
    pub fn snapshot(&self) -> BTreeMap<u64, TransactionGcEntry> {
        self.transactions_gc_map.lock().clone()
    }

    /// Walk `transactionsGCMap.headMap(min(snapshotId, lastKey), inclusive)`
    /// in ascending order, tracking the longest contiguous prefix of
    /// `COMMITTED`/`REVERTED` entries where each key is either the successor
    /// of the previous entry's id or within the previous entry's
    /// `up_to_id` range. Returns the largest such key, or `None` if the
    /// map is empty or its first entry isn't resolved.
    pub fn find_max_min_id(&self, snapshot_id: u64) -> Option<u64> {
        let map = self.transactions_gc_map.lock();
        let Some((&last_key, _)) = map.iter().next_back() else {
            return None;
        };
        let bound = snapshot_id.min(last_key);

        let mut max_min_id: Option<u64> = None;
        let mut expected_next = None;

        for (&id, entry) in map.range(..=bound) {
            if entry.state == GcState::InProgress {
                break;
            }
            if let Some(expected) = expected_next {
                if id != expected {
                    break;
                }
            }
            max_min_id = Some(entry.up_to_id);
            expected_next = Some(entry.up_to_id + 1);
        }

        max_min_id
    }

    /// For every transaction id in `(maxMinId, snapshotId)`, report it if it
    /// is absent from the map, `InProgress`, or not contiguous with a
    /// recorded range — i.e. every id that the oldest live reader might
    /// still need but that GC cannot yet prove resolved.
    ///
    /// # Errors
    /// Returns [`VamanaError::InvariantViolation`] if `snapshot_id < max_min_id`.
    pub fn find_missing_or_active_transaction_ids(
        &self,
        max_min_id: u64,
        snapshot_id: u64,
    ) -> Result<Vec<u64>> {
        if snapshot_id < max_min_id {
            return Err(VamanaError::InvariantViolation(format!(
                "GC asked to resolve snapshot {snapshot_id} below its own watermark {max_min_id}"
            )));
        }
        let map = self.transactions_gc_map.lock();
        let mut missing = Vec::new();
        let mut id = max_min_id + 1;
        while id < snapshot_id {
            match resolve_covering_entry(&map, id) {
                Some(entry) if entry.state != GcState::InProgress => {}
                _ => missing.push(id),
            }
            id += 1;
        }
        Ok(missing)
    }

    /// Delete `(start, end]` from the GC map. If `up_to_max_min` is set,
    /// also delete `start` outright (the whole range, including `start`,
    /// has been reclaimed elsewhere). Otherwise coalesce: `start`'s entry
    /// survives with `up_to_id` advanced to `end`.
    ///
    /// # Errors
    /// Returns [`VamanaError::InvariantViolation`] if `start` has no entry
    /// in the map — there is nothing to coalesce or delete.
    pub fn remove_transactions_range(&self, start: u64, end: u64, up_to_max_min: bool) -> Result<()> {
        let mut map = self.transactions_gc_map.lock();
        if !map.contains_key(&start) {
            return Err(VamanaError::InvariantViolation(format!(
                "GC range start {start} has no recorded entry"
            )));
        }
        let keys_to_drop: Vec<u64> = map.range((start + 1)..=end).map(|(&k, _)| k).collect();
        for k in keys_to_drop {
            map.remove(&k);
        }
        if up_to_max_min {
            map.remove(&start);
        } else if let Some(entry) = map.get_mut(&start) {
            entry.up_to_id = end;
        }
        Ok(())
    }
}

fn resolve_covering_entry(
    map: &BTreeMap<u64, TransactionGcEntry>,
    id: u64,
) -> Option<TransactionGcEntry> {
    if let Some(entry) = map.get(&id) {
        return Some(*entry);
    }
    // `id` might fall inside an earlier entry's coalesced [key, up_to_id] range.
    map.range(..id)
        .next_back()
        .map(|(_, entry)| *entry)
        .filter(|entry| entry.up_to_id >= id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn gc_coalescing_stops_at_an_in_progress_gap() {
        let gc = GarbageCollector::new();
        gc.record(1, GcState::Committed);
        gc.record(2, GcState::Committed);
        gc.record(3, GcState::InProgress);
        gc.record(4, GcState::Committed);

        let max_min_id = gc.find_max_min_id(4);
        assert_eq!(max_min_id, Some(2));

        gc.remove_transactions_range(1, 2, false).unwrap();
        let snapshot = gc.snapshot();
        assert_eq!(snapshot.get(&1).unwrap().up_to_id, 2);
        assert!(!snapshot.contains_key(&2));
    }

    #[test]
    fn remove_with_up_to_max_min_deletes_start_too() {
        let gc = GarbageCollector::new();
        gc.record(1, GcState::Committed);
        gc.record(2, GcState::Committed);
        gc.remove_transactions_range(1, 2, true).unwrap();
        let snapshot = gc.snapshot();
        assert!(!snapshot.contains_key(&1));
        assert!(!snapshot.contains_key(&2));
    }

    #[test]
    fn find_missing_reports_in_progress_and_absent_ids() {
        let gc = GarbageCollector::new();
        gc.record(1, GcState::Committed);
        gc.record(3, GcState::InProgress);
        let missing = gc.find_missing_or_active_transaction_ids(0, 5).unwrap();
        assert_eq!(missing, vec![2, 3, 4]);
    }

    #[test]
    fn snapshot_below_max_min_is_an_invariant_violation() {
        let gc = GarbageCollector::new();
        let err = gc.find_missing_or_active_transaction_ids(10, 5).unwrap_err();
        assert!(matches!(err, VamanaError::InvariantViolation(_)));
    }

    #[test]
    fn empty_map_has_no_max_min_id() {
        let gc = GarbageCollector::new();
        assert_eq!(gc.find_max_min_id(100), None);
    }

    #[test]
    fn first_entry_in_progress_blocks_any_prefix() {
        let gc = GarbageCollector::new();
        gc.record(1, GcState::InProgress);
        gc.record(2, GcState::Committed);
        assert_eq!(gc.find_max_min_id(2), None);
    }

    proptest! {
        #[test]
        fn find_max_min_id_never_crosses_the_first_in_progress_entry(
            states in prop::collection::vec(
                prop_oneof![
                    Just(GcState::Committed),
                    Just(GcState::Reverted),
                    Just(GcState::InProgress),
                ],
                1..30,
            ),
        ) {
            let gc = GarbageCollector::new();
            for (i, &state) in states.iter().enumerate() {
                gc.record((i + 1) as u64, state);
            }
            let n = states.len() as u64;

            let mut expected = None;
            for (i, &state) in states.iter().enumerate() {
                if state == GcState::InProgress {
                    break;
                }
                expected = Some((i + 1) as u64);
            }

            prop_assert_eq!(gc.find_max_min_id(n), expected);
        }
    }
}
