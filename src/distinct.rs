//! Distinct index - set semantics over a bag-delta stream.
//!
//! Derived changes arrive with arbitrary signed multiplicities; rules
//! are meant to have set semantics. The distinct index tracks, per
//! `(e, a, v, n)` and per round, the running count, and emits `+1` on
//! the round where the running count first turns positive and `-1`
//! where it returns to zero. Duplicate derivations therefore never
//! amplify, and a retraction lands exactly on the round where the fact
//! first appeared.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::change::{Change, Count};
use crate::index::{encoding_diff, TxnRounds};
use crate::value::Id;

type Key = (Id, Id, Id, Id);

#[derive(Debug, Default)]
pub struct DistinctIndex {
    entries: HashMap<Key, TxnRounds>,
}

impl DistinctIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a bag change into the index and report the set-semantic
    /// deltas it causes: the difference between the old and new delta
    /// encodings of the key's presence function.
    pub fn distinct(&mut self, change: &Change) -> SmallVec<[(u32, Count); 4]> {
        let entry = self.entries.entry(change.key()).or_default();
        entry.fold_to(change.transaction);
        let old = entry.rounds.presence_deltas();
        entry.rounds.add(change.round, change.count);
        let new = entry.rounds.presence_deltas();
        encoding_diff(&old, &new)
    }

    /// The net presence of a key at a round, after distinct reduction.
    pub fn present(&self, key: Key, txn: u64, round: u32) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| entry.view_net_through(txn, round) > 0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> Id {
        Id::from_raw(raw)
    }

    fn change(round: u32, count: Count) -> Change {
        Change::new(id(1), id(2), id(3), id(9), 1, round, count)
    }

    #[test]
    fn first_appearance_emits_plus_one() {
        let mut distinct = DistinctIndex::new();
        let out = distinct.distinct(&change(0, 3));
        assert_eq!(out.as_slice(), &[(0, 1)], "bag count 3 is set count 1");
    }

    #[test]
    fn resend_emits_nothing() {
        let mut distinct = DistinctIndex::new();
        distinct.distinct(&change(0, 1));
        let out = distinct.distinct(&change(0, 1));
        assert!(
            out.is_empty(),
            "an identical change after net-positive must be silent"
        );
    }

    #[test]
    fn retraction_lands_on_first_round() {
        let mut distinct = DistinctIndex::new();
        distinct.distinct(&change(1, 1));
        distinct.distinct(&change(3, 1));
        // Net count drops to zero only when both supports go.
        let out = distinct.distinct(&change(1, -1));
        assert!(out.is_empty(), "one of two supports gone: still present");
        let out = distinct.distinct(&change(3, -1));
        assert_eq!(out.as_slice(), &[(1, -1)]);
    }

    #[test]
    fn earlier_support_moves_the_appearance_round() {
        let mut distinct = DistinctIndex::new();
        distinct.distinct(&change(2, 1));
        let out = distinct.distinct(&change(0, 1));
        assert_eq!(
            out.as_slice(),
            &[(0, 1), (2, -1)],
            "support at an earlier round moves the +1 backwards"
        );
    }

    #[test]
    fn negative_first_suppresses_until_positive() {
        let mut distinct = DistinctIndex::new();
        let out = distinct.distinct(&change(0, -1));
        assert!(out.is_empty(), "negative running counts emit nothing");
        let out = distinct.distinct(&change(0, 1));
        assert!(out.is_empty(), "back to zero: still nothing");
        let out = distinct.distinct(&change(0, 1));
        assert_eq!(out.as_slice(), &[(0, 1)]);
    }

    #[test]
    fn keys_roll_forward_between_transactions() {
        let mut distinct = DistinctIndex::new();
        distinct.distinct(&Change::new(id(1), id(2), id(3), id(9), 1, 5, 1));
        // In transaction 2 the presence has folded to round 0.
        let out = distinct.distinct(&Change::new(id(1), id(2), id(3), id(9), 2, 0, 1));
        assert!(out.is_empty(), "fact already present from the prior txn");
        let out = distinct.distinct(&Change::new(id(1), id(2), id(3), id(9), 2, 0, -2));
        assert_eq!(out.as_slice(), &[(0, -1)]);
    }
}
