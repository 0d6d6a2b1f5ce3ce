//! Triple index - multi-indexed store of changes.
//!
//! The index stores cumulative counts per `(e, a, v, n)` per round and
//! answers four questions: does a triple hold at a round (`check`),
//! which unbound field is cheapest to enumerate (`propose`), what are
//! the candidates for that field (`resolve`), and at which rounds did a
//! triple's net count cross zero (`get_diffs`).
//!
//! Rounds are scoped to a transaction. When a leaf is touched by a
//! later transaction its history folds to a single round-0 total, which
//! is also how reads from a later transaction interpret it.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::change::{add_counts, Change, Count};
use crate::value::Id;

/// Per-round delta counts for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundCounts(SmallVec<[Count; 4]>);

impl RoundCounts {
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    pub fn add(&mut self, round: u32, count: Count) {
        let ix = round as usize;
        if self.0.len() <= ix {
            self.0.resize(ix + 1, 0);
        }
        self.0[ix] = add_counts(self.0[ix], count);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn get(&self, round: u32) -> Count {
        self.0.get(round as usize).copied().unwrap_or(0)
    }

    /// Net count over rounds `0..=round`.
    pub fn net_through(&self, round: u32) -> Count {
        self.0
            .iter()
            .take((round as usize).saturating_add(1))
            .fold(0, |acc, &c| add_counts(acc, c))
    }

    pub fn net_total(&self) -> Count {
        self.0.iter().fold(0, |acc, &c| add_counts(acc, c))
    }

    pub fn present_at(&self, round: u32) -> bool {
        self.net_through(round) > 0
    }

    /// Rounds at which the net count crossed between zero and nonzero,
    /// as signed `round + 1` entries: positive for a zero-to-positive
    /// crossing, negative for the way back.
    pub fn transitions(&self) -> SmallVec<[i32; 4]> {
        let mut out = SmallVec::new();
        let mut running: Count = 0;
        let mut was_present = false;
        for (ix, &c) in self.0.iter().enumerate() {
            running = add_counts(running, c);
            let present = running > 0;
            if present != was_present {
                let entry = ix as i32 + 1;
                out.push(if present { entry } else { -entry });
                was_present = present;
            }
        }
        out
    }

    /// The delta encoding of the presence function: `(round, +1)` where
    /// the key becomes present, `(round, -1)` where it stops.
    pub fn presence_deltas(&self) -> SmallVec<[(u32, Count); 4]> {
        self.transitions()
            .into_iter()
            .map(|t| ((t.unsigned_abs() - 1), if t > 0 { 1 } else { -1 }))
            .collect()
    }
}

/// The per-round difference between two presence delta encodings.
/// Both inputs are ascending in round.
pub fn encoding_diff(
    old: &[(u32, Count)],
    new: &[(u32, Count)],
) -> SmallVec<[(u32, Count); 4]> {
    let mut out: SmallVec<[(u32, Count); 4]> = SmallVec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        let or = old.get(i).map(|&(r, _)| r);
        let nr = new.get(j).map(|&(r, _)| r);
        let (round, delta) = match (or, nr) {
            (Some(a), Some(b)) if a == b => {
                let d = new[j].1 - old[i].1;
                i += 1;
                j += 1;
                (a, d)
            }
            (Some(a), Some(b)) if a < b => {
                let d = -old[i].1;
                i += 1;
                (a, d)
            }
            (Some(_), Some(b)) => {
                let d = new[j].1;
                j += 1;
                (b, d)
            }
            (Some(a), None) => {
                let d = -old[i].1;
                i += 1;
                (a, d)
            }
            (None, Some(b)) => {
                let d = new[j].1;
                j += 1;
                (b, d)
            }
            (None, None) => break,
        };
        if delta != 0 {
            out.push((round, delta));
        }
    }
    out
}

/// Round counts scoped to the transaction that last touched them.
/// A later transaction sees the old history folded to round 0.
#[derive(Debug, Clone, Default)]
pub struct TxnRounds {
    pub txn: u64,
    pub rounds: RoundCounts,
}

impl TxnRounds {
    pub fn fold_to(&mut self, txn: u64) {
        if txn > self.txn {
            let total = self.rounds.net_total();
            self.rounds.clear();
            if total != 0 {
                self.rounds.add(0, total);
            }
            self.txn = txn;
        }
    }

    pub fn view_net_through(&self, txn: u64, round: u32) -> Count {
        if txn > self.txn {
            self.rounds.net_total()
        } else {
            self.rounds.net_through(round)
        }
    }

    /// Materialize the rounds as seen from `txn`.
    pub fn view_rounds(&self, txn: u64) -> RoundCounts {
        if txn > self.txn {
            let mut out = RoundCounts::new();
            let total = self.rounds.net_total();
            if total != 0 {
                out.add(0, total);
            }
            out
        } else {
            self.rounds.clone()
        }
    }
}

/// Counts for one `(e, a, v)`, split by provenance node.
#[derive(Debug, Default)]
struct Leaf {
    per_n: HashMap<Id, TxnRounds>,
}

impl Leaf {
    fn net(&self, n: Id, txn: u64, round: u32) -> Count {
        let mut total = 0;
        for (&node, entry) in self.per_n.iter() {
            if n.is_some() && node != n {
                continue;
            }
            total = add_counts(total, entry.view_net_through(txn, round));
        }
        total
    }

    /// Rounds merged across matching provenance nodes.
    fn merged_rounds(&self, n: Id, txn: u64) -> RoundCounts {
        let mut out = RoundCounts::new();
        for (&node, entry) in self.per_n.iter() {
            if n.is_some() && node != n {
                continue;
            }
            let view = entry.view_rounds(txn);
            for round in 0..view.len() as u32 {
                let c = view.get(round);
                if c != 0 {
                    out.add(round, c);
                }
            }
        }
        out
    }
}

/// A field of a triple pattern as the index sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternField {
    /// Constrained to a concrete ID.
    Bound(Id),
    /// A register that still needs a value; enumerable.
    Unbound,
    /// Unconstrained; never enumerated.
    Ignore,
}

impl PatternField {
    pub fn bound(self) -> Option<Id> {
        match self {
            PatternField::Bound(id) => Some(id),
            _ => None,
        }
    }
}

/// Which field of a triple a proposal enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripleField {
    E,
    A,
    V,
}

/// The index's offer to enumerate one unbound field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexProposal {
    pub field: TripleField,
    pub cardinality: usize,
    /// True when there is nothing to enumerate: every field is bound
    /// or ignored.
    pub skip: bool,
}

/// Multi-indexed store of changes.
///
/// Three roots cover prefix enumeration and point checks: `eav` (the
/// primary, holding the counted leaves), `aev` (attribute to entity
/// set), and `ave` (attribute to value to entity set). The secondary
/// roots keep every key ever seen; net presence is always re-checked
/// against the leaves.
#[derive(Debug, Default)]
pub struct TripleIndex {
    eav: HashMap<Id, HashMap<Id, HashMap<Id, Leaf>>>,
    aev: HashMap<Id, HashSet<Id>>,
    ave: HashMap<Id, HashMap<Id, HashSet<Id>>>,
}

impl TripleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta. The stored value is the cumulative count per
    /// `(e, a, v, n)` per round.
    pub fn insert(&mut self, change: &Change) {
        let leaf = self
            .eav
            .entry(change.e)
            .or_default()
            .entry(change.a)
            .or_default()
            .entry(change.v)
            .or_default();
        let entry = leaf.per_n.entry(change.n).or_default();
        entry.fold_to(change.transaction);
        entry.rounds.add(change.round, change.count);

        self.aev.entry(change.a).or_default().insert(change.e);
        self.ave
            .entry(change.a)
            .or_default()
            .entry(change.v)
            .or_default()
            .insert(change.e);
    }

    fn leaf(&self, e: Id, a: Id, v: Id) -> Option<&Leaf> {
        self.eav.get(&e)?.get(&a)?.get(&v)
    }

    /// Does a triple matching the pattern hold net-positive at or
    /// before `(txn, round)`? `Id::NONE` in any field is a wildcard.
    pub fn check(&self, e: Id, a: Id, v: Id, n: Id, txn: u64, round: u32) -> bool {
        if e.is_some() {
            let Some(av) = self.eav.get(&e) else {
                return false;
            };
            return self.check_under(av, a, v, n, txn, round);
        }
        if a.is_some() {
            if v.is_some() {
                let Some(es) = self.ave.get(&a).and_then(|vs| vs.get(&v)) else {
                    return false;
                };
                return es
                    .iter()
                    .any(|&e| self.leaf(e, a, v).is_some_and(|l| l.net(n, txn, round) > 0));
            }
            let Some(es) = self.aev.get(&a) else {
                return false;
            };
            return es.iter().any(|&e| {
                self.eav
                    .get(&e)
                    .and_then(|av| av.get(&a))
                    .is_some_and(|vs| {
                        vs.iter()
                            .any(|(&v2, leaf)| v.matches_wild(v2) && leaf.net(n, txn, round) > 0)
                    })
            });
        }
        // Entity and attribute both wild: walk the primary root.
        self.eav
            .values()
            .any(|av| self.check_under(av, a, v, n, txn, round))
    }

    fn check_under(
        &self,
        av: &HashMap<Id, HashMap<Id, Leaf>>,
        a: Id,
        v: Id,
        n: Id,
        txn: u64,
        round: u32,
    ) -> bool {
        if a.is_some() {
            let Some(vs) = av.get(&a) else { return false };
            return vs
                .iter()
                .any(|(&v2, leaf)| v.matches_wild(v2) && leaf.net(n, txn, round) > 0);
        }
        av.values().any(|vs| {
            vs.iter()
                .any(|(&v2, leaf)| v.matches_wild(v2) && leaf.net(n, txn, round) > 0)
        })
    }

    fn entity_cardinality(&self, a: PatternField, v: PatternField) -> usize {
        use PatternField::*;
        match (a, v) {
            (Bound(a), Bound(v)) => self
                .ave
                .get(&a)
                .and_then(|vs| vs.get(&v))
                .map_or(0, |es| es.len()),
            (Bound(a), _) => self.aev.get(&a).map_or(0, |es| es.len()),
            _ => self.eav.len(),
        }
    }

    fn attribute_cardinality(&self, e: PatternField) -> usize {
        use PatternField::*;
        match e {
            Bound(e) => self.eav.get(&e).map_or(0, |av| av.len()),
            _ => self.aev.len(),
        }
    }

    fn value_cardinality(&self, e: PatternField, a: PatternField) -> usize {
        use PatternField::*;
        match (e, a) {
            (Bound(e), Bound(a)) => self
                .eav
                .get(&e)
                .and_then(|av| av.get(&a))
                .map_or(0, |vs| vs.len()),
            (Bound(e), _) => self
                .eav
                .get(&e)
                .map_or(0, |av| av.values().map(|vs| vs.len()).sum()),
            (_, Bound(a)) => self.ave.get(&a).map_or(0, |vs| vs.len()),
            _ => self.ave.values().map(|vs| vs.len()).sum(),
        }
    }

    /// Offer the cheapest unbound field to enumerate: every unbound
    /// field's cardinality is estimated and the minimum wins. Ties keep
    /// entity-attribute-value order.
    pub fn propose(&self, e: PatternField, a: PatternField, v: PatternField) -> IndexProposal {
        let mut best: Option<IndexProposal> = None;
        let mut consider = |field: TripleField, cardinality: usize| {
            let better = match &best {
                None => true,
                Some(current) => cardinality < current.cardinality,
            };
            if better {
                best = Some(IndexProposal {
                    field,
                    cardinality,
                    skip: false,
                });
            }
        };
        if matches!(e, PatternField::Unbound) {
            consider(TripleField::E, self.entity_cardinality(a, v));
        }
        if matches!(a, PatternField::Unbound) {
            consider(TripleField::A, self.attribute_cardinality(e));
        }
        if matches!(v, PatternField::Unbound) {
            consider(TripleField::V, self.value_cardinality(e, a));
        }
        best.unwrap_or(IndexProposal {
            field: TripleField::E,
            cardinality: 0,
            skip: true,
        })
    }

    /// Enumerate the candidate IDs for a proposed field under the given
    /// bindings. Candidates are raw keys; net presence is re-checked by
    /// `accept` downstream.
    pub fn resolve(
        &self,
        e: PatternField,
        a: PatternField,
        v: PatternField,
        field: TripleField,
    ) -> Vec<Id> {
        use PatternField::*;
        match field {
            TripleField::E => match (a, v) {
                (Bound(a), Bound(v)) => self
                    .ave
                    .get(&a)
                    .and_then(|vs| vs.get(&v))
                    .map_or_else(Vec::new, |es| es.iter().copied().collect()),
                (Bound(a), _) => self
                    .aev
                    .get(&a)
                    .map_or_else(Vec::new, |es| es.iter().copied().collect()),
                _ => self.eav.keys().copied().collect(),
            },
            TripleField::A => match e {
                Bound(e) => self
                    .eav
                    .get(&e)
                    .map_or_else(Vec::new, |av| av.keys().copied().collect()),
                _ => self.aev.keys().copied().collect(),
            },
            TripleField::V => match (e, a) {
                (Bound(e), Bound(a)) => self
                    .eav
                    .get(&e)
                    .and_then(|av| av.get(&a))
                    .map_or_else(Vec::new, |vs| vs.keys().copied().collect()),
                (Bound(e), _) => {
                    let mut seen: HashSet<Id> = HashSet::new();
                    if let Some(av) = self.eav.get(&e) {
                        for vs in av.values() {
                            seen.extend(vs.keys().copied());
                        }
                    }
                    seen.into_iter().collect()
                }
                (_, Bound(a)) => self
                    .ave
                    .get(&a)
                    .map_or_else(Vec::new, |vs| vs.keys().copied().collect()),
                _ => {
                    let mut seen: HashSet<Id> = HashSet::new();
                    for vs in self.ave.values() {
                        seen.extend(vs.keys().copied());
                    }
                    seen.into_iter().collect()
                }
            },
        }
    }

    /// The rounds at which `(e, a, v)`'s net count crossed between zero
    /// and nonzero, signed. `n == Id::NONE` merges across provenance.
    pub fn get_diffs(&self, e: Id, a: Id, v: Id, n: Id, txn: u64) -> SmallVec<[i32; 4]> {
        match self.leaf(e, a, v) {
            Some(leaf) => leaf.merged_rounds(n, txn).transitions(),
            None => SmallVec::new(),
        }
    }

    /// All values net-present under `(e, a)` for the given provenance.
    pub fn values_under(&self, e: Id, a: Id, n: Id, txn: u64, round: u32) -> Vec<Id> {
        let Some(vs) = self.eav.get(&e).and_then(|av| av.get(&a)) else {
            return Vec::new();
        };
        vs.iter()
            .filter(|(_, leaf)| leaf.net(n, txn, round) > 0)
            .map(|(&v, _)| v)
            .collect()
    }

    /// All `(a, v)` net-present under `e` for the given provenance.
    pub fn attrs_under(&self, e: Id, n: Id, txn: u64, round: u32) -> Vec<(Id, Id)> {
        let Some(av) = self.eav.get(&e) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (&a, vs) in av.iter() {
            for (&v, leaf) in vs.iter() {
                if leaf.net(n, txn, round) > 0 {
                    out.push((a, v));
                }
            }
        }
        out
    }

    /// Every `(e, a, v)` net-positive at `(txn, round)`, summed across
    /// provenance. Primarily for inspection and tests.
    pub fn facts(&self, txn: u64, round: u32) -> Vec<(Id, Id, Id)> {
        let mut out = Vec::new();
        for (&e, av) in self.eav.iter() {
            for (&a, vs) in av.iter() {
                for (&v, leaf) in vs.iter() {
                    if leaf.net(Id::NONE, txn, round) > 0 {
                        out.push((e, a, v));
                    }
                }
            }
        }
        out
    }
}

trait MatchesWild {
    fn matches_wild(self, other: Id) -> bool;
}

impl MatchesWild for Id {
    fn matches_wild(self, other: Id) -> bool {
        self.is_none() || self == other
    }
}
