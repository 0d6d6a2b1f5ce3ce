//! Binary join and antijoin - keyed two-sided operators.
//!
//! Both sides of a binary join keep a keyed index of prefixes with
//! per-round counts. A left delta joins the right index as it stood
//! before this input, then right deltas join the updated left index,
//! so each pair is counted exactly once. The antijoin keeps only
//! per-round count sums on its right side and emits a left prefix for
//! the rounds on which the right key is absent; right-side presence
//! transitions retroactively correct everything the left has produced.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::change::{add_counts, mul_counts, Input};
use crate::index::{encoding_diff, RoundCounts, TxnRounds};
use crate::node::Node;
use crate::output::OutputBatch;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{BlockInfo, EvalContext, EvalError};
use crate::value::Id;

/// The hashable key of a prefix under a register tuple.
pub(crate) type JoinKey = SmallVec<[Id; 4]>;

pub(crate) fn join_key(prefix: &Prefix, regs: &[usize]) -> JoinKey {
    regs.iter().map(|&reg| prefix.get(reg)).collect()
}

/// A prefix stored in a keyed index, tagged with the transaction that
/// produced it. Rounds from earlier transactions read as round 0.
#[derive(Debug, Clone)]
pub(crate) struct StoredPrefix {
    pub txn: u64,
    pub prefix: Prefix,
}

impl StoredPrefix {
    pub fn effective_round(&self, current_txn: u64) -> u32 {
        if self.txn == current_txn {
            self.prefix.round
        } else {
            0
        }
    }
}

/// Key to list-of-prefixes, consolidating identical bindings at the
/// same effective round.
#[derive(Debug, Default)]
pub(crate) struct KeyedPrefixes {
    map: FxHashMap<JoinKey, Vec<StoredPrefix>>,
}

impl KeyedPrefixes {
    pub fn insert(&mut self, txn: u64, key: JoinKey, prefix: &Prefix) {
        let entries = self.map.entry(key).or_default();
        let position = entries.iter().position(|stored| {
            stored.prefix.slots() == prefix.slots() && stored.effective_round(txn) == prefix.round
        });
        if let Some(pos) = position {
            entries[pos].prefix.count = add_counts(entries[pos].prefix.count, prefix.count);
            if entries[pos].prefix.count == 0 {
                entries.swap_remove(pos);
            }
            return;
        }
        entries.push(StoredPrefix {
            txn,
            prefix: prefix.clone(),
        });
    }

    pub fn get(&self, key: &JoinKey) -> &[StoredPrefix] {
        self.map.get(key).map_or(&[], |v| v.as_slice())
    }
}

/// Merge the right prefix's designated registers into a copy of the
/// left. Fails when a merge register disagrees across the sides.
fn merge(left: &Prefix, right: &Prefix, merge_regs: &[usize]) -> Option<Prefix> {
    let mut out = left.clone();
    for &reg in merge_regs {
        let value = right.get(reg);
        if value.is_none() {
            continue;
        }
        let current = out.get(reg);
        if current.is_some() {
            if current != value {
                return None;
            }
        } else {
            out.set(reg, value);
        }
    }
    Some(out)
}

/// Right-indexed binary join. The right side is a sub-flow executed
/// once per input; the left side is the incoming prefix stream.
#[derive(Debug)]
pub struct BinaryJoin {
    pub right: Box<Node>,
    pub key_regs: SmallVec<[usize; 4]>,
    /// Registers the right side contributes to merged output.
    pub merge_regs: SmallVec<[usize; 4]>,
    left_index: KeyedPrefixes,
    right_index: KeyedPrefixes,
}

impl BinaryJoin {
    pub fn new(right: Node, key_regs: &[usize], merge_regs: &[usize]) -> Self {
        Self {
            right: Box::new(right),
            key_regs: key_regs.iter().copied().collect(),
            merge_regs: merge_regs.iter().copied().collect(),
            left_index: KeyedPrefixes::default(),
            right_index: KeyedPrefixes::default(),
        }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        input: &Input,
        left: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        // The right sub-flow starts from a fresh prefix each input.
        let unit = ResultBuffer::unit(Prefix::empty(
            block.registers,
            input.round(),
            input.count(),
        ));
        let mut right_out = ResultBuffer::new();
        self.right.exec(ctx, block, input, &unit, &mut right_out, ops)?;

        let txn = ctx.transaction;
        // Left deltas against the right index as it stood before this
        // input; then right deltas against the updated left index.
        for prefix in left.iter() {
            let key = join_key(prefix, &self.key_regs);
            self.left_index.insert(txn, key.clone(), prefix);
            for stored in self.right_index.get(&key) {
                if let Some(mut merged) = merge(prefix, &stored.prefix, &self.merge_regs) {
                    merged.round = prefix.round.max(stored.effective_round(txn));
                    merged.count = mul_counts(prefix.count, stored.prefix.count);
                    if merged.count != 0 {
                        out.push(merged);
                    }
                }
            }
        }
        for prefix in right_out.iter() {
            let key = join_key(prefix, &self.key_regs);
            self.right_index.insert(txn, key.clone(), prefix);
            for stored in self.left_index.get(&key) {
                if let Some(mut merged) = merge(&stored.prefix, prefix, &self.merge_regs) {
                    merged.round = prefix.round.max(stored.effective_round(txn));
                    merged.count = mul_counts(prefix.count, stored.prefix.count);
                    if merged.count != 0 {
                        out.push(merged);
                    }
                }
            }
        }
        Ok(())
    }

    /// Forward outer-scope deltas into the right sub-flow.
    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        self.right.feed_outer_scope(ctx, outer);
    }
}

/// The stateful half of an antijoin, shared by the node form and the
/// presolved-right form used inside a choose.
#[derive(Debug, Default)]
pub struct AntiJoinState {
    pub key_regs: SmallVec<[usize; 4]>,
    left_index: KeyedPrefixes,
    right_counts: FxHashMap<JoinKey, TxnRounds>,
}

impl AntiJoinState {
    pub fn new(key_regs: &[usize]) -> Self {
        Self {
            key_regs: key_regs.iter().copied().collect(),
            left_index: KeyedPrefixes::default(),
            right_counts: FxHashMap::default(),
        }
    }

    fn right_rounds(&self, key: &JoinKey, txn: u64) -> RoundCounts {
        self.right_counts
            .get(key)
            .map(|entry| entry.view_rounds(txn))
            .unwrap_or_default()
    }

    /// A left prefix: emit it wherever the right key is absent, and an
    /// alternating correction for every later right transition.
    pub fn push_left(&mut self, txn: u64, prefix: &Prefix, out: &mut ResultBuffer) {
        let key = join_key(prefix, &self.key_regs);
        let rounds = self.right_rounds(&key, txn);
        if !rounds.present_at(prefix.round) {
            out.push(prefix.clone());
        }
        for (t, s) in rounds.presence_deltas() {
            if t > prefix.round {
                let count = mul_counts(prefix.count, -s);
                if count != 0 {
                    out.push(prefix.with_round_count(t, count));
                }
            }
        }
        self.left_index.insert(txn, key, prefix);
    }

    /// A right prefix: fold it in and retroactively negate (or revive)
    /// every matching left prefix at the rounds where right presence
    /// flipped.
    pub fn push_right(&mut self, txn: u64, prefix: &Prefix, out: &mut ResultBuffer) {
        let key = join_key(prefix, &self.key_regs);
        let entry = self.right_counts.entry(key.clone()).or_default();
        entry.fold_to(txn);
        let old = entry.rounds.presence_deltas();
        entry.rounds.add(prefix.round, prefix.count);
        let new = entry.rounds.presence_deltas();
        let flips = encoding_diff(&old, &new);
        for (t, s) in flips {
            for stored in self.left_index.get(&key) {
                let left_round = stored.effective_round(txn);
                let count = mul_counts(stored.prefix.count, -s);
                if count != 0 {
                    out.push(stored.prefix.with_round_count(t.max(left_round), count));
                }
            }
        }
    }
}

/// Antijoin with its right side as a sub-flow.
#[derive(Debug)]
pub struct AntiJoin {
    pub right: Box<Node>,
    pub state: AntiJoinState,
}

impl AntiJoin {
    pub fn new(right: Node, key_regs: &[usize]) -> Self {
        Self {
            right: Box::new(right),
            state: AntiJoinState::new(key_regs),
        }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        input: &Input,
        left: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        let unit = ResultBuffer::unit(Prefix::empty(
            block.registers,
            input.round(),
            input.count(),
        ));
        let mut right_out = ResultBuffer::new();
        self.right.exec(ctx, block, input, &unit, &mut right_out, ops)?;

        let txn = ctx.transaction;
        for prefix in left.iter() {
            self.state.push_left(txn, prefix, out);
        }
        for prefix in right_out.iter() {
            self.state.push_right(txn, prefix, out);
        }
        Ok(())
    }

    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        self.right.feed_outer_scope(ctx, outer);
    }
}

#[cfg(test)]
#[path = "tests/flow.rs"]
mod tests;
