//! Generic Join - worst-case-optimal join over a constraint set.
//!
//! For each input change the node enumerates every non-empty subset of
//! the constraints the change structurally matches (a change can match
//! several patterns of one rule), binds those from the change, and
//! solves the remaining registers: each step asks every constraint for
//! a proposal, takes the cheapest, enumerates its candidates, and lets
//! the other constraints accept or reject. Multiplicities compose from
//! the input count and each unapplied scan's round diffs.

use smallvec::SmallVec;

use crate::change::{mul_counts, Change, Count, Input};
use crate::constraint::Constraint;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{EvalContext, EvalError};

/// Cross-product of the input's `(round, count)` with each diff array:
/// the output round is the latest round at which every premise held,
/// the count the product of the crossing signs, consolidated per round.
pub(crate) fn compose_multiplicities(
    input_round: u32,
    input_count: Count,
    diffs: &[SmallVec<[i32; 4]>],
) -> SmallVec<[(u32, Count); 4]> {
    let mut acc: SmallVec<[(u32, Count); 4]> = smallvec::smallvec![(input_round, input_count)];
    for arr in diffs {
        let mut next: SmallVec<[(u32, Count); 4]> = SmallVec::new();
        for &(round, count) in acc.iter() {
            for &d in arr.iter() {
                let out_round = round.max(d.unsigned_abs() - 1);
                let out_count = mul_counts(count, if d > 0 { 1 } else { -1 });
                match next.iter_mut().find(|(r, _)| *r == out_round) {
                    Some((_, c)) => *c += out_count,
                    None => next.push((out_round, out_count)),
                }
            }
        }
        next.retain(|(_, c)| *c != 0);
        if next.is_empty() {
            return next;
        }
        acc = next;
    }
    acc
}

/// Runs Generic Join over a set of constraints sharing the block's
/// register space.
#[derive(Debug)]
pub struct JoinNode {
    pub constraints: Vec<Constraint>,
    /// Union of the constraints' registers.
    registers: SmallVec<[usize; 8]>,
    /// All constraints are moves with static sources: the join computes
    /// a constant and goes dormant after its first successful add.
    is_static: bool,
    dormant: bool,
}

impl JoinNode {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        let mut registers: SmallVec<[usize; 8]> = SmallVec::new();
        for constraint in constraints.iter() {
            for reg in constraint.registers() {
                if !registers.contains(&reg) {
                    registers.push(reg);
                }
            }
        }
        let is_static =
            !constraints.is_empty() && constraints.iter().all(|c| c.is_static_move());
        Self {
            constraints,
            registers,
            is_static,
            dormant: false,
        }
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        match input {
            Input::BlockAdd(_) => {
                if self.is_static && self.dormant {
                    return Ok(());
                }
                let mut produced = false;
                for base in incoming.iter() {
                    let mut prefix = base.clone();
                    produced |= self.solve(ctx, &mut prefix, 0, out)?;
                }
                if self.is_static && produced {
                    self.dormant = true;
                }
                Ok(())
            }
            Input::BlockRemove(_) => {
                for base in incoming.iter() {
                    let mut prefix = base.clone();
                    self.solve(ctx, &mut prefix, 0, out)?;
                }
                // Tearing a block down re-arms its static joins.
                self.dormant = false;
                Ok(())
            }
            Input::Change(change) => {
                for base in incoming.iter() {
                    self.exec_change(ctx, change, base, out)?;
                }
                Ok(())
            }
        }
    }

    fn exec_change(
        &self,
        ctx: &mut EvalContext,
        change: &Change,
        base: &Prefix,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        let affected: SmallVec<[usize; 4]> = self
            .constraints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_affected(change))
            .map(|(ix, _)| ix)
            .collect();

        if affected.is_empty() {
            // No head match. A prefix carrying upstream bindings is a
            // delta in its own right: extend it against the store.
            if base.any_bound() {
                let mut prefix = base.clone();
                self.solve(ctx, &mut prefix, 0, out)?;
            }
            return Ok(());
        }

        let combinations = 1u32 << affected.len();
        'combos: for combo in 1..combinations {
            let mut prefix = base.clone();
            let mut applied: u64 = 0;
            let mut applied_count = 0usize;
            for (bit, &cix) in affected.iter().enumerate() {
                if combo & (1 << bit) != 0 {
                    if !self.constraints[cix].apply_input(change, &mut prefix) {
                        continue 'combos;
                    }
                    applied |= 1 << cix;
                    applied_count += 1;
                }
            }
            // A subset of size k consumes the delta k times: the
            // count enters the product once per applied scan.
            for _ in 1..applied_count {
                prefix.count = mul_counts(prefix.count, change.count);
            }
            // Presolve: every unapplied constraint must tolerate the
            // bindings the change forced, with unbound registers as
            // wildcards. This reads the store before the change lands.
            for (cix, constraint) in self.constraints.iter().enumerate() {
                if applied & (1 << cix) != 0 {
                    continue;
                }
                if !constraint.accept(ctx, &prefix, &[])? {
                    continue 'combos;
                }
            }
            self.solve(ctx, &mut prefix, applied, out)?;
        }
        Ok(())
    }

    fn remaining(&self, prefix: &Prefix) -> usize {
        self.registers
            .iter()
            .filter(|&&reg| !prefix.is_bound(reg))
            .count()
    }

    fn solve(
        &self,
        ctx: &mut EvalContext,
        prefix: &mut Prefix,
        applied: u64,
        out: &mut ResultBuffer,
    ) -> Result<bool, EvalError> {
        let remaining = self.remaining(prefix);
        if remaining == 0 {
            return self.emit(ctx, prefix, applied, out);
        }
        self.generic_join(ctx, prefix, applied, remaining, out)
    }

    fn generic_join(
        &self,
        ctx: &mut EvalContext,
        prefix: &mut Prefix,
        applied: u64,
        remaining: usize,
        out: &mut ResultBuffer,
    ) -> Result<bool, EvalError> {
        let mut best: Option<(usize, crate::constraint::Proposal)> = None;
        for (ix, constraint) in self.constraints.iter().enumerate() {
            if applied & (1 << ix) != 0 {
                continue;
            }
            let proposal = constraint.propose(ctx, prefix);
            if proposal.skip {
                continue;
            }
            // Minimum cardinality wins; first encountered keeps ties.
            let better = match &best {
                None => true,
                Some((_, current)) => proposal.cardinality < current.cardinality,
            };
            if better {
                best = Some((ix, proposal));
            }
        }
        let Some((best_ix, proposal)) = best else {
            return Ok(false);
        };
        #[cfg(feature = "tracing")]
        ctx.metrics.record_proposal();

        let rows = self.constraints[best_ix].resolve_proposal(ctx, prefix, &proposal)?;
        let mut produced = false;
        'rows: for row in rows {
            #[cfg(feature = "tracing")]
            ctx.metrics.record_candidate();
            if row.len() != proposal.registers.len() {
                continue;
            }
            for (&reg, &id) in proposal.registers.iter().zip(row.iter()) {
                prefix.set(reg, id);
            }
            for (ix, constraint) in self.constraints.iter().enumerate() {
                if ix == best_ix || applied & (1 << ix) != 0 {
                    continue;
                }
                if !constraint.accept(ctx, prefix, &proposal.registers)? {
                    #[cfg(feature = "tracing")]
                    ctx.metrics.record_reject();
                    for &reg in proposal.registers.iter() {
                        prefix.clear(reg);
                    }
                    continue 'rows;
                }
            }
            let left = remaining - proposal.registers.len();
            if left == 0 {
                produced |= self.emit(ctx, prefix, applied, out)?;
            } else {
                produced |= self.generic_join(ctx, prefix, applied, left, out)?;
            }
            for &reg in proposal.registers.iter() {
                prefix.clear(reg);
            }
        }
        Ok(produced)
    }

    /// A fully-bound prefix: compose its multiplicity from the input
    /// count and the diffs of every scan the input did not supply.
    fn emit(
        &self,
        ctx: &mut EvalContext,
        prefix: &Prefix,
        applied: u64,
        out: &mut ResultBuffer,
    ) -> Result<bool, EvalError> {
        let mut diff_arrays: SmallVec<[SmallVec<[i32; 4]>; 4]> = SmallVec::new();
        for (ix, constraint) in self.constraints.iter().enumerate() {
            if applied & (1 << ix) != 0 {
                continue;
            }
            if let Some(diffs) = constraint.get_diffs(ctx, prefix) {
                if diffs.is_empty() {
                    // A premise that never held: nothing to emit.
                    return Ok(false);
                }
                diff_arrays.push(diffs);
            }
        }
        let multiplicities = compose_multiplicities(prefix.round, prefix.count, &diff_arrays);
        let mut produced = false;
        for (round, count) in multiplicities {
            if count != 0 {
                out.push(prefix.with_round_count(round, count));
                produced = true;
            }
        }
        Ok(produced)
    }
}

#[cfg(test)]
#[path = "tests/join.rs"]
mod tests;
