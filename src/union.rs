//! Union and choose - branch flows over an outer stream.
//!
//! Each branch is a binary join of its body against the outer (left)
//! stream on the branch's key registers. A union emits every branch's
//! output. A choose adds exclusivity: each branch after the first runs
//! behind an antijoin against the union of the earlier branches'
//! outputs, presolved from this node's local results, so a tuple is
//! attributed to the first branch whose body matches.

use smallvec::SmallVec;

use crate::change::Input;
use crate::flow::{AntiJoinState, BinaryJoin};
use crate::output::OutputBatch;
use crate::prefix::ResultBuffer;
use crate::txn::{BlockInfo, EvalContext, EvalError};

#[derive(Debug)]
pub struct UnionFlow {
    pub branches: Vec<BinaryJoin>,
}

impl UnionFlow {
    pub fn new(branches: Vec<BinaryJoin>) -> Self {
        Self { branches }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        for branch in self.branches.iter_mut() {
            branch.feed_outer_scope(ctx, incoming);
            branch.exec(ctx, block, input, incoming, out, ops)?;
        }
        Ok(())
    }

    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        for branch in self.branches.iter_mut() {
            branch.feed_outer_scope(ctx, outer);
        }
    }
}

/// Prioritized branches: first match wins per key.
#[derive(Debug)]
pub struct ChooseFlow {
    pub branches: Vec<BinaryJoin>,
    /// Guard for branch `i + 1`: an antijoin whose right side is the
    /// accumulated output of branches `0..=i`, keyed on the union of
    /// every branch's key registers.
    guards: Vec<AntiJoinState>,
}

impl ChooseFlow {
    pub fn new(branches: Vec<BinaryJoin>) -> Self {
        let mut key_union: SmallVec<[usize; 4]> = SmallVec::new();
        for branch in branches.iter() {
            for &reg in branch.key_regs.iter() {
                if !key_union.contains(&reg) {
                    key_union.push(reg);
                }
            }
        }
        let guards = (1..branches.len())
            .map(|_| AntiJoinState::new(&key_union))
            .collect();
        Self { branches, guards }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        let txn = ctx.transaction;
        // Raw branch outputs produced during this exec; each guard
        // consumes the slice of earlier branches exactly once.
        let mut prior = ResultBuffer::new();
        for (ix, branch) in self.branches.iter_mut().enumerate() {
            branch.feed_outer_scope(ctx, incoming);
            let mut raw = ResultBuffer::new();
            branch.exec(ctx, block, input, incoming, &mut raw, ops)?;
            if ix == 0 {
                out.extend_cloned(&raw);
            } else {
                let guard = &mut self.guards[ix - 1];
                // Earlier branches' fresh output enters the guard's
                // right side before this branch's output is tested.
                for prefix in prior.iter() {
                    guard.push_right(txn, prefix, out);
                }
                for prefix in raw.iter() {
                    guard.push_left(txn, prefix, out);
                }
            }
            prior.append(&mut raw);
        }
        Ok(())
    }

    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        for branch in self.branches.iter_mut() {
            branch.feed_outer_scope(ctx, outer);
        }
    }
}

#[cfg(test)]
#[path = "tests/union.rs"]
mod tests;
