//! Node - the dataflow operators a block is built from.
//!
//! Nodes form a tree rooted at the block's node sequence: flows carry
//! sub-flows (a binary join's right side, a union's branches) as owned
//! children, and every cross-branch observation goes through explicit
//! arguments rather than back-pointers. Each node consumes the prefix
//! stream of its predecessor and appends to its own result buffer.

use crate::aggregate::AggregateNode;
use crate::change::Input;
use crate::flow::{AntiJoin, BinaryJoin};
use crate::join::JoinNode;
use crate::output::{OutputBatch, OutputNode, WatchNode};
use crate::prefix::ResultBuffer;
use crate::sort::SortNode;
use crate::txn::{BlockInfo, EvalContext, EvalError};
use crate::union::{ChooseFlow, UnionFlow};

/// A linear sequence of sub-nodes piping results start to finish.
#[derive(Debug, Default)]
pub struct LinearFlow {
    pub nodes: Vec<Node>,
}

impl LinearFlow {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
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
        let Some((first, rest)) = self.nodes.split_first_mut() else {
            out.extend_cloned(incoming);
            return Ok(());
        };
        let mut current = ResultBuffer::new();
        first.exec(ctx, block, input, incoming, &mut current, ops)?;
        let mut next = ResultBuffer::new();
        for node in rest {
            next.clear();
            node.exec(ctx, block, input, &current, &mut next, ops)?;
            std::mem::swap(&mut current, &mut next);
        }
        out.append(&mut current);
        Ok(())
    }

    fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        for node in self.nodes.iter_mut() {
            node.feed_outer_scope(ctx, outer);
        }
    }
}

#[derive(Debug)]
pub enum Node {
    Join(JoinNode),
    Linear(LinearFlow),
    Binary(BinaryJoin),
    Anti(AntiJoin),
    Union(UnionFlow),
    Choose(ChooseFlow),
    Aggregate(AggregateNode),
    Sort(SortNode),
    Output(OutputNode),
    Watch(WatchNode),
}

impl Node {
    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        match self {
            Node::Join(node) => node.exec(ctx, input, incoming, out),
            Node::Linear(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Binary(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Anti(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Union(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Choose(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Aggregate(node) => node.exec(ctx, block, input, incoming, out),
            Node::Sort(node) => node.exec(ctx, block, input, incoming, out),
            Node::Output(node) => node.exec(ctx, block, input, incoming, out, ops),
            Node::Watch(node) => node.exec(ctx, block, input, incoming, out, ops),
        }
    }

    /// Push outer-scope deltas down to any aggregate guards in this
    /// subtree. Everything else forwards or ignores them.
    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        match self {
            Node::Aggregate(node) => node.feed_outer_scope(ctx, outer),
            Node::Linear(node) => node.feed_outer_scope(ctx, outer),
            Node::Binary(node) => node.feed_outer_scope(ctx, outer),
            Node::Anti(node) => node.feed_outer_scope(ctx, outer),
            Node::Union(node) => node.feed_outer_scope(ctx, outer),
            Node::Choose(node) => node.feed_outer_scope(ctx, outer),
            Node::Join(_) | Node::Sort(_) | Node::Output(_) | Node::Watch(_) => {}
        }
    }
}
