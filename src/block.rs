//! Block - a compiled rule.
//!
//! A block carries a name, its register count, and an ordered node
//! sequence. Executing a block for an input runs the pipeline from a
//! single fresh prefix carrying the input's round and count; whatever
//! the nodes emit lands in the shared output batch.

use crate::change::{BlockId, Input};
use crate::node::Node;
use crate::output::OutputBatch;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{BlockInfo, EvalContext, EvalError};

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub registers: usize,
    pub nodes: Vec<Node>,
}

impl Block {
    pub fn new(id: BlockId, name: &str, registers: usize, nodes: Vec<Node>) -> Self {
        Self {
            id,
            name: name.to_string(),
            registers,
            nodes,
        }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        input: &Input,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        let info = BlockInfo {
            id: self.id,
            registers: self.registers,
        };
        let mut current = ResultBuffer::unit(Prefix::empty(
            self.registers,
            input.round(),
            input.count(),
        ));
        let mut next = ResultBuffer::new();
        for node in self.nodes.iter_mut() {
            next.clear();
            node.exec(ctx, &info, input, &current, &mut next, ops)?;
            std::mem::swap(&mut current, &mut next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::EvalContext;

    #[test]
    fn empty_block_runs_clean() {
        let mut ctx = EvalContext::new();
        let mut block = Block::new(1, "noop", 0, Vec::new());
        let mut ops = OutputBatch::default();
        block
            .exec(&mut ctx, &Input::BlockAdd(1), &mut ops)
            .expect("an empty block must not fail");
        assert!(ops.is_empty());
    }
}
