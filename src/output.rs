//! Output nodes - where prefixes become changes.
//!
//! Inserts and removes come in bind and commit flavors. Bind output
//! lives for the surrounding transaction's dataflow; commits are pooled
//! and promoted to persistent state when the transaction collapses a
//! frame. A remove with `v` ignored retracts every value under
//! `(e, a)`; with `a` also ignored it retracts the whole entity - both
//! wildcard forms are pooled as commits and expand against the index at
//! collapse time. Watches export per-block buckets to an external
//! handler instead of the store.
//!
//! Derived facts sit one round deeper than the prefixes that produced
//! them; that is what makes a round a recursion depth.

use crate::change::{BlockId, Change, Commit, Count, Input};
use crate::constraint::Field;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{BlockInfo, EvalContext, EvalError};
use crate::value::Id;

/// Bind or commit scope for an output node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Bind,
    Commit,
}

/// A watch emission: an exported change tagged with its source block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEmit {
    pub block: BlockId,
    pub e: Id,
    pub a: Id,
    pub v: Id,
    pub round: u32,
    pub count: Count,
}

/// Everything a block run produced, batched per kind so the
/// transaction can tell binds from commits.
#[derive(Debug, Default)]
pub struct OutputBatch {
    pub binds: Vec<Change>,
    pub commits: Vec<Commit>,
    pub watches: Vec<WatchEmit>,
}

impl OutputBatch {
    pub fn clear(&mut self) {
        self.binds.clear();
        self.commits.clear();
        self.watches.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.commits.is_empty() && self.watches.is_empty()
    }
}

/// Emits a change per incoming prefix and passes the prefix through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNode {
    pub kind: OutputKind,
    pub remove: bool,
    pub e: Field,
    pub a: Field,
    pub v: Field,
    /// Provenance tag for every fact this node produces.
    pub n: Id,
}

impl OutputNode {
    pub fn insert(kind: OutputKind, e: Field, a: Field, v: Field, n: Id) -> Self {
        Self {
            kind,
            remove: false,
            e,
            a,
            v,
            n,
        }
    }

    pub fn remove(kind: OutputKind, e: Field, a: Field, v: Field, n: Id) -> Self {
        Self {
            kind,
            remove: true,
            e,
            a,
            v,
            n,
        }
    }

    fn slot(
        &self,
        field: &Field,
        prefix: &Prefix,
        name: &'static str,
        block: BlockId,
        wildcard_ok: bool,
    ) -> Result<Id, EvalError> {
        if wildcard_ok && matches!(field, Field::Ignore) {
            return Ok(Id::NONE);
        }
        let id = field.value(prefix);
        if id.is_none() {
            return Err(EvalError::UndefinedOutput { block, slot: name });
        }
        Ok(id)
    }

    pub fn exec(
        &self,
        ctx: &mut EvalContext,
        block: &BlockInfo,
        _input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        for prefix in incoming.iter() {
            if prefix.count == 0 {
                continue;
            }
            let e = self.slot(&self.e, prefix, "e", block.id, false)?;
            let a = self.slot(&self.a, prefix, "a", block.id, self.remove)?;
            let v = self.slot(&self.v, prefix, "v", block.id, self.remove)?;
            if self.n.is_none() {
                return Err(EvalError::UndefinedOutput {
                    block: block.id,
                    slot: "n",
                });
            }
            // The entity-level wildcard requires the value one too.
            let (a, v) = if a.is_none() { (Id::NONE, Id::NONE) } else { (a, v) };
            let round = prefix.round + 1;
            let count = if self.remove {
                -prefix.count
            } else {
                prefix.count
            };
            match self.kind {
                OutputKind::Commit => ops.commits.push(Commit {
                    e,
                    a,
                    v,
                    n: self.n,
                    round,
                    count,
                }),
                OutputKind::Bind => {
                    if v.is_none() {
                        // Wildcard removes only make sense against the
                        // persistent store; pool them with the commits.
                        ops.commits.push(Commit {
                            e,
                            a,
                            v,
                            n: self.n,
                            round,
                            count,
                        });
                    } else {
                        ops.binds.push(Change::new(
                            e,
                            a,
                            v,
                            self.n,
                            ctx.transaction,
                            round,
                            count,
                        ));
                    }
                }
            }
            out.push(prefix.clone());
        }
        Ok(())
    }
}

/// A bind-like output that exports to an external handler, one bucket
/// per source block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchNode {
    pub block: BlockId,
    pub e: Field,
    pub a: Field,
    pub v: Field,
}

impl WatchNode {
    pub fn new(block: BlockId, e: Field, a: Field, v: Field) -> Self {
        Self { block, e, a, v }
    }

    pub fn exec(
        &self,
        _ctx: &mut EvalContext,
        block: &BlockInfo,
        _input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
        ops: &mut OutputBatch,
    ) -> Result<(), EvalError> {
        for prefix in incoming.iter() {
            if prefix.count == 0 {
                continue;
            }
            let resolve = |field: &Field, name: &'static str| -> Result<Id, EvalError> {
                let id = field.value(prefix);
                if id.is_none() {
                    return Err(EvalError::UndefinedOutput {
                        block: block.id,
                        slot: name,
                    });
                }
                Ok(id)
            };
            ops.watches.push(WatchEmit {
                block: self.block,
                e: resolve(&self.e, "e")?,
                a: resolve(&self.a, "a")?,
                v: resolve(&self.v, "v")?,
                round: prefix.round,
                count: prefix.count,
            });
            out.push(prefix.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/output.rs"]
mod tests;
