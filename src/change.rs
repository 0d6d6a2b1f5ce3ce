//! Change - the unit of flow through the dataflow.
//!
//! A change is an interned `(e, a, v, n)` tuple plus `(transaction,
//! round, count)`, where `count` is a signed multiplicity and `n` tags
//! the rule-node that produced the fact. Promoted commits carry
//! saturated counts so multiplicity bookkeeping can never retract them.

use serde::{Deserialize, Serialize};

use crate::value::{Id, RawValue};

/// Identifier of a compiled block within a program.
pub type BlockId = u32;

/// Signed multiplicity.
pub type Count = i64;

/// Counts at or beyond this band behave as infinity: promoted commits
/// enter the dataflow with `FULL` so products with ordinary counts stay
/// saturated.
pub const FULL: Count = 1 << 40;

/// Multiply two counts, saturating into the `FULL` band.
pub fn mul_counts(a: Count, b: Count) -> Count {
    let saturated = a.abs() >= FULL || b.abs() >= FULL;
    let sign = a.signum() * b.signum();
    if saturated {
        sign * FULL
    } else {
        a * b
    }
}

/// Add two counts, clamping into the `FULL` band.
pub fn add_counts(a: Count, b: Count) -> Count {
    let sum = a.saturating_add(b);
    sum.clamp(-FULL, FULL)
}

/// A delta on the triple store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub e: Id,
    pub a: Id,
    pub v: Id,
    /// Provenance: the rule-node that produced this fact.
    pub n: Id,
    pub transaction: u64,
    /// Recursion depth of the derivation within its transaction.
    pub round: u32,
    pub count: Count,
}

impl Change {
    pub fn new(e: Id, a: Id, v: Id, n: Id, transaction: u64, round: u32, count: Count) -> Self {
        Self {
            e,
            a,
            v,
            n,
            transaction,
            round,
            count,
        }
    }

    /// The full index key, provenance included.
    pub fn key(&self) -> (Id, Id, Id, Id) {
        (self.e, self.a, self.v, self.n)
    }

    /// The same change at a different round/count.
    pub fn with_round_count(&self, round: u32, count: Count) -> Self {
        Change {
            round,
            count,
            ..*self
        }
    }
}

/// A change at the engine boundary, before interning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub e: RawValue,
    pub a: RawValue,
    pub v: RawValue,
    pub n: RawValue,
    #[serde(default)]
    pub round: u32,
    #[serde(default = "default_count")]
    pub count: Count,
}

fn default_count() -> Count {
    1
}

impl RawChange {
    pub fn new(
        e: impl Into<RawValue>,
        a: impl Into<RawValue>,
        v: impl Into<RawValue>,
        n: impl Into<RawValue>,
    ) -> Self {
        Self {
            e: e.into(),
            a: a.into(),
            v: v.into(),
            n: n.into(),
            round: 0,
            count: 1,
        }
    }

    pub fn with_count(mut self, count: Count) -> Self {
        self.count = count;
        self
    }
}

/// What the transaction feeds into each block.
///
/// Block signals bypass head matching in joins: `BlockAdd` forces the
/// block to compute all contributions against the current store,
/// `BlockRemove` to compute and retract them. Both run with an empty
/// prefix and a count of plus or minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Change(Change),
    BlockAdd(BlockId),
    BlockRemove(BlockId),
}

impl Input {
    /// The round the block pipeline starts at for this input.
    pub fn round(&self) -> u32 {
        match self {
            Input::Change(c) => c.round,
            Input::BlockAdd(_) | Input::BlockRemove(_) => 0,
        }
    }

    /// The count the block pipeline starts with for this input.
    pub fn count(&self) -> Count {
        match self {
            Input::Change(c) => c.count,
            Input::BlockAdd(_) => 1,
            Input::BlockRemove(_) => -1,
        }
    }

    pub fn is_signal(&self) -> bool {
        !matches!(self, Input::Change(_))
    }
}

/// A pending commit emitted by an output node.
///
/// `v == Id::NONE` retracts every value under `(e, a)`; additionally
/// `a == Id::NONE` retracts the whole entity. The wildcard forms expand
/// against the index when the transaction collapses its commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub e: Id,
    pub a: Id,
    pub v: Id,
    pub n: Id,
    pub round: u32,
    /// Positive for inserts, negative for removes.
    pub count: Count,
}

impl Commit {
    pub fn is_remove(&self) -> bool {
        self.count < 0
    }

    /// True for the `(e, a, *)` wildcard form.
    pub fn removes_values(&self) -> bool {
        self.is_remove() && self.v.is_none() && self.a.is_some()
    }

    /// True for the `(e, *, *)` wildcard form.
    pub fn removes_entity(&self) -> bool {
        self.is_remove() && self.v.is_none() && self.a.is_none()
    }
}
