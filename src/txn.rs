//! Transaction - the fixpoint loop.
//!
//! A transaction distributes each queued change across every block,
//! folds derived binds through the distinct index back into per-round
//! queues, and drains rounds in order. When every round is empty,
//! pending commits collapse: wildcard removes expand against the index,
//! counts net per triple, and the survivors re-enter a fresh frame at
//! round 0 with saturated counts. Exports collapse per
//! `(block, e, a, v)` on the way out.
//!
//! The index is only written after a change has run through every
//! block, so a failed transaction leaves the store untouched by its
//! own writes.

use std::collections::VecDeque;

use hashbrown::HashMap;
use rustc_hash::FxHashMap;

use crate::block::Block;
use crate::change::{BlockId, Change, Commit, Count, Input, RawChange, FULL};
use crate::distinct::DistinctIndex;
use crate::function::FunctionRegistry;
use crate::index::TripleIndex;
use crate::output::{OutputBatch, WatchEmit};
use crate::value::{Id, Interner, RawValue};

#[cfg(feature = "tracing")]
use crate::metrics::EvalMetrics;
#[cfg(feature = "tracing")]
use crate::trace::{debug, debug_span, trace};

/// At most this many derivation steps per transaction.
pub const MAX_ITERATIONS: usize = 10_000;

/// At most this many commit frames per transaction.
pub const MAX_FRAMES: usize = 10;

/// Provenance tag carried by promoted commits.
pub const COMMIT_NODE: &str = "engine/commit";

/// Errors that abort a transaction.
#[derive(Debug)]
pub enum EvalError {
    /// An output change had an undefined E/A/V/N slot.
    UndefinedOutput { block: BlockId, slot: &'static str },
    /// An aggregate saw its projection count go negative.
    NegativeProjection,
    /// A function constraint named something never registered.
    UnknownFunction(String),
    /// The fixpoint exceeded the per-transaction iteration limit;
    /// almost always a rule deriving an unbounded chain.
    IterationLimit(usize),
    /// The fixpoint exceeded the commit-frame limit.
    FrameLimit(usize),
    /// The export handler refused the batch.
    ExportFailed(String),
    /// An ingress value was not a string or finite number.
    UninternableValue(String),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::UndefinedOutput { block, slot } => {
                write!(f, "block {} emitted an undefined {} slot", block, slot)
            }
            EvalError::NegativeProjection => {
                write!(f, "aggregate projection count went negative")
            }
            EvalError::UnknownFunction(name) => {
                write!(f, "no function registered under {:?}", name)
            }
            EvalError::IterationLimit(steps) => {
                write!(
                    f,
                    "fixpoint did not converge within {} derivation steps; \
                     a rule is likely deriving an unbounded chain",
                    steps
                )
            }
            EvalError::FrameLimit(frames) => {
                write!(f, "fixpoint exceeded {} commit frames", frames)
            }
            EvalError::ExportFailed(message) => {
                write!(f, "export handler failed: {}", message)
            }
            EvalError::UninternableValue(message) => {
                write!(f, "uninternable value: {}", message)
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// The block identity and register count every node sees.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub id: BlockId,
    pub registers: usize,
}

/// One exported change, reversed to raw values.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExportedChange {
    pub e: RawValue,
    pub a: RawValue,
    pub v: RawValue,
    pub count: Count,
}

/// Exported changes grouped by source block.
pub type ExportBatch = HashMap<BlockId, Vec<ExportedChange>>;

pub type ExportHandler = Box<dyn FnMut(&ExportBatch) -> Result<(), String>>;

/// What a transaction reports back.
#[derive(Debug)]
pub struct TransactionResult {
    pub id: u64,
    pub exports: ExportBatch,
}

/// The shared evaluation state every transaction borrows: interner,
/// triple index, distinct index, function registry, export log.
pub struct EvalContext {
    pub interner: Interner,
    pub index: TripleIndex,
    pub distinct: DistinctIndex,
    pub functions: FunctionRegistry,
    /// The transaction currently executing (or the last one finished).
    pub transaction: u64,
    /// Provenance for promoted commits.
    pub commit_n: Id,
    export_counts: FxHashMap<(BlockId, Id, Id, Id), Count>,
    export_handler: Option<ExportHandler>,
    #[cfg(feature = "tracing")]
    pub metrics: EvalMetrics,
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("transaction", &self.transaction)
            .field("live_values", &self.interner.live())
            .finish()
    }
}

impl EvalContext {
    pub fn new() -> Self {
        let mut interner = Interner::new();
        let commit_n = interner.intern_str(COMMIT_NODE);
        Self {
            interner,
            index: TripleIndex::new(),
            distinct: DistinctIndex::new(),
            functions: FunctionRegistry::with_builtins(),
            transaction: 0,
            commit_n,
            export_counts: FxHashMap::default(),
            export_handler: None,
            #[cfg(feature = "tracing")]
            metrics: EvalMetrics::new(),
        }
    }

    /// Register the handler invoked with every transaction's collapsed
    /// exports. A handler error aborts the transaction.
    pub fn set_export_handler(&mut self, handler: ExportHandler) {
        self.export_handler = Some(handler);
    }

    /// Does `(e, a, v)` hold in the store right now, any provenance?
    pub fn holds(&self, e: Id, a: Id, v: Id) -> bool {
        self.index.check(e, a, v, Id::NONE, self.transaction, u32::MAX)
    }

    /// Every net-positive fact, reversed to raw values and sorted.
    /// Primarily for inspection and tests.
    pub fn raw_facts(&self) -> Vec<(RawValue, RawValue, RawValue)> {
        let mut out: Vec<(RawValue, RawValue, RawValue)> = self
            .index
            .facts(self.transaction, u32::MAX)
            .into_iter()
            .filter_map(|(e, a, v)| {
                Some((
                    self.interner.reverse(e)?.clone(),
                    self.interner.reverse(a)?.clone(),
                    self.interner.reverse(v)?.clone(),
                ))
            })
            .collect();
        out.sort_by(|a, b| format!("{:?}", a).cmp(&format!("{:?}", b)));
        out
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A compiled program: the set of live blocks, in declaration order.
#[derive(Debug, Default)]
pub struct Program {
    pub blocks: Vec<Block>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }
}

/// Add a block to a running program: the new block computes all of its
/// contributions against the current store via a synthetic add signal.
pub fn add_block(
    ctx: &mut EvalContext,
    program: &mut Program,
    block: Block,
) -> Result<TransactionResult, EvalError> {
    let id = block.id;
    program.blocks.push(block);
    Transaction::run(ctx, program, vec![Input::BlockAdd(id)])
}

/// Remove a block from a running program: the block first computes and
/// retracts everything it contributed, then leaves the program.
pub fn remove_block(
    ctx: &mut EvalContext,
    program: &mut Program,
    id: BlockId,
) -> Result<TransactionResult, EvalError> {
    if !program.blocks.iter().any(|b| b.id == id) {
        return Transaction::run(ctx, program, Vec::new());
    }
    let result = Transaction::run(ctx, program, vec![Input::BlockRemove(id)]);
    program.blocks.retain(|b| b.id != id);
    result
}

/// Drives one atomic input batch to fixpoint.
pub struct Transaction {
    id: u64,
    round: u32,
    queues: Vec<VecDeque<Change>>,
    commits: Vec<Commit>,
    frames: usize,
    iterations: usize,
    watch_log: Vec<WatchEmit>,
    /// Every write this transaction made to the index and the distinct
    /// index, for rollback on abort.
    undo_log: Vec<UndoEntry>,
}

#[derive(Debug, Clone, Copy)]
enum UndoEntry {
    Index(Change),
    Distinct(Change),
}

impl Transaction {
    /// Intern and run a batch of raw changes.
    pub fn exec(
        ctx: &mut EvalContext,
        program: &mut Program,
        inputs: Vec<RawChange>,
    ) -> Result<TransactionResult, EvalError> {
        let mut interned = Vec::with_capacity(inputs.len());
        let txn = ctx.transaction + 1;
        for raw in inputs {
            let mut intern = |value: &RawValue| -> Result<Id, EvalError> {
                ctx.interner
                    .intern(value)
                    .ok_or_else(|| EvalError::UninternableValue(format!("{:?}", value)))
            };
            let change = Change::new(
                intern(&raw.e)?,
                intern(&raw.a)?,
                intern(&raw.v)?,
                intern(&raw.n)?,
                txn,
                raw.round,
                raw.count,
            );
            interned.push(Input::Change(change));
        }
        Self::run(ctx, program, interned)
    }

    /// Run a batch of already-interned inputs.
    pub fn run(
        ctx: &mut EvalContext,
        program: &mut Program,
        inputs: Vec<Input>,
    ) -> Result<TransactionResult, EvalError> {
        ctx.transaction += 1;
        let id = ctx.transaction;
        #[cfg(feature = "tracing")]
        let _span = debug_span!("transaction", id).entered();

        let mut txn = Transaction {
            id,
            round: 0,
            queues: Vec::new(),
            commits: Vec::new(),
            frames: 0,
            iterations: 0,
            watch_log: Vec::new(),
            undo_log: Vec::new(),
        };
        let outcome = txn.run_inputs(ctx, program, inputs);
        match outcome {
            Ok(()) => txn.finish(ctx),
            Err(error) => {
                // Undo this transaction's store writes so an aborted
                // fixpoint leaves no trace behind.
                txn.rollback(ctx);
                Err(error)
            }
        }
    }

    fn run_inputs(
        &mut self,
        ctx: &mut EvalContext,
        program: &mut Program,
        inputs: Vec<Input>,
    ) -> Result<(), EvalError> {
        for input in inputs {
            match input {
                Input::Change(change) => self.queue_change(ctx, change),
                signal => self.process(ctx, program, &signal)?,
            }
        }
        self.drain(ctx, program)
    }

    fn rollback(&mut self, ctx: &mut EvalContext) {
        for entry in self.undo_log.drain(..).rev() {
            match entry {
                UndoEntry::Index(change) => {
                    ctx.index.insert(&change.with_round_count(change.round, -change.count));
                }
                UndoEntry::Distinct(change) => {
                    let _ = ctx
                        .distinct
                        .distinct(&change.with_round_count(change.round, -change.count));
                }
            }
        }
    }

    /// Route a bag change through distinct into the round queues.
    fn queue_change(&mut self, ctx: &mut EvalContext, change: Change) {
        self.undo_log.push(UndoEntry::Distinct(change));
        for (round, delta) in ctx.distinct.distinct(&change) {
            #[cfg(feature = "tracing")]
            ctx.metrics.record_distinct_emit();
            self.enqueue_raw(change.with_round_count(round, delta));
        }
    }

    /// Queue a change as-is; promoted commits keep their saturation.
    /// Rounds only advance, so a change whose round already drained is
    /// queued at the current round (its own round column is what joins
    /// read; the queue slot only orders the work).
    fn enqueue_raw(&mut self, change: Change) {
        let slot = (change.round as usize).max(self.round as usize);
        if self.queues.len() <= slot {
            self.queues.resize_with(slot + 1, VecDeque::new);
        }
        self.queues[slot].push_back(change);
    }

    /// The next change in FIFO order, opening the next non-empty round
    /// when the current one drains.
    fn pop_next(&mut self) -> Option<Change> {
        let mut round = self.round as usize;
        while round < self.queues.len() {
            if let Some(change) = self.queues[round].pop_front() {
                self.round = round as u32;
                return Some(change);
            }
            round += 1;
        }
        None
    }

    fn drain(&mut self, ctx: &mut EvalContext, program: &mut Program) -> Result<(), EvalError> {
        #[cfg(feature = "tracing")]
        let mut opened_round: Option<u32> = None;
        loop {
            match self.pop_next() {
                Some(change) => {
                    #[cfg(feature = "tracing")]
                    if opened_round != Some(self.round) {
                        ctx.metrics.record_round();
                        opened_round = Some(self.round);
                    }
                    self.iterations += 1;
                    if self.iterations > MAX_ITERATIONS {
                        return Err(EvalError::IterationLimit(MAX_ITERATIONS));
                    }
                    self.process(ctx, program, &Input::Change(change))?;
                }
                None => {
                    if self.commits.is_empty() {
                        break;
                    }
                    self.frames += 1;
                    if self.frames > MAX_FRAMES {
                        return Err(EvalError::FrameLimit(MAX_FRAMES));
                    }
                    #[cfg(feature = "tracing")]
                    {
                        ctx.metrics.record_frame();
                        debug!(frame = self.frames, "commit_collapse");
                    }
                    let promoted = self.collapse_commits(ctx);
                    if promoted.is_empty() {
                        break;
                    }
                    // A fresh frame: rounds restart and the promoted
                    // commits re-enter as round-0 inputs.
                    self.round = 0;
                    #[cfg(feature = "tracing")]
                    {
                        opened_round = None;
                    }
                    for change in promoted {
                        self.enqueue_raw(change);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one input through the program: every block in declaration
    /// order for real changes, only the target block for signals. The
    /// index is updated last.
    fn process(
        &mut self,
        ctx: &mut EvalContext,
        program: &mut Program,
        input: &Input,
    ) -> Result<(), EvalError> {
        #[cfg(feature = "tracing")]
        {
            ctx.metrics.record_change();
            trace!(round = self.round, "process");
        }
        let mut ops = OutputBatch::default();
        match input {
            Input::Change(_) => {
                for block in program.blocks.iter_mut() {
                    block.exec(ctx, input, &mut ops)?;
                }
            }
            Input::BlockAdd(id) | Input::BlockRemove(id) => {
                if let Some(block) = program.blocks.iter_mut().find(|b| b.id == *id) {
                    block.exec(ctx, input, &mut ops)?;
                }
            }
        }
        for mut bind in ops.binds {
            bind.transaction = self.id;
            self.queue_change(ctx, bind);
        }
        self.commits.append(&mut ops.commits);
        self.watch_log.append(&mut ops.watches);

        if let Input::Change(change) = input {
            if change.count != 0 {
                self.undo_log.push(UndoEntry::Index(*change));
                ctx.index.insert(change);
            }
        }
        Ok(())
    }

    /// Net the commit pool per triple, expand wildcard removes against
    /// the committed store, and promote the survivors with saturated
    /// counts. Inserts of already-committed facts and removes of absent
    /// ones drop out here.
    fn collapse_commits(&mut self, ctx: &EvalContext) -> Vec<Change> {
        let commit_n = ctx.commit_n;
        let mut net: FxHashMap<(Id, Id, Id), Count> = FxHashMap::default();
        for commit in self.commits.drain(..) {
            let sign = commit.count.signum();
            if sign == 0 {
                continue;
            }
            if commit.removes_entity() {
                for (a, v) in ctx.index.attrs_under(commit.e, commit_n, self.id, u32::MAX) {
                    *net.entry((commit.e, a, v)).or_insert(0) += sign;
                }
            } else if commit.removes_values() {
                for v in ctx
                    .index
                    .values_under(commit.e, commit.a, commit_n, self.id, u32::MAX)
                {
                    *net.entry((commit.e, commit.a, v)).or_insert(0) += sign;
                }
            } else {
                *net.entry((commit.e, commit.a, commit.v)).or_insert(0) += sign;
            }
        }
        let mut promoted: Vec<Change> = Vec::new();
        for ((e, a, v), total) in net {
            let committed = ctx.index.check(e, a, v, commit_n, self.id, u32::MAX);
            let count = if total > 0 && !committed {
                FULL
            } else if total < 0 && committed {
                -FULL
            } else {
                continue;
            };
            promoted.push(Change::new(e, a, v, commit_n, self.id, 0, count));
        }
        promoted.sort_by_key(|c| (c.e, c.a, c.v));
        promoted
    }

    /// Collapse the watch log per `(block, e, a, v)` against the
    /// running export counts and hand the batch to the handler.
    fn finish(mut self, ctx: &mut EvalContext) -> Result<TransactionResult, EvalError> {
        let mut exports: ExportBatch = ExportBatch::new();
        for watch in self.watch_log.drain(..) {
            let key = (watch.block, watch.e, watch.a, watch.v);
            let entry = ctx.export_counts.entry(key).or_insert(0);
            let before = *entry;
            *entry += watch.count;
            let after = *entry;
            // +1 on the zero-to-positive crossing, -1 on the way out;
            // negative running totals stay suppressed.
            let emitted = match (before > 0, after > 0) {
                (false, true) => 1,
                (true, false) => -1,
                _ => continue,
            };
            let (Some(e), Some(a), Some(v)) = (
                ctx.interner.reverse(watch.e),
                ctx.interner.reverse(watch.a),
                ctx.interner.reverse(watch.v),
            ) else {
                continue;
            };
            #[cfg(feature = "tracing")]
            ctx.metrics.record_export();
            exports.entry(watch.block).or_default().push(ExportedChange {
                e: e.clone(),
                a: a.clone(),
                v: v.clone(),
                count: emitted,
            });
        }
        if let Some(mut handler) = ctx.export_handler.take() {
            let outcome = handler(&exports);
            ctx.export_handler = Some(handler);
            if let Err(message) = outcome {
                // The trace frame for this transaction unwinds with us.
                return Err(EvalError::ExportFailed(message));
            }
        }
        Ok(TransactionResult {
            id: self.id,
            exports,
        })
    }
}

#[cfg(test)]
#[path = "tests/txn.rs"]
mod tests;
