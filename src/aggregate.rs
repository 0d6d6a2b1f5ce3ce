//! Aggregate - grouped rolling computations over a prefix stream.
//!
//! Incoming prefixes are grouped by the group key and deduplicated per
//! projection key with the same per-round presence machinery the
//! distinct index uses. Each group keeps one rolling state per round;
//! when a contribution toggles a projection's presence, the state for
//! every affected round is updated and the group's result function is
//! re-encoded, emitting a retract of the stale result and an insert of
//! the fresh one at each round where it changed.
//!
//! The outer-lookup guard admits contributions only while their outer
//! key is present, so an aggregate inside a choose branch does not
//! count globally.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::change::{mul_counts, Count, Input};
use crate::flow::{join_key, JoinKey};
use crate::index::TxnRounds;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{BlockInfo, EvalContext, EvalError};
use crate::value::{Id, RawValue, FUNCTION_OUTPUT_ARENA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

/// Total order on f64 bit patterns (sign-flipped IEEE trick).
fn order_bits(n: f64) -> u64 {
    let bits = n.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Rolling aggregate state: `add`/`remove` a contribution, `result`
/// reads the current value.
#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    Sum(f64),
    Average { sum: f64, n: i64 },
    Min(BTreeMap<u64, (f64, usize)>),
    Max(BTreeMap<u64, (f64, usize)>),
}

impl AggState {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => AggState::Count(0),
            AggregateKind::Sum => AggState::Sum(0.0),
            AggregateKind::Average => AggState::Average { sum: 0.0, n: 0 },
            AggregateKind::Min => AggState::Min(BTreeMap::new()),
            AggregateKind::Max => AggState::Max(BTreeMap::new()),
        }
    }

    fn row_num(row: &[RawValue]) -> Option<f64> {
        row.first().and_then(|v| v.as_num())
    }

    fn add(&mut self, row: &[RawValue]) {
        match self {
            AggState::Count(n) => *n += 1,
            AggState::Sum(total) => {
                if let Some(x) = Self::row_num(row) {
                    *total += x;
                }
            }
            AggState::Average { sum, n } => {
                if let Some(x) = Self::row_num(row) {
                    *sum += x;
                    *n += 1;
                }
            }
            AggState::Min(values) | AggState::Max(values) => {
                if let Some(x) = Self::row_num(row) {
                    let entry = values.entry(order_bits(x)).or_insert((x, 0));
                    entry.1 += 1;
                }
            }
        }
    }

    fn remove(&mut self, row: &[RawValue]) {
        match self {
            AggState::Count(n) => *n -= 1,
            AggState::Sum(total) => {
                if let Some(x) = Self::row_num(row) {
                    *total -= x;
                }
            }
            AggState::Average { sum, n } => {
                if let Some(x) = Self::row_num(row) {
                    *sum -= x;
                    *n -= 1;
                }
            }
            AggState::Min(values) | AggState::Max(values) => {
                if let Some(x) = Self::row_num(row) {
                    let bits = order_bits(x);
                    if let Some(entry) = values.get_mut(&bits) {
                        entry.1 -= 1;
                        if entry.1 == 0 {
                            values.remove(&bits);
                        }
                    }
                }
            }
        }
    }

    fn result(&self) -> Option<RawValue> {
        match self {
            AggState::Count(n) => Some(RawValue::Num(*n as f64)),
            AggState::Sum(total) => Some(RawValue::Num(*total)),
            AggState::Average { sum, n } => {
                if *n > 0 {
                    Some(RawValue::Num(sum / *n as f64))
                } else {
                    None
                }
            }
            AggState::Min(values) => values.values().next().map(|(x, _)| RawValue::Num(*x)),
            AggState::Max(values) => values.values().next_back().map(|(x, _)| RawValue::Num(*x)),
        }
    }
}

/// One group's per-round state.
#[derive(Debug)]
struct Group {
    txn: u64,
    /// Group registers bound; the shape every result prefix copies.
    template: Prefix,
    projections: FxHashMap<JoinKey, TxnRounds>,
    rows: FxHashMap<JoinKey, SmallVec<[RawValue; 2]>>,
    states: Vec<AggState>,
    contributing: Vec<i64>,
    /// The result function over rounds, as last emitted.
    results: Vec<Option<Id>>,
}

impl Group {
    fn new(kind: AggregateKind, template: Prefix, txn: u64) -> Self {
        Self {
            txn,
            template,
            projections: FxHashMap::default(),
            rows: FxHashMap::default(),
            states: vec![AggState::new(kind)],
            contributing: vec![0],
            results: vec![None],
        }
    }

    /// Roll the round dimension forward: a later transaction sees only
    /// the final round's state, at round 0.
    fn fold_to(&mut self, txn: u64, kind: AggregateKind) {
        if txn <= self.txn {
            return;
        }
        self.txn = txn;
        for entry in self.projections.values_mut() {
            entry.fold_to(txn);
        }
        let last_state = self.states.last().cloned().unwrap_or(AggState::new(kind));
        let last_contributing = self.contributing.last().copied().unwrap_or(0);
        let last_result = self.results.last().copied().unwrap_or(None);
        self.states = vec![last_state];
        self.contributing = vec![last_contributing];
        self.results = vec![last_result];
    }

    fn extend_rounds(&mut self, len: usize) {
        while self.states.len() < len {
            let state = self.states.last().cloned().expect("states never empty");
            self.states.push(state);
            let contributing = *self.contributing.last().expect("contributing never empty");
            self.contributing.push(contributing);
            let result = *self.results.last().expect("results never empty");
            self.results.push(result);
        }
    }
}

/// Delta-encode a result function over rounds: at each round where the
/// value changes, retract the old and insert the new.
fn encode_results(results: &[Option<Id>]) -> SmallVec<[(u32, Id, Count); 4]> {
    let mut out: SmallVec<[(u32, Id, Count); 4]> = SmallVec::new();
    let mut prev: Option<Id> = None;
    for (round, result) in results.iter().enumerate() {
        if *result != prev {
            if let Some(old) = prev {
                out.push((round as u32, old, -1));
            }
            if let Some(new) = *result {
                out.push((round as u32, new, 1));
            }
            prev = *result;
        }
    }
    out
}

/// The guard for aggregates under a choose: per-key outer presence plus
/// the admitted contributions to re-weigh when the outer scope moves.
#[derive(Debug, Default)]
struct OuterGuard {
    key_regs: SmallVec<[usize; 4]>,
    counts: FxHashMap<JoinKey, TxnRounds>,
    admitted: FxHashMap<JoinKey, Vec<(u64, Prefix)>>,
}

impl OuterGuard {
    /// Semijoin a contribution against the outer presence: the events
    /// that actually reach the aggregate.
    fn filter_input(&mut self, txn: u64, prefix: &Prefix) -> SmallVec<[(u32, Count); 2]> {
        let key = join_key(prefix, &self.key_regs);
        let mut events: SmallVec<[(u32, Count); 2]> = SmallVec::new();
        if let Some(entry) = self.counts.get(&key) {
            let rounds = entry.view_rounds(txn);
            if rounds.present_at(prefix.round) {
                events.push((prefix.round, prefix.count));
            }
            for (t, s) in rounds.presence_deltas() {
                if t > prefix.round {
                    events.push((t, mul_counts(prefix.count, s)));
                }
            }
        }
        self.admitted
            .entry(key)
            .or_default()
            .push((txn, prefix.clone()));
        events
    }

    /// An outer delta: flip the admitted contributions wherever outer
    /// presence changed.
    fn feed_outer(&mut self, txn: u64, outer: &Prefix) -> Vec<(Prefix, u32, Count)> {
        let key = join_key(outer, &self.key_regs);
        let entry = self.counts.entry(key.clone()).or_default();
        entry.fold_to(txn);
        let old = entry.rounds.presence_deltas();
        entry.rounds.add(outer.round, outer.count);
        let new = entry.rounds.presence_deltas();
        let flips = crate::index::encoding_diff(&old, &new);
        let mut out = Vec::new();
        for (t, s) in flips {
            if let Some(admitted) = self.admitted.get(&key) {
                for (ptxn, prefix) in admitted.iter() {
                    let round = if *ptxn == txn { prefix.round } else { 0 };
                    let count = mul_counts(prefix.count, s);
                    if count != 0 {
                        out.push((prefix.clone(), t.max(round), count));
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct AggregateNode {
    pub kind: AggregateKind,
    pub group_regs: SmallVec<[usize; 4]>,
    pub projection_regs: SmallVec<[usize; 4]>,
    pub input_regs: SmallVec<[usize; 2]>,
    pub output_reg: usize,
    groups: FxHashMap<JoinKey, Group>,
    guard: Option<OuterGuard>,
    /// Guard corrections waiting for the next exec.
    pending: Vec<(Prefix, u32, Count)>,
}

impl AggregateNode {
    pub fn new(
        kind: AggregateKind,
        group_regs: &[usize],
        projection_regs: &[usize],
        input_regs: &[usize],
        output_reg: usize,
    ) -> Self {
        Self {
            kind,
            group_regs: group_regs.iter().copied().collect(),
            projection_regs: projection_regs.iter().copied().collect(),
            input_regs: input_regs.iter().copied().collect(),
            output_reg,
            groups: FxHashMap::default(),
            guard: None,
            pending: Vec::new(),
        }
    }

    /// Guard contributions behind an outer-scope lookup on these keys.
    pub fn with_outer_lookup(mut self, key_regs: &[usize]) -> Self {
        self.guard = Some(OuterGuard {
            key_regs: key_regs.iter().copied().collect(),
            counts: FxHashMap::default(),
            admitted: FxHashMap::default(),
        });
        self
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        _block: &BlockInfo,
        _input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        let txn = ctx.transaction;
        // Corrections from outer-scope movement first; they carry the
        // round/count the guard already computed.
        let pending = std::mem::take(&mut self.pending);
        for (prefix, round, count) in pending {
            self.apply(ctx, &prefix, round, count, out)?;
        }
        for prefix in incoming.iter() {
            match self.guard.as_mut() {
                Some(guard) => {
                    let events = guard.filter_input(txn, prefix);
                    for (round, count) in events {
                        self.apply(ctx, prefix, round, count, out)?;
                    }
                }
                None => self.apply(ctx, prefix, prefix.round, prefix.count, out)?,
            }
        }
        Ok(())
    }

    /// Outer-scope deltas arriving from an enclosing union/choose.
    pub fn feed_outer_scope(&mut self, ctx: &mut EvalContext, outer: &ResultBuffer) {
        let txn = ctx.transaction;
        if let Some(guard) = self.guard.as_mut() {
            for prefix in outer.iter() {
                self.pending.extend(guard.feed_outer(txn, prefix));
            }
        }
    }

    fn apply(
        &mut self,
        ctx: &mut EvalContext,
        prefix: &Prefix,
        round: u32,
        count: Count,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        let group_key = join_key(prefix, &self.group_regs);
        let projection_key = join_key(prefix, &self.projection_regs);
        let kind = self.kind;
        let group = self.groups.entry(group_key).or_insert_with(|| {
            let mut template = Prefix::empty(prefix.len(), 0, 1);
            for &reg in self.group_regs.iter() {
                template.set(reg, prefix.get(reg));
            }
            Group::new(kind, template, ctx.transaction)
        });
        group.fold_to(ctx.transaction, kind);

        let row: SmallVec<[RawValue; 2]> = self
            .input_regs
            .iter()
            .filter_map(|&reg| ctx.interner.reverse(prefix.get(reg)).cloned())
            .collect();
        if row.len() != self.input_regs.len() {
            // A contribution with an unbound input register never
            // reaches the state.
            return Ok(());
        }
        group
            .rows
            .entry(projection_key.clone())
            .or_insert_with(|| row.clone());

        let entry = group.projections.entry(projection_key.clone()).or_default();
        entry.fold_to(ctx.transaction);
        let len = entry
            .rounds
            .len()
            .max(round as usize + 1)
            .max(group.states.len());
        let old_present: Vec<bool> = (0..len as u32)
            .map(|r| entry.rounds.present_at(r))
            .collect();
        entry.rounds.add(round, count);
        let new_present: Vec<bool> = (0..len as u32)
            .map(|r| entry.rounds.present_at(r))
            .collect();

        group.extend_rounds(len);
        let old_encoding = encode_results(&group.results);
        let stored_row = group
            .rows
            .get(&projection_key)
            .cloned()
            .unwrap_or_default();
        for ix in 0..len {
            if old_present[ix] == new_present[ix] {
                continue;
            }
            if new_present[ix] {
                group.states[ix].add(&stored_row);
                group.contributing[ix] += 1;
            } else {
                group.states[ix].remove(&stored_row);
                group.contributing[ix] -= 1;
                if group.contributing[ix] < 0 {
                    return Err(EvalError::NegativeProjection);
                }
            }
        }
        for ix in 0..len {
            group.results[ix] = if group.contributing[ix] > 0 {
                match group.states[ix].result() {
                    Some(value) => ctx.interner.arena_intern(FUNCTION_OUTPUT_ARENA, &value),
                    None => None,
                }
            } else {
                None
            };
        }
        let new_encoding = encode_results(&group.results);

        // Emit the difference between the encodings.
        for &(r, id, c) in old_encoding.iter() {
            if !new_encoding.contains(&(r, id, c)) {
                let mut result = group.template.clone();
                result.set(self.output_reg, id);
                result.round = r;
                result.count = -c;
                out.push(result);
            }
        }
        for &(r, id, c) in new_encoding.iter() {
            if !old_encoding.contains(&(r, id, c)) {
                let mut result = group.template.clone();
                result.set(self.output_reg, id);
                result.round = r;
                result.count = c;
                out.push(result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/aggregate.rs"]
mod tests;
