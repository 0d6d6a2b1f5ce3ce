//! Sort - a positional aggregate.
//!
//! Rows group by a key and are ordered by the sort registers, each with
//! its own direction (trailing registers inherit the previous one).
//! Every row's rank is exported as a fact; whenever an insertion or
//! retraction shifts ranks, the node emits a retract+insert pair for
//! each element whose rank changed. Ties keep insertion order.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::change::{Count, Input};
use crate::flow::{join_key, JoinKey};
use crate::index::TxnRounds;
use crate::prefix::{Prefix, ResultBuffer};
use crate::txn::{BlockInfo, EvalContext, EvalError};
use crate::value::{Id, RawValue, FUNCTION_OUTPUT_ARENA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A sortable view of an interned value: numbers order numerically and
/// before strings.
#[derive(Debug, Clone, PartialEq)]
enum SortVal {
    Num(f64),
    Str(String),
    Opaque(u32),
}

impl SortVal {
    fn of(value: Option<&RawValue>, id: Id) -> SortVal {
        match value {
            Some(RawValue::Num(n)) => SortVal::Num(*n),
            Some(RawValue::Str(s)) => SortVal::Str(s.clone()),
            None => SortVal::Opaque(id.raw()),
        }
    }

    fn rank_class(&self) -> u8 {
        match self {
            SortVal::Num(_) => 0,
            SortVal::Str(_) => 1,
            SortVal::Opaque(_) => 2,
        }
    }

    fn cmp_within(&self, other: &SortVal) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (SortVal::Num(a), SortVal::Num(b)) => a.total_cmp(b),
            (SortVal::Str(a), SortVal::Str(b)) => a.cmp(b),
            (SortVal::Opaque(a), SortVal::Opaque(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }

    fn compare(&self, other: &SortVal) -> std::cmp::Ordering {
        self.rank_class()
            .cmp(&other.rank_class())
            .then_with(|| self.cmp_within(other))
    }
}

#[derive(Debug)]
struct SortRow {
    /// Full register image; the row's identity.
    prefix: Prefix,
    sort_vals: SmallVec<[SortVal; 4]>,
    /// Insertion sequence; the tiebreak that keeps ranks stable.
    seq: u64,
    counts: TxnRounds,
}

#[derive(Debug)]
struct SortGroup {
    txn: u64,
    rows: Vec<SortRow>,
    /// Per round: row index to emitted rank.
    results: Vec<FxHashMap<usize, u32>>,
    next_seq: u64,
}

impl SortGroup {
    fn new(txn: u64) -> Self {
        Self {
            txn,
            rows: Vec::new(),
            results: vec![FxHashMap::default()],
            next_seq: 0,
        }
    }

    fn fold_to(&mut self, txn: u64) {
        if txn <= self.txn {
            return;
        }
        self.txn = txn;
        for row in self.rows.iter_mut() {
            row.counts.fold_to(txn);
        }
        let last = self.results.last().cloned().unwrap_or_default();
        self.results = vec![last];
    }

    fn extend_rounds(&mut self, len: usize) {
        while self.results.len() < len {
            let last = self.results.last().cloned().expect("results never empty");
            self.results.push(last);
        }
    }
}

#[derive(Debug)]
pub struct SortNode {
    pub group_regs: SmallVec<[usize; 4]>,
    pub sort_regs: SmallVec<[usize; 4]>,
    pub directions: SmallVec<[Direction; 4]>,
    pub output_reg: usize,
    groups: FxHashMap<JoinKey, SortGroup>,
}

impl SortNode {
    pub fn new(
        group_regs: &[usize],
        sort_regs: &[usize],
        directions: &[Direction],
        output_reg: usize,
    ) -> Self {
        // Trailing sort registers inherit the previous direction.
        let mut dirs: SmallVec<[Direction; 4]> = SmallVec::new();
        for ix in 0..sort_regs.len() {
            let dir = directions
                .get(ix)
                .copied()
                .or_else(|| dirs.last().copied())
                .unwrap_or(Direction::Up);
            dirs.push(dir);
        }
        Self {
            group_regs: group_regs.iter().copied().collect(),
            sort_regs: sort_regs.iter().copied().collect(),
            directions: dirs,
            output_reg,
            groups: FxHashMap::default(),
        }
    }

    pub fn exec(
        &mut self,
        ctx: &mut EvalContext,
        _block: &BlockInfo,
        _input: &Input,
        incoming: &ResultBuffer,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        for prefix in incoming.iter() {
            self.apply(ctx, prefix, out)?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        ctx: &mut EvalContext,
        prefix: &Prefix,
        out: &mut ResultBuffer,
    ) -> Result<(), EvalError> {
        let txn = ctx.transaction;
        let group_key = join_key(prefix, &self.group_regs);
        let sort_regs = self.sort_regs.clone();
        let directions = self.directions.clone();
        let group = self
            .groups
            .entry(group_key)
            .or_insert_with(|| SortGroup::new(txn));
        group.fold_to(txn);

        // Find or create the row this prefix names.
        let row_ix = match group
            .rows
            .iter()
            .position(|row| row.prefix.slots() == prefix.slots())
        {
            Some(ix) => ix,
            None => {
                let sort_vals = sort_regs
                    .iter()
                    .map(|&reg| {
                        let id = prefix.get(reg);
                        SortVal::of(ctx.interner.reverse(id), id)
                    })
                    .collect();
                group.rows.push(SortRow {
                    prefix: prefix.with_round_count(0, 0),
                    sort_vals,
                    seq: group.next_seq,
                    counts: TxnRounds {
                        txn,
                        rounds: Default::default(),
                    },
                });
                group.next_seq += 1;
                group.rows.len() - 1
            }
        };
        group.rows[row_ix].counts.fold_to(txn);
        group.rows[row_ix].counts.rounds.add(prefix.round, prefix.count);

        let len = group
            .results
            .len()
            .max(prefix.round as usize + 1)
            .max(group.rows[row_ix].counts.rounds.len());
        group.extend_rounds(len);

        // Recompute ranks for every round the change can reach; the
        // old function stays around to diff against.
        let old_results = group.results.clone();
        for round in prefix.round as usize..len {
            let mut present: Vec<usize> = (0..group.rows.len())
                .filter(|&ix| group.rows[ix].counts.rounds.present_at(round as u32))
                .collect();
            present.sort_by(|&a, &b| ordering(&directions, &group.rows[a], &group.rows[b]));
            let mut fresh: FxHashMap<usize, u32> = FxHashMap::default();
            for (position, &ix) in present.iter().enumerate() {
                fresh.insert(ix, position as u32 + 1);
            }
            group.results[round] = fresh;
        }

        // Emit, per row, the difference between the delta encodings of
        // its old and new rank functions.
        for ix in 0..group.rows.len() {
            let old_fn: Vec<Option<u32>> = (0..len)
                .map(|r| old_results.get(r).and_then(|m| m.get(&ix)).copied())
                .collect();
            let new_fn: Vec<Option<u32>> = (0..len)
                .map(|r| group.results[r].get(&ix).copied())
                .collect();
            if old_fn == new_fn {
                continue;
            }
            let old_encoding = encode_ranks(&old_fn);
            let new_encoding = encode_ranks(&new_fn);
            for &(round, rank, count) in old_encoding.iter() {
                if !new_encoding.contains(&(round, rank, count)) {
                    emit_rank(
                        ctx,
                        &group.rows[ix].prefix,
                        self.output_reg,
                        round,
                        rank,
                        -count,
                        out,
                    );
                }
            }
            for &(round, rank, count) in new_encoding.iter() {
                if !old_encoding.contains(&(round, rank, count)) {
                    emit_rank(
                        ctx,
                        &group.rows[ix].prefix,
                        self.output_reg,
                        round,
                        rank,
                        count,
                        out,
                    );
                }
            }
        }
        Ok(())
    }
}

fn ordering(directions: &[Direction], a: &SortRow, b: &SortRow) -> std::cmp::Ordering {
    for (ix, dir) in directions.iter().enumerate() {
        let cmp = a.sort_vals[ix].compare(&b.sort_vals[ix]);
        let cmp = match dir {
            Direction::Up => cmp,
            Direction::Down => cmp.reverse(),
        };
        if cmp != std::cmp::Ordering::Equal {
            return cmp;
        }
    }
    a.seq.cmp(&b.seq)
}

fn emit_rank(
    ctx: &mut EvalContext,
    row: &Prefix,
    output_reg: usize,
    round: u32,
    rank: u32,
    count: Count,
    out: &mut ResultBuffer,
) {
    let Some(rank_id) = ctx
        .interner
        .arena_intern(FUNCTION_OUTPUT_ARENA, &RawValue::Num(rank as f64))
    else {
        return;
    };
    let mut result = row.clone();
    result.set(output_reg, rank_id);
    result.round = round;
    result.count = count;
    out.push(result);
}

/// Delta-encode a rank function over rounds: at each round where the
/// rank changes, retract the old and insert the new.
fn encode_ranks(ranks: &[Option<u32>]) -> SmallVec<[(u32, u32, Count); 4]> {
    let mut out: SmallVec<[(u32, u32, Count); 4]> = SmallVec::new();
    let mut prev: Option<u32> = None;
    for (round, rank) in ranks.iter().enumerate() {
        if *rank != prev {
            if let Some(old) = prev {
                out.push((round as u32, old, -1));
            }
            if let Some(new) = *rank {
                out.push((round as u32, new, 1));
            }
            prev = *rank;
        }
    }
    out
}

#[cfg(test)]
#[path = "tests/sort.rs"]
mod tests;
