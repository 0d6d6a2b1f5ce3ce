//! Property tests for the fixpoint invariants.

use proptest::prelude::*;

use weft::block::Block;
use weft::change::{Change, RawChange};
use weft::constraint::{Constraint, Field, Scan};
use weft::distinct::DistinctIndex;
use weft::join::JoinNode;
use weft::node::Node;
use weft::output::{OutputKind, OutputNode};
use weft::txn::{EvalContext, Program, Transaction};
use weft::value::{Interner, RawValue};

fn fact(e: impl Into<RawValue>, a: impl Into<RawValue>, v: impl Into<RawValue>) -> RawChange {
    RawChange::new(e, a, v, "input")
}

fn retraction(e: impl Into<RawValue>, a: impl Into<RawValue>, v: impl Into<RawValue>) -> RawChange {
    fact(e, a, v).with_count(-1)
}

/// `attr(x,y) ∧ attr(y,z) ⇒ attr(x,z)`.
fn closure_block(ctx: &mut EvalContext, id: u32, attr: &str) -> Block {
    let attr_id = ctx.interner.intern_str(attr);
    let n = ctx.interner.intern_str("rule/closure");
    Block::new(
        id,
        "closure",
        3,
        vec![
            Node::Join(JoinNode::new(vec![
                Constraint::Scan(Scan::new(
                    Field::Register(0),
                    Field::Static(attr_id),
                    Field::Register(1),
                )),
                Constraint::Scan(Scan::new(
                    Field::Register(1),
                    Field::Static(attr_id),
                    Field::Register(2),
                )),
            ])),
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                Field::Register(0),
                Field::Static(attr_id),
                Field::Register(2),
                n,
            )),
        ],
    )
}

fn arbitrary_value() -> impl Strategy<Value = RawValue> {
    prop_oneof![
        "[a-z]{0,8}".prop_map(RawValue::Str),
        (-1.0e6f64..1.0e6).prop_map(RawValue::Num),
    ]
}

proptest! {
    #[test]
    fn intern_reverse_round_trips(value in arbitrary_value()) {
        let mut interner = Interner::new();
        let id = interner.intern(&value).expect("finite values intern");
        prop_assert_eq!(interner.reverse(id), Some(&value));
    }

    #[test]
    fn interning_is_injective(a in arbitrary_value(), b in arbitrary_value()) {
        let mut interner = Interner::new();
        let ia = interner.intern(&a).unwrap();
        let ib = interner.intern(&b).unwrap();
        // Numbers are keyed by bit pattern (0.0 and -0.0 differ).
        let identical = match (&a, &b) {
            (RawValue::Num(x), RawValue::Num(y)) => x.to_bits() == y.to_bits(),
            _ => a == b,
        };
        prop_assert_eq!(ia == ib, identical, "same id exactly for same value");
    }

    /// The accumulated distinct output for a key always equals the
    /// delta encoding of the final presence function of the raw bag.
    #[test]
    fn distinct_tracks_presence(
        events in prop::collection::vec((0u32..6, -3i64..4), 1..12)
    ) {
        let mut distinct = DistinctIndex::new();
        let mut raw = [0i64; 8];
        let mut emitted = [0i64; 8];
        let mut interner = Interner::new();
        let e = interner.intern_str("k");
        for (round, count) in events {
            if count == 0 {
                continue;
            }
            raw[round as usize] += count;
            let change = Change::new(e, e, e, e, 1, round, count);
            for (r, delta) in distinct.distinct(&change) {
                emitted[r as usize] += delta;
            }
        }
        // Expected: +1 where the running total crosses into positive,
        // -1 where it crosses back.
        let mut expected = [0i64; 8];
        let mut running = 0i64;
        let mut present = false;
        for round in 0..8 {
            running += raw[round];
            let now = running > 0;
            if now != present {
                expected[round] = if now { 1 } else { -1 };
                present = now;
            }
        }
        prop_assert_eq!(emitted, expected);
    }

    /// Inserting facts and retracting them in a later transaction
    /// leaves the store empty.
    #[test]
    fn insert_then_retract_is_identity(
        triples in prop::collection::vec((0u32..4, 0u32..4), 1..6)
    ) {
        let mut ctx = EvalContext::new();
        let mut program = Program::new();
        let inserts = triples
            .iter()
            .map(|&(e, v)| fact(format!("e{}", e).as_str(), "rel", format!("v{}", v).as_str()))
            .collect();
        Transaction::exec(&mut ctx, &mut program, inserts).unwrap();
        let retracts = triples
            .iter()
            .map(|&(e, v)| retraction(format!("e{}", e).as_str(), "rel", format!("v{}", v).as_str()))
            .collect();
        Transaction::exec(&mut ctx, &mut program, retracts).unwrap();
        prop_assert!(ctx.raw_facts().is_empty());
    }

    /// The engine's fixpoint over a closure rule matches the closure
    /// computed naively, both after the initial batch and after
    /// retracting one edge. Edges run low to high so the closure is
    /// acyclic; derivations never support themselves.
    #[test]
    fn closure_matches_naive_fixpoint(
        edges in prop::collection::hash_set(
            (0u8..5, 0u8..5).prop_filter("acyclic", |(x, y)| x < y),
            1..6,
        ),
        retract_ix in 0usize..6
    ) {
        let edges: Vec<(u8, u8)> = edges.into_iter().collect();
        let mut ctx = EvalContext::new();
        let block = closure_block(&mut ctx, 1, "edge");
        let mut program = Program::new().with_block(block);
        let inserts = edges
            .iter()
            .map(|&(x, y)| fact(x as f64, "edge", y as f64))
            .collect();
        Transaction::exec(&mut ctx, &mut program, inserts).unwrap();
        prop_assert_eq!(engine_edges(&ctx), naive_closure(&edges));

        // Retract one edge and re-compare.
        let gone = edges[retract_ix % edges.len()];
        Transaction::exec(
            &mut ctx,
            &mut program,
            vec![retraction(gone.0 as f64, "edge", gone.1 as f64)],
        )
        .unwrap();
        let remaining: Vec<(u8, u8)> =
            edges.iter().copied().filter(|&e| e != gone).collect();
        prop_assert_eq!(engine_edges(&ctx), naive_closure(&remaining));
    }
}

fn engine_edges(ctx: &EvalContext) -> std::collections::BTreeSet<(u8, u8)> {
    ctx.raw_facts()
        .into_iter()
        .filter_map(|(e, a, v)| {
            if a != RawValue::str("edge") {
                return None;
            }
            match (e, v) {
                (RawValue::Num(x), RawValue::Num(y)) => Some((x as u8, y as u8)),
                _ => None,
            }
        })
        .collect()
}

fn naive_closure(edges: &[(u8, u8)]) -> std::collections::BTreeSet<(u8, u8)> {
    let mut closed: std::collections::BTreeSet<(u8, u8)> = edges.iter().copied().collect();
    loop {
        let mut fresh = Vec::new();
        for &(x, y) in closed.iter() {
            for &(y2, z) in closed.iter() {
                if y == y2 && !closed.contains(&(x, z)) {
                    fresh.push((x, z));
                }
            }
        }
        if fresh.is_empty() {
            return closed;
        }
        closed.extend(fresh);
    }
}
