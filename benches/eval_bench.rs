//! Evaluation benchmarks using Criterion.
//!
//! Run with: `cargo bench`
//!
//! These benchmarks measure the fixpoint loop end to end: interning,
//! generic join, distinct reduction, and the round queues, driven by a
//! transitive-closure rule over edge chains of growing length.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use weft::block::Block;
use weft::change::RawChange;
use weft::constraint::{Constraint, Field, Scan};
use weft::distinct::DistinctIndex;
use weft::join::JoinNode;
use weft::node::Node;
use weft::output::{OutputKind, OutputNode};
use weft::txn::{EvalContext, Program, Transaction};

fn closure_block(ctx: &mut EvalContext, id: u32) -> Block {
    let edge = ctx.interner.intern_str("edge");
    let n = ctx.interner.intern_str("rule/closure");
    Block::new(
        id,
        "closure",
        3,
        vec![
            Node::Join(JoinNode::new(vec![
                Constraint::Scan(Scan::new(
                    Field::Register(0),
                    Field::Static(edge),
                    Field::Register(1),
                )),
                Constraint::Scan(Scan::new(
                    Field::Register(1),
                    Field::Static(edge),
                    Field::Register(2),
                )),
            ])),
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                Field::Register(0),
                Field::Static(edge),
                Field::Register(2),
                n,
            )),
        ],
    )
}

fn chain(len: usize) -> Vec<RawChange> {
    (0..len)
        .map(|i| RawChange::new(i as f64, "edge", (i + 1) as f64, "input"))
        .collect()
}

fn bench_closure_fixpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_fixpoint");
    for len in [4usize, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                let mut ctx = EvalContext::new();
                let block = closure_block(&mut ctx, 1);
                let mut program = Program::new().with_block(block);
                let result = Transaction::exec(&mut ctx, &mut program, chain(len)).unwrap();
                black_box(result.id)
            });
        });
    }
    group.finish();
}

fn bench_single_change_increment(c: &mut Criterion) {
    c.bench_function("incremental_edge_insert", |b| {
        let mut ctx = EvalContext::new();
        let block = closure_block(&mut ctx, 1);
        let mut program = Program::new().with_block(block);
        Transaction::exec(&mut ctx, &mut program, chain(16)).unwrap();
        let mut next = 1_000_000u64;
        b.iter(|| {
            // A fresh edge far from the chain: pure per-change cost.
            next += 2;
            let batch = vec![RawChange::new(
                next as f64,
                "edge",
                (next + 1) as f64,
                "input",
            )];
            let result = Transaction::exec(&mut ctx, &mut program, batch).unwrap();
            black_box(result.id)
        });
    });
}

fn bench_distinct(c: &mut Criterion) {
    c.bench_function("distinct_reduction", |b| {
        let mut interner = weft::value::Interner::new();
        let e = interner.intern_str("k");
        b.iter(|| {
            let mut distinct = DistinctIndex::new();
            let mut emitted = 0usize;
            for round in 0..64u32 {
                let change = weft::change::Change::new(
                    e,
                    e,
                    e,
                    e,
                    1,
                    round % 4,
                    if round % 2 == 0 { 1 } else { -1 },
                );
                emitted += distinct.distinct(&change).len();
            }
            black_box(emitted)
        });
    });
}

criterion_group!(
    benches,
    bench_closure_fixpoint,
    bench_single_change_increment,
    bench_distinct
);
criterion_main!(benches);
