use super::*;
use crate::change::Input;
use crate::txn::{BlockInfo, EvalContext};

fn ctx() -> EvalContext {
    let mut ctx = EvalContext::new();
    ctx.transaction = 1;
    ctx
}

fn info() -> BlockInfo {
    BlockInfo {
        id: 1,
        registers: 3,
    }
}

fn ignored() -> Input {
    Input::BlockAdd(0)
}

/// registers: 0 = entity, 1 = score, 2 = rank.
fn descending() -> SortNode {
    SortNode::new(&[], &[1], &[Direction::Down], 2)
}

fn row(ctx: &mut EvalContext, entity: &str, score: f64, count: i64) -> Prefix {
    let e = ctx.interner.intern_str(entity);
    let s = ctx.interner.intern_num(score);
    let mut prefix = Prefix::empty(3, 0, count);
    prefix.set(0, e);
    prefix.set(1, s);
    prefix
}

fn run(
    ctx: &mut EvalContext,
    node: &mut SortNode,
    prefixes: Vec<Prefix>,
) -> Vec<(String, Option<f64>, i64)> {
    let mut incoming = ResultBuffer::new();
    for prefix in prefixes {
        incoming.push(prefix);
    }
    let mut out = ResultBuffer::new();
    node.exec(ctx, &info(), &ignored(), &incoming, &mut out)
        .unwrap();
    out.iter()
        .map(|p| {
            let entity = match ctx.interner.reverse(p.get(0)) {
                Some(crate::value::RawValue::Str(s)) => s.clone(),
                other => format!("{:?}", other),
            };
            (entity, ctx.interner.number(p.get(2)), p.count)
        })
        .collect()
}

#[test]
fn first_row_gets_rank_one() {
    let mut ctx = ctx();
    let mut node = descending();
    let a = row(&mut ctx, "a", 3.0, 1);
    let out = run(&mut ctx, &mut node, vec![a]);
    assert_eq!(out, vec![("a".to_string(), Some(1.0), 1)]);
}

#[test]
fn ties_keep_insertion_order() {
    let mut ctx = ctx();
    let mut node = descending();
    let a = row(&mut ctx, "a", 3.0, 1);
    let b = row(&mut ctx, "b", 2.0, 1);
    let c = row(&mut ctx, "c", 2.0, 1);
    run(&mut ctx, &mut node, vec![a, b]);
    let out = run(&mut ctx, &mut node, vec![c]);
    assert_eq!(
        out,
        vec![("c".to_string(), Some(3.0), 1)],
        "c ties with b but arrived later, so it ranks below"
    );
}

#[test]
fn new_maximum_shifts_every_rank() {
    let mut ctx = ctx();
    let mut node = descending();
    let a = row(&mut ctx, "a", 3.0, 1);
    let b = row(&mut ctx, "b", 2.0, 1);
    let c = row(&mut ctx, "c", 2.0, 1);
    run(&mut ctx, &mut node, vec![a, b, c]);
    let d = row(&mut ctx, "d", 5.0, 1);
    let out = run(&mut ctx, &mut node, vec![d]);
    // d enters at rank 1; a, b, c each retract their old rank and
    // insert the next one down.
    assert_eq!(out.len(), 7);
    assert!(out.contains(&("d".to_string(), Some(1.0), 1)));
    assert!(out.contains(&("a".to_string(), Some(1.0), -1)));
    assert!(out.contains(&("a".to_string(), Some(2.0), 1)));
    assert!(out.contains(&("b".to_string(), Some(2.0), -1)));
    assert!(out.contains(&("b".to_string(), Some(3.0), 1)));
    assert!(out.contains(&("c".to_string(), Some(3.0), -1)));
    assert!(out.contains(&("c".to_string(), Some(4.0), 1)));
}

#[test]
fn retraction_closes_the_gap() {
    let mut ctx = ctx();
    let mut node = descending();
    let a = row(&mut ctx, "a", 3.0, 1);
    let b = row(&mut ctx, "b", 2.0, 1);
    run(&mut ctx, &mut node, vec![a, b]);
    let gone = row(&mut ctx, "a", 3.0, -1);
    let out = run(&mut ctx, &mut node, vec![gone]);
    assert!(out.contains(&("a".to_string(), Some(1.0), -1)));
    assert!(out.contains(&("b".to_string(), Some(2.0), -1)));
    assert!(out.contains(&("b".to_string(), Some(1.0), 1)));
    assert_eq!(out.len(), 3);
}

#[test]
fn ascending_is_the_default_direction() {
    let mut ctx = ctx();
    let mut node = SortNode::new(&[], &[1], &[], 2);
    let a = row(&mut ctx, "a", 3.0, 1);
    let b = row(&mut ctx, "b", 2.0, 1);
    run(&mut ctx, &mut node, vec![a]);
    let out = run(&mut ctx, &mut node, vec![b]);
    // b's smaller score ranks first in ascending order.
    assert!(out.contains(&("b".to_string(), Some(1.0), 1)));
    assert!(out.contains(&("a".to_string(), Some(1.0), -1)));
    assert!(out.contains(&("a".to_string(), Some(2.0), 1)));
}

#[test]
fn groups_sort_independently() {
    let mut ctx = ctx();
    // Group by register 0: each entity is its own tiny ranking.
    let mut node = SortNode::new(&[0], &[1], &[Direction::Down], 2);
    let a = row(&mut ctx, "a", 3.0, 1);
    let b = row(&mut ctx, "b", 9.0, 1);
    run(&mut ctx, &mut node, vec![a]);
    let out = run(&mut ctx, &mut node, vec![b]);
    assert_eq!(
        out,
        vec![("b".to_string(), Some(1.0), 1)],
        "b tops its own group regardless of a"
    );
}
