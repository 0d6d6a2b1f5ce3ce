use super::*;
use crate::change::Change;
use crate::constraint::{Constraint, Field, Scan};
use crate::join::JoinNode;
use crate::output::OutputBatch;
use crate::txn::{BlockInfo, EvalContext};
use crate::value::Id;

fn ctx() -> EvalContext {
    let mut ctx = EvalContext::new();
    ctx.transaction = 1;
    ctx
}

fn info() -> BlockInfo {
    BlockInfo {
        id: 1,
        registers: 4,
    }
}

fn prefix_with(regs: &[(usize, Id)], round: u32, count: i64) -> Prefix {
    let mut prefix = Prefix::empty(4, round, count);
    for &(reg, id) in regs {
        prefix.set(reg, id);
    }
    prefix
}

fn name_join(ctx: &mut EvalContext) -> Node {
    let name = ctx.interner.intern_str("name");
    Node::Join(JoinNode::new(vec![Constraint::Scan(Scan::new(
        Field::Register(0),
        Field::Static(name),
        Field::Register(1),
    ))]))
}

fn name_change(ctx: &mut EvalContext, e: &str, v: &str, count: i64) -> Input {
    let e = ctx.interner.intern_str(e);
    let a = ctx.interner.intern_str("name");
    let v = ctx.interner.intern_str(v);
    let n = ctx.interner.intern_str("input");
    Input::Change(Change::new(e, a, v, n, 1, 0, count))
}

// ========== BINARY JOIN ==========

#[test]
fn binary_join_pairs_left_and_right() {
    let mut ctx = ctx();
    let right = name_join(&mut ctx);
    let mut join = BinaryJoin::new(right, &[0], &[1]);
    let e = ctx.interner.intern_str("e");

    // The left prefix arrives before any right: no output yet.
    let input = name_change(&mut ctx, "other", "x", 1);
    let left = ResultBuffer::unit(prefix_with(&[(0, e)], 0, 1));
    let mut out = ResultBuffer::new();
    let mut ops = OutputBatch::default();
    join.exec(&mut ctx, &info(), &input, &left, &mut out, &mut ops)
        .unwrap();
    assert!(out.is_empty(), "no right side for this key yet");

    // Now the right sub-flow fires for e: it meets the buffered left.
    let input = name_change(&mut ctx, "e", "alice", 1);
    let empty = ResultBuffer::new();
    let mut out = ResultBuffer::new();
    join.exec(&mut ctx, &info(), &input, &empty, &mut out, &mut ops)
        .unwrap();
    assert_eq!(out.len(), 1);
    let alice = ctx.interner.intern_str("alice");
    let merged = out.get(0).unwrap();
    assert_eq!(merged.get(0), e);
    assert_eq!(merged.get(1), alice, "the merge register came across");
    assert_eq!(merged.count, 1);
}

#[test]
fn binary_join_multiplies_counts_and_maxes_rounds() {
    let mut ctx = ctx();
    let right = name_join(&mut ctx);
    let mut join = BinaryJoin::new(right, &[0], &[1]);
    let e = ctx.interner.intern_str("e");

    let input = name_change(&mut ctx, "e", "alice", 1);
    let empty = ResultBuffer::new();
    let mut out = ResultBuffer::new();
    let mut ops = OutputBatch::default();
    join.exec(&mut ctx, &info(), &input, &empty, &mut out, &mut ops)
        .unwrap();
    assert!(out.is_empty(), "right side buffered, no left yet");

    // A left with count 2 at round 3 joins the buffered right.
    let unrelated = name_change(&mut ctx, "zzz", "x", 1);
    let left = ResultBuffer::unit(prefix_with(&[(0, e)], 3, 2));
    let mut out = ResultBuffer::new();
    join.exec(&mut ctx, &info(), &unrelated, &left, &mut out, &mut ops)
        .unwrap();
    assert_eq!(out.len(), 1);
    let merged = out.get(0).unwrap();
    assert_eq!(merged.round, 3, "round is the max of the two sides");
    assert_eq!(merged.count, 2, "count is the product");
}

#[test]
fn binary_join_rejects_conflicting_merges() {
    let mut ctx = ctx();
    let right = name_join(&mut ctx);
    let mut join = BinaryJoin::new(right, &[0], &[1]);
    let e = ctx.interner.intern_str("e");
    let bob = ctx.interner.intern_str("bob");

    // Left already binds the merge register to a different value.
    let left = ResultBuffer::unit(prefix_with(&[(0, e), (1, bob)], 0, 1));
    let input = name_change(&mut ctx, "e", "alice", 1);
    let mut out = ResultBuffer::new();
    let mut ops = OutputBatch::default();
    join.exec(&mut ctx, &info(), &input, &left, &mut out, &mut ops)
        .unwrap();
    assert!(out.is_empty(), "bob and alice cannot merge");
}

// ========== ANTIJOIN ==========

#[test]
fn antijoin_emits_when_right_absent() {
    let mut state = AntiJoinState::new(&[0]);
    let e = Id::from_raw(5);
    let mut out = ResultBuffer::new();
    state.push_left(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert_eq!(out.len(), 1, "no right: the left passes");
    assert_eq!(out.get(0).unwrap().count, 1);
}

#[test]
fn antijoin_right_retroactively_negates() {
    let mut state = AntiJoinState::new(&[0]);
    let e = Id::from_raw(5);
    let mut out = ResultBuffer::new();
    state.push_left(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    state.push_right(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert_eq!(out.len(), 2);
    assert_eq!(
        out.get(1).unwrap().count,
        -1,
        "the right arrival cancels the earlier emit"
    );
}

#[test]
fn antijoin_suppresses_when_right_present() {
    let mut state = AntiJoinState::new(&[0]);
    let e = Id::from_raw(5);
    let mut out = ResultBuffer::new();
    state.push_right(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert!(out.is_empty(), "no lefts to negate yet");
    state.push_left(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert!(out.is_empty(), "the key is dominated");
}

#[test]
fn antijoin_right_retraction_revives_lefts() {
    let mut state = AntiJoinState::new(&[0]);
    let e = Id::from_raw(5);
    let mut out = ResultBuffer::new();
    state.push_right(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    state.push_left(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert!(out.is_empty());
    state.push_right(1, &prefix_with(&[(0, e)], 0, -1), &mut out);
    assert_eq!(out.len(), 1, "right went empty: the left comes back");
    assert_eq!(out.get(0).unwrap().count, 1);
}

#[test]
fn antijoin_only_affects_matching_keys() {
    let mut state = AntiJoinState::new(&[0]);
    let e1 = Id::from_raw(5);
    let e2 = Id::from_raw(6);
    let mut out = ResultBuffer::new();
    state.push_right(1, &prefix_with(&[(0, e1)], 0, 1), &mut out);
    state.push_left(1, &prefix_with(&[(0, e2)], 0, 1), &mut out);
    assert_eq!(out.len(), 1, "a different key is not dominated");
}

#[test]
fn antijoin_node_tracks_absence_through_the_engine() {
    use crate::block::Block;
    use crate::node::LinearFlow;
    use crate::output::{OutputKind, OutputNode};
    use crate::test_utils::{fact, holds, reg, scan};
    use crate::txn::{Program, Transaction};

    let mut ctx = EvalContext::new();
    let type_id = ctx.interner.intern_str("type");
    let thing = ctx.interner.intern_str("thing");
    let color = ctx.interner.intern_str("color");
    let status = ctx.interner.intern_str("status");
    let plain = ctx.interner.intern_str("plain");
    let n = ctx.interner.intern_str("rule/plain");
    // Things with no color at all are plain.
    let block = Block::new(
        1,
        "plain-things",
        2,
        vec![
            Node::Join(JoinNode::new(vec![scan(
                reg(0),
                Field::Static(type_id),
                Field::Static(thing),
            )])),
            Node::Anti(AntiJoin::new(
                Node::Linear(LinearFlow::new(vec![Node::Join(JoinNode::new(vec![scan(
                    reg(0),
                    Field::Static(color),
                    reg(1),
                )]))])),
                &[0],
            )),
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                reg(0),
                Field::Static(status),
                Field::Static(plain),
                n,
            )),
        ],
    );
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![
            fact("t1", "type", "thing"),
            fact("t2", "type", "thing"),
            fact("t2", "color", "red"),
        ],
    )
    .unwrap();
    assert!(holds(&ctx, "t1", "status", "plain"));
    assert!(
        !holds(&ctx, "t2", "status", "plain"),
        "t2 has a color, so the antijoin suppressed it"
    );
}

#[test]
fn antijoin_respects_rounds() {
    let mut state = AntiJoinState::new(&[0]);
    let e = Id::from_raw(5);
    let mut out = ResultBuffer::new();
    // Right becomes present at round 2 only.
    state.push_right(1, &prefix_with(&[(0, e)], 2, 1), &mut out);
    state.push_left(1, &prefix_with(&[(0, e)], 0, 1), &mut out);
    assert_eq!(out.len(), 2);
    assert_eq!(
        (out.get(0).unwrap().round, out.get(0).unwrap().count),
        (0, 1),
        "present on rounds 0 and 1"
    );
    assert_eq!(
        (out.get(1).unwrap().round, out.get(1).unwrap().count),
        (2, -1),
        "suppressed from round 2 on"
    );
}
