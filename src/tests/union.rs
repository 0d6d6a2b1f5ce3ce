use crate::block::Block;
use crate::constraint::Field;
use crate::flow::BinaryJoin;
use crate::join::JoinNode;
use crate::node::Node;
use crate::output::{OutputKind, OutputNode};
use crate::test_utils::{fact, holds, reg, retraction, scan};
use crate::txn::{EvalContext, Program, Transaction};
use crate::union::{ChooseFlow, UnionFlow};

/// registers: 0 = entity, 1 = chosen value.
/// Outer: things. Branch one: the thing's color. Branch two: its size.
fn branch(ctx: &mut EvalContext, attr: &str) -> BinaryJoin {
    let attr_id = ctx.interner.intern_str(attr);
    BinaryJoin::new(
        Node::Join(JoinNode::new(vec![scan(
            reg(0),
            Field::Static(attr_id),
            reg(1),
        )])),
        &[0],
        &[1],
    )
}

fn picker_block(ctx: &mut EvalContext, id: u32, exclusive: bool) -> Block {
    let type_id = ctx.interner.intern_str("type");
    let thing = ctx.interner.intern_str("thing");
    let picked = ctx.interner.intern_str("picked");
    let n = ctx.interner.intern_str("rule/picker");
    let branches = vec![branch(ctx, "color"), branch(ctx, "size")];
    let flow = if exclusive {
        Node::Choose(ChooseFlow::new(branches))
    } else {
        Node::Union(UnionFlow::new(branches))
    };
    Block::new(
        id,
        "picker",
        2,
        vec![
            Node::Join(JoinNode::new(vec![scan(
                reg(0),
                Field::Static(type_id),
                Field::Static(thing),
            )])),
            flow,
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                reg(0),
                Field::Static(picked),
                reg(1),
                n,
            )),
        ],
    )
}

#[test]
fn union_emits_every_branch() {
    let mut ctx = EvalContext::new();
    let block = picker_block(&mut ctx, 1, false);
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![
            fact("t1", "type", "thing"),
            fact("t1", "color", "red"),
            fact("t1", "size", "big"),
        ],
    )
    .unwrap();
    assert!(holds(&ctx, "t1", "picked", "red"));
    assert!(holds(&ctx, "t1", "picked", "big"), "union keeps both");
}

#[test]
fn choose_takes_the_first_matching_branch() {
    let mut ctx = EvalContext::new();
    let block = picker_block(&mut ctx, 1, true);
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![
            fact("t1", "type", "thing"),
            fact("t1", "color", "red"),
            fact("t1", "size", "big"),
        ],
    )
    .unwrap();
    assert!(holds(&ctx, "t1", "picked", "red"));
    assert!(
        !holds(&ctx, "t1", "picked", "big"),
        "the second branch is suppressed while the first matches"
    );
}

#[test]
fn choose_falls_through_when_first_branch_never_matches() {
    let mut ctx = EvalContext::new();
    let block = picker_block(&mut ctx, 1, true);
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![fact("t2", "type", "thing"), fact("t2", "size", "small")],
    )
    .unwrap();
    assert!(holds(&ctx, "t2", "picked", "small"));
}

#[test]
fn choose_reattributes_when_the_first_branch_retracts() {
    let mut ctx = EvalContext::new();
    let block = picker_block(&mut ctx, 1, true);
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![
            fact("t1", "type", "thing"),
            fact("t1", "color", "red"),
            fact("t1", "size", "big"),
        ],
    )
    .unwrap();
    Transaction::exec(&mut ctx, &mut program, vec![retraction("t1", "color", "red")]).unwrap();
    assert!(
        !holds(&ctx, "t1", "picked", "red"),
        "the retracted branch lets go"
    );
    assert!(
        holds(&ctx, "t1", "picked", "big"),
        "the next branch takes over"
    );
}

#[test]
fn choose_with_one_branch_behaves_like_union() {
    let mut ctx = EvalContext::new();
    let type_id = ctx.interner.intern_str("type");
    let thing = ctx.interner.intern_str("thing");
    let picked = ctx.interner.intern_str("picked");
    let n = ctx.interner.intern_str("rule/solo");
    let branches = vec![branch(&mut ctx, "color")];
    let block = Block::new(
        1,
        "solo",
        2,
        vec![
            Node::Join(JoinNode::new(vec![scan(
                reg(0),
                Field::Static(type_id),
                Field::Static(thing),
            )])),
            Node::Choose(ChooseFlow::new(branches)),
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                reg(0),
                Field::Static(picked),
                reg(1),
                n,
            )),
        ],
    );
    let mut program = Program::new().with_block(block);
    Transaction::exec(
        &mut ctx,
        &mut program,
        vec![fact("t1", "type", "thing"), fact("t1", "color", "red")],
    )
    .unwrap();
    assert!(holds(&ctx, "t1", "picked", "red"));
}
