use crate::block::Block;
use crate::change::RawChange;
use crate::constraint::{Constraint, Field, Scan};
use crate::join::JoinNode;
use crate::node::Node;
use crate::output::{OutputKind, OutputNode};
use crate::txn::EvalContext;
use crate::value::RawValue;

pub(crate) fn reg(offset: usize) -> Field {
    Field::Register(offset)
}

pub(crate) fn scan(e: Field, a: Field, v: Field) -> Constraint {
    Constraint::Scan(Scan::new(e, a, v))
}

/// An input fact with the standard test provenance.
pub(crate) fn fact(
    e: impl Into<RawValue>,
    a: impl Into<RawValue>,
    v: impl Into<RawValue>,
) -> RawChange {
    RawChange::new(e, a, v, "input")
}

pub(crate) fn retraction(
    e: impl Into<RawValue>,
    a: impl Into<RawValue>,
    v: impl Into<RawValue>,
) -> RawChange {
    fact(e, a, v).with_count(-1)
}

/// Does `(e, a, v)` hold in the store, looked up by raw value?
pub(crate) fn holds(
    ctx: &EvalContext,
    e: impl Into<RawValue>,
    a: impl Into<RawValue>,
    v: impl Into<RawValue>,
) -> bool {
    let (Some(e), Some(a), Some(v)) = (
        ctx.interner.get(&e.into()),
        ctx.interner.get(&a.into()),
        ctx.interner.get(&v.into()),
    ) else {
        return false;
    };
    ctx.holds(e, a, v)
}

/// A transitive-closure block: `attr(x,y) ∧ attr(y,z) ⇒ attr(x,z)`.
pub(crate) fn closure_block(ctx: &mut EvalContext, id: u32, attr: &str) -> Block {
    let attr_id = ctx.interner.intern_str(attr);
    let n = ctx.interner.intern_str(&format!("rule/closure/{}", id));
    Block::new(
        id,
        "closure",
        3,
        vec![
            Node::Join(JoinNode::new(vec![
                scan(reg(0), Field::Static(attr_id), reg(1)),
                scan(reg(1), Field::Static(attr_id), reg(2)),
            ])),
            Node::Output(OutputNode::insert(
                OutputKind::Bind,
                reg(0),
                Field::Static(attr_id),
                reg(2),
                n,
            )),
        ],
    )
}
