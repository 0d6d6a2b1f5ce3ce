//! Constraints - the relational primitives a join solves.
//!
//! A constraint is one of three variants behind a shared capability
//! set: *scan* (a triple pattern against the index), *function* (a pure
//! computation from the registry), and *move* (an equality bridge).
//! Dispatch is a match per call site; nothing is synthesized at
//! runtime.

use smallvec::SmallVec;

use crate::change::Change;
use crate::function::FunctionEval;
use crate::index::{IndexProposal, PatternField, TripleField};
use crate::prefix::Prefix;
use crate::txn::{EvalContext, EvalError};
use crate::value::{Id, RawValue, FUNCTION_OUTPUT_ARENA};

/// One slot of a scan pattern or an output template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// A concrete interned ID.
    Static(Id),
    /// A register offset in the block's prefix.
    Register(usize),
    /// Unconstrained.
    Ignore,
}

impl Field {
    /// The concrete value under a prefix; `Id::NONE` when unbound or
    /// ignored.
    pub fn value(&self, prefix: &Prefix) -> Id {
        match *self {
            Field::Static(id) => id,
            Field::Register(reg) => prefix.get(reg),
            Field::Ignore => Id::NONE,
        }
    }

    /// How the index should treat this field under a prefix.
    pub fn pattern(&self, prefix: &Prefix) -> PatternField {
        match *self {
            Field::Static(id) => PatternField::Bound(id),
            Field::Register(reg) => {
                let id = prefix.get(reg);
                if id.is_some() {
                    PatternField::Bound(id)
                } else {
                    PatternField::Unbound
                }
            }
            Field::Ignore => PatternField::Ignore,
        }
    }

    pub fn register(&self) -> Option<usize> {
        match *self {
            Field::Register(reg) => Some(reg),
            _ => None,
        }
    }
}

/// A constraint's offer to enumerate one or more unbound registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub cardinality: usize,
    /// The registers a resolved row binds, in row order.
    pub registers: SmallVec<[usize; 2]>,
    /// Nothing to enumerate here.
    pub skip: bool,
}

impl Proposal {
    pub fn skip() -> Self {
        Proposal {
            cardinality: 0,
            registers: SmallVec::new(),
            skip: true,
        }
    }
}

/// A triple pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub e: Field,
    pub a: Field,
    pub v: Field,
    pub n: Field,
}

impl Scan {
    pub fn new(e: Field, a: Field, v: Field) -> Self {
        Self {
            e,
            a,
            v,
            n: Field::Ignore,
        }
    }

    fn fields(&self) -> [&Field; 4] {
        [&self.e, &self.a, &self.v, &self.n]
    }

    fn registers(&self) -> SmallVec<[usize; 4]> {
        let mut out: SmallVec<[usize; 4]> = SmallVec::new();
        for field in self.fields() {
            if let Some(reg) = field.register() {
                if !out.contains(&reg) {
                    out.push(reg);
                }
            }
        }
        out
    }

    /// A change structurally matches when every static field agrees.
    fn is_affected(&self, change: &Change) -> bool {
        let values = [change.e, change.a, change.v, change.n];
        self.fields()
            .iter()
            .zip(values)
            .all(|(field, value)| match **field {
                Field::Static(id) => id == value,
                _ => true,
            })
    }

    /// Bind this scan's registers from a change. Fails when a register
    /// already holds a different value.
    fn apply_input(&self, change: &Change, prefix: &mut Prefix) -> bool {
        let values = [change.e, change.a, change.v, change.n];
        for (field, value) in self.fields().iter().zip(values) {
            if let Field::Register(reg) = **field {
                let current = prefix.get(reg);
                if current.is_some() {
                    if current != value {
                        return false;
                    }
                } else {
                    prefix.set(reg, value);
                }
            }
        }
        true
    }

    fn propose(&self, ctx: &EvalContext, prefix: &Prefix) -> Proposal {
        let (e, a, v) = (
            self.e.pattern(prefix),
            self.a.pattern(prefix),
            self.v.pattern(prefix),
        );
        let IndexProposal {
            field,
            cardinality,
            skip,
        } = ctx.index.propose(e, a, v);
        if skip {
            return Proposal::skip();
        }
        let target = match field {
            TripleField::E => &self.e,
            TripleField::A => &self.a,
            TripleField::V => &self.v,
        };
        match target.register() {
            Some(reg) => Proposal {
                cardinality,
                registers: smallvec::smallvec![reg],
                skip: false,
            },
            None => Proposal::skip(),
        }
    }

    fn resolve_proposal(
        &self,
        ctx: &EvalContext,
        prefix: &Prefix,
        proposal: &Proposal,
    ) -> Vec<SmallVec<[Id; 2]>> {
        let (e, a, v) = (
            self.e.pattern(prefix),
            self.a.pattern(prefix),
            self.v.pattern(prefix),
        );
        let register = proposal.registers[0];
        let field = if self.e.register() == Some(register) && matches!(e, PatternField::Unbound) {
            TripleField::E
        } else if self.a.register() == Some(register) && matches!(a, PatternField::Unbound) {
            TripleField::A
        } else {
            TripleField::V
        };
        ctx.index
            .resolve(e, a, v, field)
            .into_iter()
            .map(|id| smallvec::smallvec![id])
            .collect()
    }

    /// Point check through the index. Unbound registers act as
    /// wildcards, so a partially-resolved scan still prunes.
    fn accept(&self, ctx: &EvalContext, prefix: &Prefix, solving: &[usize]) -> bool {
        let mine = self.registers();
        if !solving.is_empty() && !solving.iter().any(|reg| mine.contains(reg)) {
            return true;
        }
        ctx.index.check(
            self.e.value(prefix),
            self.a.value(prefix),
            self.v.value(prefix),
            self.n.value(prefix),
            ctx.transaction,
            u32::MAX,
        )
    }

    fn get_diffs(&self, ctx: &EvalContext, prefix: &Prefix) -> SmallVec<[i32; 4]> {
        ctx.index.get_diffs(
            self.e.value(prefix),
            self.a.value(prefix),
            self.v.value(prefix),
            self.n.value(prefix),
            ctx.transaction,
        )
    }
}

/// A pure (possibly multi-valued, possibly variadic) computation with
/// named inputs and outputs, registered by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionConstraint {
    pub name: String,
    pub inputs: SmallVec<[Field; 4]>,
    pub outputs: SmallVec<[usize; 2]>,
}

impl FunctionConstraint {
    pub fn new(name: &str, inputs: &[Field], outputs: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
        }
    }

    fn registers(&self) -> SmallVec<[usize; 4]> {
        let mut out: SmallVec<[usize; 4]> = SmallVec::new();
        for field in self.inputs.iter() {
            if let Some(reg) = field.register() {
                if !out.contains(&reg) {
                    out.push(reg);
                }
            }
        }
        for &reg in self.outputs.iter() {
            if !out.contains(&reg) {
                out.push(reg);
            }
        }
        out
    }

    fn inputs_bound(&self, prefix: &Prefix) -> bool {
        self.inputs.iter().all(|f| f.value(prefix).is_some())
    }

    fn resolve_inputs(
        &self,
        ctx: &EvalContext,
        prefix: &Prefix,
    ) -> Option<SmallVec<[RawValue; 4]>> {
        self.inputs
            .iter()
            .map(|f| ctx.interner.reverse(f.value(prefix)).cloned())
            .collect()
    }

    fn propose(&self, ctx: &EvalContext, prefix: &Prefix) -> Proposal {
        if !self.inputs_bound(prefix) {
            return Proposal::skip();
        }
        let unbound: SmallVec<[usize; 2]> = self
            .outputs
            .iter()
            .copied()
            .filter(|&reg| !prefix.is_bound(reg))
            .collect();
        if unbound.is_empty() {
            return Proposal::skip();
        }
        let cardinality = match ctx.functions.get(&self.name) {
            Some(func) => match func.estimate {
                Some(estimate) => self
                    .resolve_inputs(ctx, prefix)
                    .map(|inputs| estimate(&inputs))
                    .unwrap_or(1),
                None => 1,
            },
            None => 1,
        };
        Proposal {
            cardinality,
            registers: unbound,
            skip: false,
        }
    }

    /// Invoke the function and intern its outputs, producing one row of
    /// IDs per result for the proposal's registers.
    fn resolve_proposal(
        &self,
        ctx: &mut EvalContext,
        prefix: &Prefix,
        proposal: &Proposal,
    ) -> Result<Vec<SmallVec<[Id; 2]>>, EvalError> {
        if ctx.functions.get(&self.name).is_none() {
            return Err(EvalError::UnknownFunction(self.name.clone()));
        }
        let Some(inputs) = self.resolve_inputs(ctx, prefix) else {
            return Ok(Vec::new());
        };
        let eval = match ctx.functions.get(&self.name) {
            Some(func) => func.invoke(&inputs),
            None => FunctionEval::Reject,
        };
        let rows: Vec<SmallVec<[RawValue; 2]>> = match eval {
            FunctionEval::Reject | FunctionEval::Accept => Vec::new(),
            FunctionEval::Row(row) => vec![row],
            FunctionEval::Rows(rows) => rows,
        };
        let mut out = Vec::with_capacity(rows.len());
        'rows: for row in rows {
            if row.len() != self.outputs.len() {
                continue;
            }
            let mut ids: SmallVec<[Id; 2]> = SmallVec::new();
            for (&reg, value) in self.outputs.iter().zip(row.iter()) {
                let Some(id) = ctx.interner.arena_intern(FUNCTION_OUTPUT_ARENA, value) else {
                    continue 'rows;
                };
                // An already-bound output register turns into a check.
                if proposal.registers.contains(&reg) {
                    ids.push(id);
                } else if prefix.get(reg) != id {
                    continue 'rows;
                }
            }
            out.push(ids);
        }
        Ok(out)
    }

    /// Recompute and compare against a fully-bound prefix. Partially
    /// bound prefixes pass; the proposal machinery will finish them.
    fn accept(
        &self,
        ctx: &EvalContext,
        prefix: &Prefix,
        solving: &[usize],
    ) -> Result<bool, EvalError> {
        let mine = self.registers();
        if !solving.is_empty() && !solving.iter().any(|reg| mine.contains(reg)) {
            return Ok(true);
        }
        if !self.inputs_bound(prefix) {
            return Ok(true);
        }
        if self.outputs.iter().any(|&reg| !prefix.is_bound(reg)) {
            return Ok(true);
        }
        let func = ctx
            .functions
            .get(&self.name)
            .ok_or_else(|| EvalError::UnknownFunction(self.name.clone()))?;
        let Some(inputs) = self.resolve_inputs(ctx, prefix) else {
            return Ok(false);
        };
        match func.invoke(&inputs) {
            FunctionEval::Reject => Ok(false),
            FunctionEval::Accept => Ok(true),
            FunctionEval::Row(row) => Ok(self.row_matches(ctx, prefix, &row)),
            FunctionEval::Rows(rows) => {
                Ok(rows.iter().any(|row| self.row_matches(ctx, prefix, row)))
            }
        }
    }

    fn row_matches(&self, ctx: &EvalContext, prefix: &Prefix, row: &[RawValue]) -> bool {
        if row.len() != self.outputs.len() {
            return false;
        }
        self.outputs.iter().zip(row.iter()).all(|(&reg, value)| {
            ctx.interner
                .get(value)
                .is_some_and(|id| prefix.get(reg) == id)
        })
    }
}

/// An equality bridge from a source to a destination register: proposes
/// exactly when the source is known and the destination is not,
/// otherwise acts as an equality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveConstraint {
    pub from: Field,
    pub to: usize,
}

impl MoveConstraint {
    pub fn new(from: Field, to: usize) -> Self {
        Self { from, to }
    }

    /// True when the source is a static value: the whole move can run
    /// without any input.
    pub fn is_static(&self) -> bool {
        matches!(self.from, Field::Static(_))
    }

    fn registers(&self) -> SmallVec<[usize; 4]> {
        let mut out: SmallVec<[usize; 4]> = SmallVec::new();
        if let Some(reg) = self.from.register() {
            out.push(reg);
        }
        if !out.contains(&self.to) {
            out.push(self.to);
        }
        out
    }

    fn propose(&self, prefix: &Prefix) -> Proposal {
        let source = self.from.value(prefix);
        if source.is_some() && !prefix.is_bound(self.to) {
            Proposal {
                cardinality: 1,
                registers: smallvec::smallvec![self.to],
                skip: false,
            }
        } else {
            Proposal::skip()
        }
    }

    fn resolve_proposal(&self, prefix: &Prefix) -> Vec<SmallVec<[Id; 2]>> {
        let source = self.from.value(prefix);
        if source.is_some() {
            vec![smallvec::smallvec![source]]
        } else {
            Vec::new()
        }
    }

    fn accept(&self, prefix: &Prefix, solving: &[usize]) -> bool {
        let mine = self.registers();
        if !solving.is_empty() && !solving.iter().any(|reg| mine.contains(reg)) {
            return true;
        }
        let source = self.from.value(prefix);
        let dest = prefix.get(self.to);
        if source.is_none() || dest.is_none() {
            return true;
        }
        source == dest
    }
}

/// The polymorphic primitive a join node runs over.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Scan(Scan),
    Function(FunctionConstraint),
    Move(MoveConstraint),
}

impl Constraint {
    /// All register offsets this constraint touches.
    pub fn registers(&self) -> SmallVec<[usize; 4]> {
        match self {
            Constraint::Scan(scan) => scan.registers(),
            Constraint::Function(func) => func.registers(),
            Constraint::Move(mv) => mv.registers(),
        }
    }

    /// Could this input change flow through this constraint? Functions
    /// and moves never scan the store, so they are never affected.
    pub fn is_affected(&self, change: &Change) -> bool {
        match self {
            Constraint::Scan(scan) => scan.is_affected(change),
            Constraint::Function(_) | Constraint::Move(_) => false,
        }
    }

    /// Write the change's values into the prefix registers. Only
    /// meaningful for scans.
    pub fn apply_input(&self, change: &Change, prefix: &mut Prefix) -> bool {
        match self {
            Constraint::Scan(scan) => scan.apply_input(change, prefix),
            Constraint::Function(_) | Constraint::Move(_) => true,
        }
    }

    pub fn propose(&self, ctx: &EvalContext, prefix: &Prefix) -> Proposal {
        match self {
            Constraint::Scan(scan) => scan.propose(ctx, prefix),
            Constraint::Function(func) => func.propose(ctx, prefix),
            Constraint::Move(mv) => mv.propose(prefix),
        }
    }

    pub fn resolve_proposal(
        &self,
        ctx: &mut EvalContext,
        prefix: &Prefix,
        proposal: &Proposal,
    ) -> Result<Vec<SmallVec<[Id; 2]>>, EvalError> {
        match self {
            Constraint::Scan(scan) => Ok(scan.resolve_proposal(ctx, prefix, proposal)),
            Constraint::Function(func) => func.resolve_proposal(ctx, prefix, proposal),
            Constraint::Move(mv) => Ok(mv.resolve_proposal(prefix)),
        }
    }

    pub fn accept(
        &self,
        ctx: &EvalContext,
        prefix: &Prefix,
        solving: &[usize],
    ) -> Result<bool, EvalError> {
        match self {
            Constraint::Scan(scan) => Ok(scan.accept(ctx, prefix, solving)),
            Constraint::Function(func) => func.accept(ctx, prefix, solving),
            Constraint::Move(mv) => Ok(mv.accept(prefix, solving)),
        }
    }

    /// The round array for a fully-resolved triple pattern. Functions
    /// and moves contribute nothing to multiplicity composition.
    pub fn get_diffs(&self, ctx: &EvalContext, prefix: &Prefix) -> Option<SmallVec<[i32; 4]>> {
        match self {
            Constraint::Scan(scan) => Some(scan.get_diffs(ctx, prefix)),
            Constraint::Function(_) | Constraint::Move(_) => None,
        }
    }

    /// An all-static move; the building block of static joins.
    pub fn is_static_move(&self) -> bool {
        matches!(self, Constraint::Move(mv) if mv.is_static())
    }
}

#[cfg(test)]
#[path = "tests/constraint.rs"]
mod tests;
