//! Function registry - pure computations callable from rules.
//!
//! A registered function declares its argument names (ordered), return
//! names (ordered), whether it is multi-valued, whether it is variadic,
//! and optionally a cardinality estimator. Filter functions have no
//! returns; they only accept or reject.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::value::RawValue;

/// What a function invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionEval {
    /// Filter rejected (or a partial function had no result).
    Reject,
    /// Filter accepted; nothing to bind.
    Accept,
    /// One row of return values.
    Row(SmallVec<[RawValue; 2]>),
    /// Several rows (multi-valued functions only).
    Rows(Vec<SmallVec<[RawValue; 2]>>),
}

type FunctionBody = Box<dyn Fn(&[RawValue]) -> FunctionEval>;

pub struct RegisteredFunction {
    pub name: String,
    pub args: Vec<String>,
    pub returns: Vec<String>,
    pub multi: bool,
    pub variadic: bool,
    pub estimate: Option<fn(&[RawValue]) -> usize>,
    body: FunctionBody,
}

impl RegisteredFunction {
    pub fn invoke(&self, inputs: &[RawValue]) -> FunctionEval {
        (self.body)(inputs)
    }

    pub fn is_filter(&self) -> bool {
        self.returns.is_empty()
    }
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("returns", &self.returns)
            .field("multi", &self.multi)
            .field("variadic", &self.variadic)
            .finish()
    }
}

/// Name-keyed registry, populated at startup.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the builtin library.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        args: &[&str],
        returns: &[&str],
        multi: bool,
        variadic: bool,
        body: impl Fn(&[RawValue]) -> FunctionEval + 'static,
    ) {
        self.functions.insert(
            name.to_string(),
            RegisteredFunction {
                name: name.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                returns: returns.iter().map(|s| s.to_string()).collect(),
                multi,
                variadic,
                estimate: None,
                body: Box::new(body),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn nums(inputs: &[RawValue]) -> Option<SmallVec<[f64; 4]>> {
    inputs.iter().map(|v| v.as_num()).collect()
}

fn num_row(n: f64) -> FunctionEval {
    if n.is_finite() {
        FunctionEval::Row(smallvec::smallvec![RawValue::Num(n)])
    } else {
        FunctionEval::Reject
    }
}

fn binary_num(inputs: &[RawValue], op: impl Fn(f64, f64) -> f64) -> FunctionEval {
    match nums(inputs) {
        Some(ns) if ns.len() == 2 => num_row(op(ns[0], ns[1])),
        _ => FunctionEval::Reject,
    }
}

fn filter_num(inputs: &[RawValue], op: impl Fn(f64, f64) -> bool) -> FunctionEval {
    match nums(inputs) {
        Some(ns) if ns.len() == 2 && op(ns[0], ns[1]) => FunctionEval::Accept,
        _ => FunctionEval::Reject,
    }
}

/// The builtin library: arithmetic, string concatenation, a multi-valued
/// range, and comparison filters.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register("math/add", &["a", "b"], &["result"], false, false, |inputs| {
        binary_num(inputs, |a, b| a + b)
    });
    registry.register(
        "math/subtract",
        &["a", "b"],
        &["result"],
        false,
        false,
        |inputs| binary_num(inputs, |a, b| a - b),
    );
    registry.register(
        "math/multiply",
        &["a", "b"],
        &["result"],
        false,
        false,
        |inputs| binary_num(inputs, |a, b| a * b),
    );
    registry.register(
        "math/divide",
        &["a", "b"],
        &["result"],
        false,
        false,
        |inputs| match nums(inputs) {
            Some(ns) if ns.len() == 2 && ns[1] != 0.0 => num_row(ns[0] / ns[1]),
            _ => FunctionEval::Reject,
        },
    );
    registry.register(
        "string/concat",
        &["parts"],
        &["result"],
        false,
        true,
        |inputs| {
            let mut out = String::new();
            for part in inputs {
                match part {
                    RawValue::Str(s) => out.push_str(s),
                    RawValue::Num(n) => {
                        // Integral numbers print without a trailing ".0".
                        if n.fract() == 0.0 && n.abs() < 1e15 {
                            out.push_str(&format!("{}", *n as i64));
                        } else {
                            out.push_str(&format!("{}", n));
                        }
                    }
                }
            }
            FunctionEval::Row(smallvec::smallvec![RawValue::Str(out)])
        },
    );
    registry.register(
        "math/range",
        &["from", "to"],
        &["value"],
        true,
        false,
        |inputs| match nums(inputs) {
            Some(ns) if ns.len() == 2 => {
                let (from, to) = (ns[0] as i64, ns[1] as i64);
                if from > to {
                    return FunctionEval::Rows(Vec::new());
                }
                let rows = (from..=to)
                    .map(|n| smallvec::smallvec![RawValue::Num(n as f64)])
                    .collect();
                FunctionEval::Rows(rows)
            }
            _ => FunctionEval::Reject,
        },
    );
    registry.register("compare/>", &["a", "b"], &[], false, false, |inputs| {
        filter_num(inputs, |a, b| a > b)
    });
    registry.register("compare/<", &["a", "b"], &[], false, false, |inputs| {
        filter_num(inputs, |a, b| a < b)
    });
    registry.register("compare/>=", &["a", "b"], &[], false, false, |inputs| {
        filter_num(inputs, |a, b| a >= b)
    });
    registry.register("compare/<=", &["a", "b"], &[], false, false, |inputs| {
        filter_num(inputs, |a, b| a <= b)
    });
    registry.register("compare/!=", &["a", "b"], &[], false, false, |inputs| {
        if inputs.len() == 2 && inputs[0] != inputs[1] {
            FunctionEval::Accept
        } else {
            FunctionEval::Reject
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_produces_a_row() {
        let registry = FunctionRegistry::with_builtins();
        let add = registry.get("math/add").unwrap();
        let out = add.invoke(&[RawValue::num(2.0), RawValue::num(3.0)]);
        assert_eq!(out, FunctionEval::Row(smallvec::smallvec![RawValue::num(5.0)]));
    }

    #[test]
    fn divide_by_zero_rejects() {
        let registry = FunctionRegistry::with_builtins();
        let div = registry.get("math/divide").unwrap();
        let out = div.invoke(&[RawValue::num(1.0), RawValue::num(0.0)]);
        assert_eq!(out, FunctionEval::Reject);
    }

    #[test]
    fn filters_have_no_returns() {
        let registry = FunctionRegistry::with_builtins();
        let gt = registry.get("compare/>").unwrap();
        assert!(gt.is_filter());
        assert_eq!(
            gt.invoke(&[RawValue::num(2.0), RawValue::num(1.0)]),
            FunctionEval::Accept
        );
        assert_eq!(
            gt.invoke(&[RawValue::num(1.0), RawValue::num(2.0)]),
            FunctionEval::Reject
        );
    }

    #[test]
    fn range_is_multi_valued() {
        let registry = FunctionRegistry::with_builtins();
        let range = registry.get("math/range").unwrap();
        assert!(range.multi);
        match range.invoke(&[RawValue::num(1.0), RawValue::num(3.0)]) {
            FunctionEval::Rows(rows) => assert_eq!(rows.len(), 3),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn concat_is_variadic() {
        let registry = FunctionRegistry::with_builtins();
        let concat = registry.get("string/concat").unwrap();
        assert!(concat.variadic);
        let out = concat.invoke(&[RawValue::str("n-"), RawValue::num(4.0)]);
        assert_eq!(
            out,
            FunctionEval::Row(smallvec::smallvec![RawValue::str("n-4")])
        );
    }

    #[test]
    fn unknown_names_are_absent() {
        let registry = FunctionRegistry::with_builtins();
        assert!(registry.get("no/such").is_none());
    }
}
