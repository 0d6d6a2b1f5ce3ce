//! Value dictionary - interning of raw values to dense IDs.
//!
//! Every entity, attribute, and value flowing through the engine is an
//! interned `Id`. The interner keeps two physically separate dictionaries
//! (strings and finite numbers never collide), a reverse array, and a
//! refcount per live ID. Named arenas record IDs for deferred batch
//! release; the `functionOutput` arena always exists.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A dense handle for an interned value.
///
/// Guarantees:
/// - `reverse(intern(x)) == x` while the ID is live
/// - no two distinct raw values share an ID while both are live
/// - `Id::NONE` (zero) is never allocated; it doubles as the `IGNORE`
///   sentinel in patterns and the "unbound" marker in prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(u32);

impl Id {
    /// The ignore/unbound sentinel. Never refers to a stored value.
    pub const NONE: Id = Id(0);

    /// Get the raw u32 value (for debugging/display).
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Id(raw)
    }

    /// True for the ignore/unbound sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True for a real interned handle.
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// A raw value at the engine boundary: a string or a finite number.
/// No other raw types are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Str(String),
    Num(f64),
}

impl RawValue {
    pub fn str(s: impl Into<String>) -> Self {
        RawValue::Str(s.into())
    }

    pub fn num(n: f64) -> Self {
        RawValue::Num(n)
    }

    /// Numbers must be finite to be internable.
    pub fn is_internable(&self) -> bool {
        match self {
            RawValue::Str(_) => true,
            RawValue::Num(n) => n.is_finite(),
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            RawValue::Num(n) => Some(*n),
            RawValue::Str(_) => None,
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Num(n)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Num(n as f64)
    }
}

/// The arena that collects IDs interned for function outputs.
pub const FUNCTION_OUTPUT_ARENA: &str = "functionOutput";

/// Reference-counted value dictionary.
///
/// Strings are keyed directly; numbers are keyed by their IEEE-754 bit
/// pattern so the map never sees a NaN-style non-Eq key (non-finite
/// numbers are rejected before they get here).
pub struct Interner {
    strings: HashMap<String, Id>,
    numbers: HashMap<u64, Id>,
    reverse: Vec<Option<RawValue>>,
    refcounts: Vec<u32>,
    free: Vec<Id>,
    arenas: HashMap<String, Vec<Id>>,
}

impl Interner {
    pub fn new() -> Self {
        let mut arenas = HashMap::new();
        arenas.insert(FUNCTION_OUTPUT_ARENA.to_string(), Vec::new());
        Self {
            strings: HashMap::new(),
            numbers: HashMap::new(),
            // Slot 0 is reserved for Id::NONE.
            reverse: vec![None],
            refcounts: vec![0],
            free: Vec::new(),
            arenas,
        }
    }

    fn allocate(&mut self, value: RawValue) -> Id {
        if let Some(id) = self.free.pop() {
            self.reverse[id.0 as usize] = Some(value);
            self.refcounts[id.0 as usize] = 1;
            return id;
        }
        let id = Id(self.reverse.len() as u32);
        self.reverse.push(Some(value));
        self.refcounts.push(1);
        id
    }

    /// Intern a value, returning its ID and bumping its refcount.
    /// Returns `None` for non-finite numbers.
    pub fn intern(&mut self, value: &RawValue) -> Option<Id> {
        if !value.is_internable() {
            return None;
        }
        match value {
            RawValue::Str(s) => {
                if let Some(&id) = self.strings.get(s.as_str()) {
                    self.refcounts[id.0 as usize] += 1;
                    return Some(id);
                }
                let id = self.allocate(value.clone());
                self.strings.insert(s.clone(), id);
                Some(id)
            }
            RawValue::Num(n) => {
                let bits = n.to_bits();
                if let Some(&id) = self.numbers.get(&bits) {
                    self.refcounts[id.0 as usize] += 1;
                    return Some(id);
                }
                let id = self.allocate(value.clone());
                self.numbers.insert(bits, id);
                Some(id)
            }
        }
    }

    /// Intern a string value. Infallible convenience for the common case.
    pub fn intern_str(&mut self, s: &str) -> Id {
        self.intern(&RawValue::Str(s.to_string()))
            .unwrap_or(Id::NONE)
    }

    /// Intern a finite number. Returns `Id::NONE` for non-finite input.
    pub fn intern_num(&mut self, n: f64) -> Id {
        self.intern(&RawValue::Num(n)).unwrap_or(Id::NONE)
    }

    /// Lookup-only: the ID for a value if it is currently live.
    /// Does not touch refcounts.
    pub fn get(&self, value: &RawValue) -> Option<Id> {
        match value {
            RawValue::Str(s) => self.strings.get(s.as_str()).copied(),
            RawValue::Num(n) => self.numbers.get(&n.to_bits()).copied(),
        }
    }

    /// Resolve an ID back to its raw value.
    pub fn reverse(&self, id: Id) -> Option<&RawValue> {
        self.reverse.get(id.0 as usize).and_then(|v| v.as_ref())
    }

    /// Resolve an ID to a number, if it names one.
    pub fn number(&self, id: Id) -> Option<f64> {
        match self.reverse(id) {
            Some(RawValue::Num(n)) => Some(*n),
            _ => None,
        }
    }

    /// Decrement an ID's refcount; at zero the ID is reclaimed and its
    /// reverse mapping cleared.
    pub fn release(&mut self, id: Id) {
        if id.is_none() || id.0 as usize >= self.refcounts.len() {
            return;
        }
        let slot = id.0 as usize;
        if self.refcounts[slot] == 0 {
            return;
        }
        self.refcounts[slot] -= 1;
        if self.refcounts[slot] == 0 {
            match self.reverse[slot].take() {
                Some(RawValue::Str(s)) => {
                    self.strings.remove(s.as_str());
                }
                Some(RawValue::Num(n)) => {
                    self.numbers.remove(&n.to_bits());
                }
                None => {}
            }
            self.free.push(id);
        }
    }

    /// Make sure a named arena exists.
    pub fn ensure_arena(&mut self, name: &str) {
        if !self.arenas.contains_key(name) {
            self.arenas.insert(name.to_string(), Vec::new());
        }
    }

    /// Intern into a named arena: the arena records the ID so the whole
    /// batch can be released together later.
    pub fn arena_intern(&mut self, arena: &str, value: &RawValue) -> Option<Id> {
        let id = self.intern(value)?;
        self.ensure_arena(arena);
        if let Some(ids) = self.arenas.get_mut(arena) {
            ids.push(id);
        }
        Some(id)
    }

    /// Release every reference a named arena took. Only safe when the
    /// engine that produced those IDs is quiescent; intermediate indexes
    /// may otherwise still refer to them.
    pub fn release_arena(&mut self, name: &str) {
        let ids: SmallVec<[Id; 8]> = match self.arenas.get_mut(name) {
            Some(ids) => ids.drain(..).collect(),
            None => return,
        };
        for id in ids {
            self.release(id);
        }
    }

    /// Current refcount of an ID (for diagnostics).
    pub fn refcount(&self, id: Id) -> u32 {
        self.refcounts.get(id.0 as usize).copied().unwrap_or(0)
    }

    /// Number of live IDs.
    pub fn live(&self) -> usize {
        self.strings.len() + self.numbers.len()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
