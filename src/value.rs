//! The dynamic value model.
//!
//! Every runtime value is a [`Value`]: a tagged union over nil, booleans,
//! numbers, interned symbols, immutable strings, shared arrays and objects,
//! timestamps and function values. Compound values are reference-shared
//! within their arena; moving one across arenas is an explicit, cycle-safe
//! deep copy ([`copy_value`]).

use crate::arena::Buffer;
use crate::engine::{Closure, NativeFn};
use crate::symbol::Symbol;
use crate::{FLOAT, INT};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

/// An immutable, shared string.
///
/// Cloning is a reference-count bump; all mutation goes through building a
/// fresh string (usually in a [`Buffer`]).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImmutableString(Rc<str>);

impl ImmutableString {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ImmutableString {
    fn default() -> Self {
        Self(Rc::from(""))
    }
}

impl std::ops::Deref for ImmutableString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ImmutableString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ImmutableString {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ImmutableString {
    fn from(s: &str) -> Self {
        Self(Rc::from(s))
    }
}

impl From<String> for ImmutableString {
    fn from(s: String) -> Self {
        Self(Rc::from(s))
    }
}

impl From<crate::Identifier> for ImmutableString {
    fn from(s: crate::Identifier) -> Self {
        Self(Rc::from(s.as_str()))
    }
}

impl fmt::Display for ImmutableString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ImmutableString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// A shared, growable array of values.
pub type Array = Rc<RefCell<Vec<Value>>>;

/// A shared object (insertion-ordered map from value to value).
pub type Object = Rc<RefCell<ValueMap>>;

/// A dynamically-typed value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(INT),
    Float(FLOAT),
    Symbol(Symbol),
    Str(ImmutableString),
    Array(Array),
    Object(Object),
    /// Seconds since the POSIX epoch.
    Time(i64),
    Native(Rc<NativeFn>),
    Closure(Rc<Closure>),
}

impl Value {
    /// Wrap a vector as a fresh shared array value.
    #[must_use]
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    /// Wrap a map as a fresh shared object value.
    #[must_use]
    pub fn object(map: ValueMap) -> Self {
        Self::Object(Rc::new(RefCell::new(map)))
    }

    #[must_use]
    pub fn string(s: impl Into<ImmutableString>) -> Self {
        Self::Str(s.into())
    }

    /// Falsy values: nil, false, zero of either numeric type, and the empty
    /// string, array and object. Everything else is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(false) => false,
            Self::Int(0) => false,
            Self::Float(x) => *x != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Array(a) => !a.borrow().is_empty(),
            Self::Object(o) => !o.borrow().is_empty(),
            _ => true,
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// The value's type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Symbol(_) => "symbol",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Time(_) => "time",
            Self::Native(_) | Self::Closure(_) => "function",
        }
    }

    /// Append this value's template output to `buf`.
    ///
    /// Nil and false produce nothing; arrays, objects and functions produce
    /// nothing (collections are rendered with `for`); times print ISO-8601
    /// with the local offset.
    pub fn render(&self, buf: &mut Buffer) {
        use fmt::Write;

        match self {
            Self::Nil | Self::Bool(false) => (),
            Self::Bool(true) => buf.push_str("true"),
            Self::Int(n) => {
                let _ = write!(buf, "{n}");
            }
            Self::Float(x) => {
                let _ = write!(buf, "{x}");
            }
            Self::Symbol(s) => buf.push_str(s.as_str()),
            Self::Str(s) => buf.push_str(s),
            Self::Time(secs) => {
                use chrono::{Local, SecondsFormat, TimeZone};
                if let chrono::LocalResult::Single(dt) = Local.timestamp_opt(*secs, 0) {
                    buf.push_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true));
                }
            }
            Self::Array(_) | Self::Object(_) | Self::Native(_) | Self::Closure(_) => (),
        }
    }

    /// This value's template output as an owned string.
    #[must_use]
    pub fn render_to_string(&self) -> String {
        let mut buf = Buffer::new();
        self.render(&mut buf);
        buf.into_string()
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Nil
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Symbol(s) => write!(f, "{s:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            // Compounds print shallowly; they may contain cycles.
            Self::Array(a) => write!(f, "array[{}]", a.borrow().len()),
            Self::Object(o) => write!(f, "object{{{}}}", o.borrow().len()),
            Self::Time(secs) => write!(f, "time({secs})"),
            Self::Native(n) => write!(f, "native fn {}", n.name()),
            Self::Closure(_) => f.write_str("fn"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<INT> for Value {
    fn from(n: INT) -> Self {
        Self::Int(n)
    }
}

impl From<FLOAT> for Value {
    fn from(x: FLOAT) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::array(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Self::object(map)
    }
}

/// Structural equality.
///
/// Kinds must match; numeric equality does not cross int/float. Arrays are
/// equal when the same length and elementwise equal. Objects are equal when
/// the same size and every key of `a` maps in `b` to an equal value.
/// Function values compare by identity.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Time(x), Value::Time(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (Value::Native(x), Value::Native(y)) => Rc::ptr_eq(x, y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Feed a value into a hasher, consistently with [`values_equal`]: equal
/// values produce equal hashes.
///
/// Arrays and objects hash by tag only. Their contents are mutable, and a
/// content hash would go stale the moment a key is mutated; the map below
/// falls back to equality within a bucket anyway.
pub fn hash_value(value: &Value, state: &mut impl Hasher) {
    match value {
        Value::Nil => state.write_u8(0),
        Value::Bool(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Value::Int(n) => {
            state.write_u8(2);
            state.write_i64(*n);
        }
        Value::Float(x) => {
            state.write_u8(3);
            state.write_u64(x.to_bits());
        }
        Value::Symbol(s) => {
            state.write_u8(4);
            state.write(s.as_str().as_bytes());
        }
        Value::Str(s) => {
            state.write_u8(5);
            state.write(s.as_bytes());
        }
        Value::Array(_) => state.write_u8(6),
        Value::Object(_) => state.write_u8(7),
        Value::Time(secs) => {
            state.write_u8(8);
            state.write_i64(*secs);
        }
        Value::Native(f) => {
            state.write_u8(9);
            state.write_usize(Rc::as_ptr(f) as usize);
        }
        Value::Closure(c) => {
            state.write_u8(10);
            state.write_usize(Rc::as_ptr(c) as *const u8 as usize);
        }
    }
}

/// Deep-copy a value so it no longer shares structure with its source.
///
/// This is the explicit cross-arena boundary: the copy holds no references
/// into the source's arena. A visited-pointer stack keeps shared references
/// shared in the copy and terminates cycles (an array or object inserted
/// into itself copies to a copy inserted into itself).
///
/// Strings and symbols are immutable and interned respectively, so they are
/// shared as-is; so are function values, whose captured environment is kept
/// alive by the reference itself.
#[must_use]
pub fn copy_value(value: &Value) -> Value {
    let mut visited: Vec<(usize, Value)> = Vec::new();
    copy_value_inner(value, &mut visited)
}

fn copy_value_inner(value: &Value, visited: &mut Vec<(usize, Value)>) -> Value {
    match value {
        Value::Array(rc) => {
            let key = Rc::as_ptr(rc) as *const u8 as usize;
            if let Some((_, copy)) = visited.iter().find(|(k, _)| *k == key) {
                return copy.clone();
            }
            let dst: Array = Rc::new(RefCell::new(Vec::with_capacity(rc.borrow().len())));
            visited.push((key, Value::Array(dst.clone())));
            for item in rc.borrow().iter() {
                let copy = copy_value_inner(item, visited);
                dst.borrow_mut().push(copy);
            }
            Value::Array(dst)
        }
        Value::Object(rc) => {
            let key = Rc::as_ptr(rc) as *const u8 as usize;
            if let Some((_, copy)) = visited.iter().find(|(k, _)| *k == key) {
                return copy.clone();
            }
            let dst: Object = Rc::new(RefCell::new(ValueMap::new()));
            visited.push((key, Value::Object(dst.clone())));
            for i in 0.. {
                // Index-based walk: the source borrow must not be held
                // while copying, in case the object references itself.
                let entry = rc.borrow().get_index(i).map(|(k, v)| (k.clone(), v.clone()));
                let Some((k, v)) = entry else { break };
                let k = copy_value_inner(&k, visited);
                let v = copy_value_inner(&v, visited);
                dst.borrow_mut().insert(k, v);
            }
            Value::Object(dst)
        }
        other => other.clone(),
    }
}

/// Entry count at which a [`ValueMap`] starts maintaining a hash index.
const INDEX_THRESHOLD: usize = 16;

/// An insertion-ordered mapping from value to value.
///
/// Entries live in a vector in insertion order. Once the map grows past
/// [`INDEX_THRESHOLD`] a hash index from key hash to entry positions makes
/// lookups O(1); small maps scan linearly. Inserting an existing key
/// replaces the value in place, preserving the entry's position. Removal
/// compacts by shifting.
#[derive(Clone, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
    index: Option<HashMap<u64, SmallVec<[u32; 2]>, ahash::RandomState>>,
    hasher: ahash::RandomState,
}

impl ValueMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_hash(&self, key: &Value) -> u64 {
        let mut h = self.hasher.build_hasher();
        hash_value(key, &mut h);
        h.finish()
    }

    fn position(&self, key: &Value) -> Option<usize> {
        if let Some(index) = &self.index {
            let bucket = index.get(&self.key_hash(key))?;
            bucket
                .iter()
                .map(|&i| i as usize)
                .find(|&i| values_equal(&self.entries[i].0, key))
        } else {
            self.entries.iter().position(|(k, _)| values_equal(k, key))
        }
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    #[must_use]
    pub fn contains_key(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    /// Entry at insertion position `i`.
    #[must_use]
    pub fn get_index(&self, i: usize) -> Option<(&Value, &Value)> {
        self.entries.get(i).map(|(k, v)| (k, v))
    }

    /// Insert or replace. Replacement keeps the entry's original position.
    pub fn insert(&mut self, key: Value, value: Value) {
        if let Some(i) = self.position(&key) {
            self.entries[i].1 = value;
            return;
        }
        let i = self.entries.len();
        if let Some(index) = &mut self.index {
            let mut h = self.hasher.build_hasher();
            hash_value(&key, &mut h);
            index.entry(h.finish()).or_default().push(i as u32);
        }
        self.entries.push((key, value));
        if self.index.is_none() && self.entries.len() > INDEX_THRESHOLD {
            self.build_index();
        }
    }

    /// Remove a key, shifting later entries down.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let i = self.position(key)?;
        let (_, value) = self.entries.remove(i);
        // Positions after `i` all moved; rebuild rather than patch.
        if self.index.is_some() {
            self.build_index();
        }
        Some(value)
    }

    fn build_index(&mut self) {
        let mut index: HashMap<u64, SmallVec<[u32; 2]>, ahash::RandomState> = HashMap::default();
        for (i, (key, _)) in self.entries.iter().enumerate() {
            let mut h = self.hasher.build_hasher();
            hash_value(key, &mut h);
            index.entry(h.finish()).or_default().push(i as u32);
        }
        self.index = Some(index);
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().all(|(k, v)| other.get(k).is_some_and(|w| values_equal(v, w)))
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueMap({} entries)", self.len())
    }
}

impl FromIterator<(Value, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolTable;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::array(vec![]).is_truthy());
        assert!(!Value::object(ValueMap::new()).is_truthy());

        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::Time(0).is_truthy());
    }

    #[test]
    fn equality_is_kind_gated() {
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::string("1"), Value::Int(1));
    }

    #[test]
    fn structural_equality_of_compounds() {
        let a = Value::array(vec![Value::Int(1), Value::string("x")]);
        let b = Value::array(vec![Value::Int(1), Value::string("x")]);
        assert_eq!(a, b);

        let symbols = SymbolTable::new();
        let key = Value::Symbol(symbols.intern("k"));
        let mut m1 = ValueMap::new();
        m1.insert(key.clone(), a.clone());
        let mut m2 = ValueMap::new();
        m2.insert(key, b);
        assert_eq!(Value::object(m1), Value::object(m2));
    }

    #[test]
    fn map_preserves_insertion_order_and_position_on_replace() {
        let mut map = ValueMap::new();
        map.insert(Value::string("a"), Value::Int(1));
        map.insert(Value::string("b"), Value::Int(2));
        map.insert(Value::string("a"), Value::Int(10));
        let keys: Vec<String> = map
            .keys()
            .map(|k| k.render_to_string())
            .collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(map.get(&Value::string("a")), Some(&Value::Int(10)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn map_round_trip_rebuild() {
        let mut map = ValueMap::new();
        for i in 0..40 {
            map.insert(Value::Int(i), Value::Int(i * i));
        }
        // Past the threshold the index is live; lookups must still agree.
        for i in 0..40 {
            assert_eq!(map.get(&Value::Int(i)), Some(&Value::Int(i * i)));
        }
        let rebuilt: ValueMap = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(map, rebuilt);
    }

    #[test]
    fn map_removal_shifts() {
        let mut map = ValueMap::new();
        map.insert(Value::Int(1), Value::string("one"));
        map.insert(Value::Int(2), Value::string("two"));
        map.insert(Value::Int(3), Value::string("three"));
        assert_eq!(map.remove(&Value::Int(2)), Some(Value::string("two")));
        let keys: Vec<Value> = map.keys().cloned().collect();
        assert_eq!(keys, [Value::Int(1), Value::Int(3)]);
        assert!(map.get(&Value::Int(2)).is_none());
    }

    #[test]
    fn copy_value_deep_copies_and_equals() {
        let inner = Value::array(vec![Value::Int(1)]);
        let mut map = ValueMap::new();
        map.insert(Value::string("xs"), inner.clone());
        let original = Value::object(map);

        let copy = copy_value(&original);
        assert_eq!(copy, original);

        // Mutating the copy must not touch the original.
        if let Value::Object(o) = &copy {
            if let Some(Value::Array(a)) = o.borrow().get(&Value::string("xs")) {
                a.borrow_mut().push(Value::Int(2));
            }
        }
        if let Value::Array(a) = &inner {
            assert_eq!(a.borrow().len(), 1);
        }
    }

    #[test]
    fn copy_value_terminates_on_cycles() {
        let arr = Value::array(vec![Value::Int(1)]);
        if let Value::Array(rc) = &arr {
            rc.borrow_mut().push(arr.clone());
        }
        let copy = copy_value(&arr);
        if let (Value::Array(src), Value::Array(dst)) = (&arr, &copy) {
            assert!(!Rc::ptr_eq(src, dst));
            let dst = dst.borrow();
            assert_eq!(dst.len(), 2);
            // The self-reference points at the copy, not the source.
            if let Value::Array(inner) = &dst[1] {
                assert!(Rc::ptr_eq(inner, &match &copy {
                    Value::Array(rc) => rc.clone(),
                    _ => unreachable!(),
                }));
            } else {
                panic!("expected array");
            }
        }
    }

    #[test]
    fn copy_value_preserves_shared_references() {
        let shared = Value::array(vec![Value::Int(7)]);
        let outer = Value::array(vec![shared.clone(), shared.clone()]);
        let copy = copy_value(&outer);
        if let Value::Array(rc) = &copy {
            let items = rc.borrow();
            match (&items[0], &items[1]) {
                (Value::Array(a), Value::Array(b)) => assert!(Rc::ptr_eq(a, b)),
                _ => panic!("expected arrays"),
            }
        }
    }

    #[test]
    fn rendering() {
        assert_eq!(Value::Nil.render_to_string(), "");
        assert_eq!(Value::Bool(false).render_to_string(), "");
        assert_eq!(Value::Bool(true).render_to_string(), "true");
        assert_eq!(Value::Int(-42).render_to_string(), "-42");
        assert_eq!(Value::Float(2.5).render_to_string(), "2.5");
        assert_eq!(Value::string("hi").render_to_string(), "hi");
        assert_eq!(Value::array(vec![Value::Int(1)]).render_to_string(), "");
        assert_eq!(Value::object(ValueMap::new()).render_to_string(), "");
    }

    #[test]
    fn time_renders_iso8601_with_offset() {
        use chrono::{Local, SecondsFormat, TimeZone};

        let secs = 1_700_000_000;
        let expected = match Local.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
            _ => unreachable!(),
        };
        assert_eq!(Value::Time(secs).render_to_string(), expected);
    }
}
