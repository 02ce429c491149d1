use std::any::Any;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::Output;

/// A type-erased, thread-safe payload.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// An arbitrary in-memory payload carried through the pipeline.
///
/// `Opaque` lets task bodies hand non-serializable artifacts (models,
/// connections, big intermediate buffers) to downstream tasks. Opaque values
/// have no canonical hash, so a parameter holding one can only be declared
/// ignored, and outputs containing one are never persisted.
#[derive(Clone)]
pub struct Opaque {
    inner: Dynamic,
    type_name: &'static str,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Returns a reference to the payload if it is of type `T`.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// The Rust type name of the payload, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Debug for Opaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opaque({})", self.type_name)
    }
}

/// A comparable map key.
///
/// Keys are ordered by their canonical string form, which is also the order
/// in which map entries feed the signature hasher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Key {
    /// The canonical string form used for ordering.
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            Key::Bool(b) => Cow::Owned(b.to_string()),
            Key::Int(n) => Cow::Owned(n.to_string()),
            Key::Str(s) => Cow::Borrowed(s),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Bool(_) => 0,
            Key::Int(_) => 1,
            Key::Str(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        // Canonical form first; the discriminant only breaks ties between
        // keys of different kinds that render identically (e.g. 1 vs "1").
        self.canonical()
            .cmp(&other.canonical())
            .then_with(|| self.rank().cmp(&other.rank()))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key::Bool(b)
    }
}

/// A pipeline value.
///
/// Tasks consume and produce `Value`s; every variant except [`Opaque`] has a
/// canonical hash encoding and a serialized form. An [`Output`] inside a
/// value encodes a dependency edge on the owning task and is substituted
/// with the resolved result before the body runs.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<Key, Value>),
    Set(Vec<Value>),
    Output(Output),
    Opaque(Opaque),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements of a list or tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Key, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<Output> {
        match self {
            Value::Output(out) => Some(*out),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Value::Opaque(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Output(a), Value::Output(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            _ => false,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<Key, Value>> for Value {
    fn from(map: BTreeMap<Key, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<Output> for Value {
    fn from(out: Output) -> Self {
        Value::Output(out)
    }
}

impl From<Opaque> for Value {
    fn from(op: Opaque) -> Self {
        Value::Opaque(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_follows_canonical_form() {
        let mut keys = vec![Key::from("b"), Key::from(10i64), Key::from("a"), Key::from(2i64)];
        keys.sort();

        let canonical: Vec<String> = keys.iter().map(|k| k.canonical().into_owned()).collect();
        assert_eq!(canonical, vec!["10", "2", "a", "b"]);
    }

    #[test]
    fn key_kinds_with_same_rendering_are_distinct() {
        let a = Key::Int(1);
        let b = Key::Str("1".to_string());
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn structural_equality() {
        let a = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        let b = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(a, b);

        // Lists and tuples are different kinds even with equal elements.
        let c = Value::Tuple(vec![Value::Int(1), Value::Str("x".into())]);
        assert_ne!(a, c);
    }

    #[test]
    fn opaque_equality_is_identity() {
        let op = Opaque::new(vec![1u8, 2, 3]);
        let a = Value::Opaque(op.clone());
        let b = Value::Opaque(op);
        assert_eq!(a, b);

        let other = Value::Opaque(Opaque::new(vec![1u8, 2, 3]));
        assert_ne!(a, other);
    }

    #[test]
    fn opaque_downcast() {
        let op = Opaque::new(String::from("model"));
        assert_eq!(op.downcast_ref::<String>().unwrap(), "model");
        assert!(op.downcast_ref::<i64>().is_none());
        assert!(op.type_name().contains("String"));
    }
}
