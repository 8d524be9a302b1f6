//! Property value type.
//!
//! Every value that can live on a node or edge, travel inside an event, or
//! ride an impulse between synapses. The set is deliberately closed so the
//! mutation log stays replayable: scalars, ordered sequences, and ordered
//! mappings of the same.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A legal property value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// The taxonomy of value shapes, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Type checking
// ============================================================================

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Why this value cannot be stored as a property, if it can't.
    ///
    /// A stored value must not be `Null` at the top level (absence is
    /// expressed by deleting the property) and must not contain NaN
    /// anywhere, since NaN never compares equal to itself and would break
    /// the no-op-on-equal rule that makes replay idempotent.
    pub fn storable_error(&self) -> Option<String> {
        if self.is_null() {
            return Some("NULL cannot be stored; delete the property instead".into());
        }
        self.nan_path().map(|path| format!("NaN float at {path}"))
    }

    fn nan_path(&self) -> Option<String> {
        match self {
            Value::Float(f) if f.is_nan() => Some("$".into()),
            Value::List(items) => items.iter().enumerate().find_map(|(i, v)| {
                v.nan_path().map(|p| p.replacen('$', &format!("$[{i}]"), 1))
            }),
            Value::Map(m) => m.iter().find_map(|(k, v)| {
                v.nan_path().map(|p| p.replacen('$', &format!("$.{k}"), 1))
            }),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

// ============================================================================
// Equality and hashing (values key the property indices)
// ============================================================================

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => float_bits(*f).hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::List(l) => l.hash(state),
            Value::Map(m) => m.hash(state),
        }
    }
}

/// Bit pattern used for float equality; `-0.0` folds onto `0.0`.
fn float_bits(f: f64) -> u64 {
    if f == 0.0 { 0.0f64.to_bits() } else { f.to_bits() }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<u32> for Value { fn from(v: u32) -> Self { Value::Int(v as i64) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_owned()) } }
impl From<Vec<u8>> for Value { fn from(v: Vec<u8>) -> Self { Value::Bytes(v) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Value::List(v) } }
impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self { Value::Map(v) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(Value::Null) }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Value::Bytes(b) => write!(f, "<bytes[{}]>", b.len()),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
        assert_eq!(Value::from(42), Value::Int(42));
        assert_eq!(Value::from(3.5), Value::Float(3.5));
        assert_eq!(Value::from(true), Value::Bool(true));
    }

    #[test]
    fn test_equality_is_on_semantic_type() {
        assert_ne!(Value::Int(8), Value::Float(8.0));
        assert_ne!(Value::from("8"), Value::Int(8));
    }

    #[test]
    fn test_signed_zero_hashes_together() {
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(hash_of(&Value::Float(0.0)), hash_of(&Value::Float(-0.0)));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Value::Int(1).kind().to_string(), "int");
        assert_eq!(Value::from("x").kind().to_string(), "string");
        assert_eq!(Value::List(vec![]).kind().to_string(), "list");
        assert_eq!(ValueKind::Null.to_string(), "null");
    }

    #[test]
    fn test_storable() {
        assert!(Value::Int(1).storable_error().is_none());
        assert!(Value::Null.storable_error().is_some());

        let nested = Value::List(vec![Value::Int(1), Value::Float(f64::NAN)]);
        let err = nested.storable_error().unwrap();
        assert!(err.contains("$[1]"), "{err}");

        let mut m = BTreeMap::new();
        m.insert("inner".to_string(), Value::Null);
        assert!(Value::Map(m).storable_error().is_none());
    }
}
