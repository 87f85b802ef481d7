//! Field values and the payloads that carry them

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::spec::Specifier;

/// A value that can be stored in a record field
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Field name (compact form) → value, for writing several fields at once.
pub type FieldMap = BTreeMap<String, Value>;

/// Versioned field specifiers mapped to values: what changed since some base.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff {
    entries: BTreeMap<Specifier, Value>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: Specifier, value: Value) {
        self.entries.insert(spec, value);
    }

    pub fn get(&self, spec: &Specifier) -> Option<&Value> {
        self.entries.get(spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Specifier, &Value)> {
        self.entries.iter()
    }

    pub fn merge(&mut self, other: Diff) {
        self.entries.extend(other.entries);
    }
}

impl FromIterator<(Specifier, Value)> for Diff {
    fn from_iter<I: IntoIterator<Item = (Specifier, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Diff {
    type Item = (Specifier, Value);
    type IntoIter = std::collections::btree_map::IntoIter<Specifier, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// What a `set` call carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// One field value; the specifier names the field.
    Value(Value),
    /// A batch of fully specified versioned writes.
    Diff(Diff),
    /// Several fields at once; the specifier names no field.
    Fields(FieldMap),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<Diff> for Payload {
    fn from(diff: Diff) -> Self {
        Payload::Diff(diff)
    }
}

impl From<FieldMap> for Payload {
    fn from(fields: FieldMap) -> Self {
        Payload::Fields(fields)
    }
}
