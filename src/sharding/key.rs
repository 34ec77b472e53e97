//! Shard key values, keys and key patterns.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A document as seen by the sharding layer: top-level field name to value.
pub type Document = BTreeMap<String, KeyValue>;

/// One component of a shard key.
///
/// The derived ordering follows variant order, which is the canonical
/// cross-type document ordering: `MinKey < Null < Int < String < Binary < Bool < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    String(String),
    Binary(Vec<u8>),
    Bool(bool),
    MaxKey,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => f.write_str("MinKey"),
            KeyValue::Null => f.write_str("null"),
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::String(s) => write!(f, "{:?}", s),
            KeyValue::Binary(b) => write!(f, "BinData({} bytes)", b.len()),
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::MaxKey => f.write_str("MaxKey"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::String(v)
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

/// An ordered tuple of key values, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(Vec<KeyValue>);

impl ShardKey {
    /// Create a key from its components.
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str(" }")
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        Self(vec![KeyValue::Int(v)])
    }
}

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        Self(vec![KeyValue::from(v)])
    }
}

impl From<KeyValue> for ShardKey {
    fn from(v: KeyValue) -> Self {
        Self(vec![v])
    }
}

/// Ordered list of document fields that make up the shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    /// Create a pattern over the given fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Project a document onto the pattern. Missing fields become `Null`.
    pub fn extract(&self, doc: &Document) -> ShardKey {
        ShardKey(
            self.fields
                .iter()
                .map(|field| doc.get(field).cloned().unwrap_or(KeyValue::Null))
                .collect(),
        )
    }

    /// Whether the key has exactly one component per pattern field.
    pub fn is_shard_key(&self, key: &ShardKey) -> bool {
        key.len() == self.fields.len()
    }

    /// The smallest key under this pattern.
    pub fn global_min(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MinKey; self.fields.len()])
    }

    /// The largest key under this pattern.
    pub fn global_max(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MaxKey; self.fields.len()])
    }
}
