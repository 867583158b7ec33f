//! Immutable property snapshots
//!
//! Component properties, capability properties and factory overrides are all
//! `PropertyMap`s. A map is never mutated in place: every "update" builds a
//! new snapshot, so a reader holding a clone always sees a consistent view.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    String(String),
    /// Homogeneous or mixed list; filters match if any element matches
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Integer view of the value, if it is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// String view of the value, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Boolean view of the value, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Float(value) => write!(f, "{value}"),
            PropertyValue::String(value) => f.write_str(value),
            PropertyValue::List(values) => {
                f.write_str("[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Immutable, cheaply clonable property snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(Arc<BTreeMap<String, PropertyValue>>);

impl PropertyMap {
    /// An empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by exact key
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Look up a value ignoring ASCII case of the key, as filters do
    pub fn get_ignore_case(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key).or_else(|| {
            self.0
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        })
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// New snapshot with one entry added or replaced
    pub fn with(&self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        let mut entries = (*self.0).clone();
        entries.insert(key.into(), value.into());
        Self(Arc::new(entries))
    }

    /// New snapshot with `overrides` layered over this one
    pub fn merged(&self, overrides: &PropertyMap) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut entries = (*self.0).clone();
        for (key, value) in overrides.iter() {
            entries.insert(key.clone(), value.clone());
        }
        Self(Arc::new(entries))
    }

    /// New snapshot without private (`.`-prefixed) keys
    ///
    /// Private keys configure a component but are never published with the
    /// capability it provides.
    pub fn public(&self) -> Self {
        if !self.0.keys().any(|key| key.starts_with('.')) {
            return self.clone();
        }
        Self(Arc::new(
            self.0
                .iter()
                .filter(|(key, _)| !key.starts_with('.'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ))
    }

    /// Whether two snapshots share the same allocation
    pub fn ptr_eq(&self, other: &PropertyMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<K, V> FromIterator<(K, V)> for PropertyMap
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ))
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyMap {
    fn from(entries: BTreeMap<String, PropertyValue>) -> Self {
        Self(Arc::new(entries))
    }
}
