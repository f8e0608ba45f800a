//! The `Value` tree held by a store.

use crate::error::{ErrorContext, Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use super::equality::deep_equal;

static NULL: Value = Value::Null;

/// An application-defined value that can live inside the state tree.
///
/// Custom values are opaque to the store: they are compared with
/// [`CustomValue::equals`] and persisted only if a matching registration
/// exists in the [`TypeRegistry`](crate::TypeRegistry).
pub trait CustomValue: Any + fmt::Debug + Send + Sync {
    /// Name used to match a type registration.
    fn type_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Structural equality with another custom value.
    fn equals(&self, other: &dyn CustomValue) -> bool;
}

/// A node in the state tree.
///
/// Composite nodes sit behind `Arc`, so cloning is O(1) and two clones of
/// the same node are *reference-equal* (see [`same_value`](super::same_value)).
/// Mutators copy on write: only the node being changed is duplicated, and
/// only if it is shared.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Array(Arc<Vec<Value>>),
    Object(Arc<BTreeMap<String, Value>>),
    /// Insertion-ordered collection of distinct values.
    Set(Arc<Vec<Value>>),
    /// Insertion-ordered key/value pairs with arbitrary keys.
    Map(Arc<Vec<(Value, Value)>>),
    Custom(Arc<dyn CustomValue>),
}

fn kind_error(operation: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::validation(
        format!("expected {}, found {}", expected, found.kind()),
        ErrorContext::new(operation),
    )
}

impl Value {
    /// An empty object.
    pub fn object() -> Self {
        Value::Object(Arc::new(BTreeMap::new()))
    }

    /// An empty array.
    pub fn array() -> Self {
        Value::Array(Arc::new(Vec::new()))
    }

    /// Build an object from key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(Arc::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }

    /// Build a set, dropping members deep-equal to an earlier one.
    pub fn set_of<I: IntoIterator<Item = Value>>(items: I) -> Self {
        let mut members: Vec<Value> = Vec::new();
        for item in items {
            if !members.iter().any(|m| deep_equal(m, &item)) {
                members.push(item);
            }
        }
        Value::Set(Arc::new(members))
    }

    /// Build a map; a later pair with a deep-equal key replaces the earlier value.
    pub fn map_of<I: IntoIterator<Item = (Value, Value)>>(pairs: I) -> Self {
        let mut entries: Vec<(Value, Value)> = Vec::new();
        for (key, value) in pairs {
            match entries.iter_mut().find(|(k, _)| deep_equal(k, &key)) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
        Value::Map(Arc::new(entries))
    }

    pub fn custom<T: CustomValue>(value: T) -> Self {
        Value::Custom(Arc::new(value))
    }

    /// Short name of the node kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Custom(_) => "custom",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Primitives compare by value; everything else by reference.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral numbers only.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(&**s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(&**map),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            Value::Set(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries.as_slice()),
            _ => None,
        }
    }

    /// Downcast a custom node.
    pub fn as_custom<T: CustomValue>(&self) -> Option<&T> {
        match self {
            Value::Custom(c) => c.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Field of an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Number of children for composite nodes, 0 otherwise.
    pub fn len(&self) -> usize {
        match self {
            Value::Array(items) | Value::Set(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::Map(entries) => entries.len(),
            Value::String(s) => s.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set a field on an object, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        match self {
            Value::Object(map) => Ok(Arc::make_mut(map).insert(key.into(), value.into())),
            other => Err(kind_error("insert", "object", other)),
        }
    }

    pub fn remove_key(&mut self, key: &str) -> Result<Option<Value>> {
        match self {
            Value::Object(map) => {
                if !map.contains_key(key) {
                    return Ok(None);
                }
                Ok(Arc::make_mut(map).remove(key))
            }
            other => Err(kind_error("remove_key", "object", other)),
        }
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<()> {
        match self {
            Value::Array(items) => {
                Arc::make_mut(items).push(value.into());
                Ok(())
            }
            other => Err(kind_error("push", "array", other)),
        }
    }

    pub fn remove_index(&mut self, index: usize) -> Result<Value> {
        match self {
            Value::Array(items) if index < items.len() => Ok(Arc::make_mut(items).remove(index)),
            Value::Array(items) => Err(StoreError::validation(
                format!("index {} out of bounds (len {})", index, items.len()),
                ErrorContext::new("remove_index"),
            )),
            other => Err(kind_error("remove_index", "array", other)),
        }
    }

    /// Add a member to a set. Returns false if an equal member was present.
    pub fn set_add(&mut self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        match self {
            Value::Set(items) => {
                if items.iter().any(|m| deep_equal(m, &value)) {
                    return Ok(false);
                }
                Arc::make_mut(items).push(value);
                Ok(true)
            }
            other => Err(kind_error("set_add", "set", other)),
        }
    }

    pub fn set_delete(&mut self, value: &Value) -> Result<bool> {
        match self {
            Value::Set(items) => {
                let position = items.iter().position(|m| deep_equal(m, value));
                match position {
                    Some(pos) => {
                        Arc::make_mut(items).remove(pos);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            other => Err(kind_error("set_delete", "set", other)),
        }
    }

    pub fn set_contains(&self, value: &Value) -> bool {
        self.as_set()
            .map(|items| items.iter().any(|m| deep_equal(m, value)))
            .unwrap_or(false)
    }

    pub fn map_get(&self, key: &Value) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| deep_equal(k, key))
            .map(|(_, v)| v)
    }

    pub fn map_insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Result<Option<Value>> {
        let key = key.into();
        let value = value.into();
        match self {
            Value::Map(entries) => {
                let entries = Arc::make_mut(entries);
                match entries.iter_mut().find(|(k, _)| deep_equal(k, &key)) {
                    Some(entry) => Ok(Some(std::mem::replace(&mut entry.1, value))),
                    None => {
                        entries.push((key, value));
                        Ok(None)
                    }
                }
            }
            other => Err(kind_error("map_insert", "map", other)),
        }
    }

    pub fn map_remove(&mut self, key: &Value) -> Result<Option<Value>> {
        match self {
            Value::Map(entries) => {
                let position = entries.iter().position(|(k, _)| deep_equal(k, key));
                match position {
                    Some(pos) => Ok(Some(Arc::make_mut(entries).remove(pos).1)),
                    None => Ok(None),
                }
            }
            other => Err(kind_error("map_remove", "map", other)),
        }
    }

    /// Lossy projection onto plain JSON: sets become arrays, maps become
    /// arrays of `[key, value]` pairs, custom values become `null`.
    ///
    /// Use the [`TypeRegistry`](crate::TypeRegistry) for a reversible encoding.
    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Custom(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
            Value::Map(entries) => serde_json::Value::Array(
                entries
                    .iter()
                    .map(|(k, v)| serde_json::Value::Array(vec![k.to_plain_json(), v.to_plain_json()]))
                    .collect(),
            ),
        }
    }

    /// Build a value from anything serde can serialize.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Read this value into a typed struct through its plain JSON projection.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_plain_json())
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// JSON has no NaN or infinity; integral numbers are written without a fraction.
pub(crate) fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_equal(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain_json())
    }
}

impl Index<&str> for Value {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }
}

impl Index<usize> for Value {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        self.as_array()
            .and_then(|items| items.get(index))
            .unwrap_or(&NULL)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(items) => {
                Value::Array(Arc::new(items.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(map) => Value::Object(Arc::new(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_from_int!(i32, i64, u32, u64, usize);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(items))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Array(Arc::new(iter.into_iter().collect()))
    }
}
