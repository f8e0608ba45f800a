//! Reversible JSON encoding for values JSON cannot express natively.
//!
//! Values matching a registration are written as
//! `{"__type": <name>, "data": <representation>}`. The representation is
//! itself encoded recursively, so sets of maps of sets survive a round trip.
//! Registrations are checked in order and the first match wins.

use crate::error::{Result, StoreError};
use crate::value::{number_to_json, CustomValue, Value};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Marker key of an encoded value.
pub const TYPE_KEY: &str = "__type";

/// Key holding the encoded representation.
pub const DATA_KEY: &str = "data";

type IsTypeFn = dyn Fn(&Value) -> bool + Send + Sync;
type SerializeFn = dyn Fn(&Value) -> Value + Send + Sync;
type DeserializeFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// How one kind of value is recognized, encoded and restored.
///
/// `serialize` must return a value its own `is_type` rejects, otherwise
/// encoding never terminates.
pub struct TypeRegistration {
    type_name: String,
    is_type: Box<IsTypeFn>,
    serialize: Box<SerializeFn>,
    deserialize: Box<DeserializeFn>,
}

impl TypeRegistration {
    pub fn new<I, S, D>(type_name: impl Into<String>, is_type: I, serialize: S, deserialize: D) -> Self
    where
        I: Fn(&Value) -> bool + Send + Sync + 'static,
        S: Fn(&Value) -> Value + Send + Sync + 'static,
        D: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            is_type: Box::new(is_type),
            serialize: Box::new(serialize),
            deserialize: Box::new(deserialize),
        }
    }

    /// Registration for a custom value type that round-trips through serde.
    pub fn custom<T>(type_name: impl Into<String>) -> Self
    where
        T: CustomValue + Serialize + DeserializeOwned,
    {
        let type_name = type_name.into();
        let name = type_name.clone();
        Self::new(
            type_name,
            |value| value.as_custom::<T>().is_some(),
            move |value| match value.as_custom::<T>().map(Value::from_serialize) {
                Some(Ok(encoded)) => encoded,
                Some(Err(e)) => {
                    warn!(type_name = %name, error = %e, "Failed to encode custom value");
                    Value::Null
                }
                None => Value::Null,
            },
            |data| data.deserialize_into::<T>().map(Value::custom),
        )
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl fmt::Debug for TypeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistration")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

fn set_registration() -> TypeRegistration {
    TypeRegistration::new(
        "Set",
        |value| matches!(value, Value::Set(_)),
        |value| match value {
            Value::Set(items) => Value::Array(Arc::clone(items)),
            _ => Value::Null,
        },
        |data| match data {
            Value::Array(items) => Ok(Value::set_of(items.iter().cloned())),
            other => Err(StoreError::Deserialization(format!(
                "Set data must be an array, found {}",
                other.kind()
            ))),
        },
    )
}

fn map_registration() -> TypeRegistration {
    TypeRegistration::new(
        "Map",
        |value| matches!(value, Value::Map(_)),
        |value| match value {
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| Value::from(vec![k.clone(), v.clone()]))
                .collect(),
            _ => Value::Null,
        },
        |data| {
            let Value::Array(items) = data else {
                return Err(StoreError::Deserialization(format!(
                    "Map data must be an array, found {}",
                    data.kind()
                )));
            };
            let mut pairs = Vec::with_capacity(items.len());
            for item in items.iter() {
                match item.as_array() {
                    Some([k, v]) => pairs.push((k.clone(), v.clone())),
                    _ => {
                        return Err(StoreError::Deserialization(
                            "Map entries must be [key, value] pairs".into(),
                        ))
                    }
                }
            }
            Ok(Value::map_of(pairs))
        },
    )
}

/// Ordered table of [`TypeRegistration`]s.
pub struct TypeRegistry {
    registrations: RwLock<Vec<Arc<TypeRegistration>>>,
}

impl TypeRegistry {
    /// A registry with the built-in `Set` and `Map` registrations.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(set_registration());
        registry.register(map_registration());
        registry
    }

    /// A registry with no registrations at all.
    pub fn empty() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Append a registration. Earlier registrations keep precedence.
    pub fn register(&self, registration: TypeRegistration) {
        self.registrations.write().push(Arc::new(registration));
    }

    pub fn register_custom<T>(&self, type_name: impl Into<String>)
    where
        T: CustomValue + Serialize + DeserializeOwned,
    {
        self.register(TypeRegistration::custom::<T>(type_name));
    }

    /// Registered type names, in precedence order.
    pub fn type_names(&self) -> Vec<String> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.type_name.clone())
            .collect()
    }

    // --- Encoding ---

    /// Encode a value as JSON.
    pub fn serialize(&self, value: &Value) -> serde_json::Value {
        let registrations = self.registrations.read().clone();
        encode(&registrations, value)
    }

    /// Encode a value straight to a JSON string.
    pub fn to_json_string(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(&self.serialize(value))?)
    }

    /// Restore a value from its JSON encoding.
    pub fn deserialize(&self, json: serde_json::Value) -> Value {
        let registrations = self.registrations.read().clone();
        decode(&registrations, json)
    }

    /// Parse and restore a JSON string.
    pub fn from_json_str(&self, text: &str) -> Result<Value> {
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(self.deserialize(json))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

fn encode(registrations: &[Arc<TypeRegistration>], value: &Value) -> serde_json::Value {
    if let Some(registration) = registrations.iter().find(|r| (r.is_type)(value)) {
        let representation = (registration.serialize)(value);
        let mut marker = serde_json::Map::new();
        marker.insert(
            TYPE_KEY.to_string(),
            serde_json::Value::String(registration.type_name.clone()),
        );
        marker.insert(DATA_KEY.to_string(), encode(registrations, &representation));
        return serde_json::Value::Object(marker);
    }

    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => number_to_json(*n),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        Value::Array(items) | Value::Set(items) => serde_json::Value::Array(
            items.iter().map(|item| encode(registrations, item)).collect(),
        ),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode(registrations, v)))
                .collect(),
        ),
        Value::Map(entries) => serde_json::Value::Array(
            entries
                .iter()
                .map(|(k, v)| {
                    serde_json::Value::Array(vec![encode(registrations, k), encode(registrations, v)])
                })
                .collect(),
        ),
        Value::Custom(custom) => {
            warn!(
                type_name = custom.type_name(),
                "No type registration for custom value, persisting null"
            );
            serde_json::Value::Null
        }
    }
}

fn decode(registrations: &[Arc<TypeRegistration>], json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| decode(registrations, item))
            .collect(),
        serde_json::Value::Object(mut map) => {
            let marker = match (map.get(TYPE_KEY), map.contains_key(DATA_KEY)) {
                (Some(serde_json::Value::String(name)), true) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = marker {
                if let Some(registration) = registrations.iter().find(|r| r.type_name == name) {
                    let data = map.remove(DATA_KEY).unwrap_or(serde_json::Value::Null);
                    let data = decode(registrations, data);
                    return match (registration.deserialize)(data.clone()) {
                        Ok(restored) => restored,
                        Err(e) => {
                            warn!(type_name = %name, error = %e, "Failed to restore typed value");
                            Value::from_pairs(vec![(TYPE_KEY, Value::from(name)), (DATA_KEY, data)])
                        }
                    };
                }
            }
            Value::Object(Arc::new(
                map.into_iter()
                    .map(|(k, v)| (k, decode(registrations, v)))
                    .collect(),
            ))
        }
        primitive => Value::from(primitive),
    }
}
