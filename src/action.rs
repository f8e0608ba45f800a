//! Requested state changes.

use crate::error::{ErrorContext, Result, StoreError};
use crate::value::Value;
use std::sync::Arc;

/// A change requested through [`Store::dispatch`](crate::Store::dispatch).
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Shallow top-level merge of an object into the state.
    Merge(Value),
    /// Wholesale replacement of the state.
    Replace(Value),
}

impl Action {
    pub fn merge(payload: impl Into<Value>) -> Self {
        Action::Merge(payload.into())
    }

    pub fn replace(state: impl Into<Value>) -> Self {
        Action::Replace(state.into())
    }

    pub fn payload(&self) -> &Value {
        match self {
            Action::Merge(v) | Action::Replace(v) => v,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Action::Merge(v) | Action::Replace(v) => v,
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, Action::Replace(_))
    }

    /// An empty merge changes nothing and is skipped entirely.
    pub fn is_noop(&self) -> bool {
        matches!(self, Action::Merge(Value::Object(map)) if map.is_empty())
    }

    /// Compute the state that results from applying this action to `state`.
    ///
    /// Returns `Ok(None)` for an empty merge.
    pub fn apply(&self, state: &Value) -> Result<Option<Value>> {
        match self {
            Action::Replace(next) => Ok(Some(next.clone())),
            Action::Merge(payload) => {
                if self.is_noop() {
                    return Ok(None);
                }
                merge_objects(state, payload, "dispatch").map(Some)
            }
        }
    }

    /// Fold a queue of actions into one: merges combine with later keys
    /// winning, a replacement resets the fold.
    pub fn fold(actions: impl IntoIterator<Item = Action>) -> Result<Option<Action>> {
        let mut folded: Option<Action> = None;
        for action in actions {
            folded = Some(match (folded, action) {
                (_, Action::Replace(next)) => Action::Replace(next),
                (None, merge) => merge,
                (Some(Action::Merge(acc)), Action::Merge(next)) => {
                    Action::Merge(merge_objects(&acc, &next, "batch")?)
                }
                (Some(Action::Replace(acc)), Action::Merge(next)) => {
                    Action::Replace(merge_objects(&acc, &next, "batch")?)
                }
            });
        }
        Ok(folded)
    }
}

fn merge_objects(base: &Value, payload: &Value, operation: &str) -> Result<Value> {
    let Value::Object(fields) = payload else {
        return Err(StoreError::validation(
            format!("merge payload must be an object, found {}", payload.kind()),
            ErrorContext::new(operation),
        ));
    };
    let Value::Object(existing) = base else {
        return Err(StoreError::validation(
            format!("cannot merge into {} state", base.kind()),
            ErrorContext::new(operation),
        ));
    };
    if fields.is_empty() {
        return Ok(base.clone());
    }
    let mut merged = Arc::clone(existing);
    let map = Arc::make_mut(&mut merged);
    for (key, value) in fields.iter() {
        map.insert(key.clone(), value.clone());
    }
    Ok(Value::Object(merged))
}

impl From<Value> for Action {
    fn from(payload: Value) -> Self {
        Action::Merge(payload)
    }
}

impl From<serde_json::Value> for Action {
    fn from(payload: serde_json::Value) -> Self {
        Action::Merge(Value::from(payload))
    }
}
