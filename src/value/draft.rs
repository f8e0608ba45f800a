//! Copy-on-write drafts for transactions.
//!
//! A draft starts as a clone of the committed state, so every node is shared
//! with the baseline. Mutations go through `Arc::make_mut`, which copies a
//! node only while it is still shared: the first write along a path copies
//! the spine, later writes along the same spine happen in place. Anything
//! the recipe never touched keeps its identity, which makes the final diff
//! a reference comparison of top-level keys.

use super::equality::same_value;
use super::node::Value;
use super::path::{get_in, get_mut_in, Path, PathSegment};
use crate::action::Action;
use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scratch state handed to a transaction recipe.
pub struct Draft {
    base: Value,
    root: Value,
}

impl Draft {
    pub(crate) fn new(base: Value) -> Self {
        Self {
            root: base.clone(),
            base,
        }
    }

    /// Current draft value at `path` (`Null` when missing).
    pub fn get(&self, path: impl Into<Path>) -> Value {
        let path = path.into();
        get_in(&self.root, path.segments()).cloned().unwrap_or_default()
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Direct mutable access to the whole draft.
    pub fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// Write `value` at `path`, creating missing containers.
    /// Writing a reference-equal value is not a change.
    pub fn set(&mut self, path: impl Into<Path>, value: impl Into<Value>) {
        let path = path.into();
        let value = value.into();
        if let Some(current) = get_in(&self.root, path.segments()) {
            if same_value(current, &value) {
                return;
            }
        }
        if let Some(slot) = get_mut_in(&mut self.root, path.segments(), true) {
            *slot = value;
        }
    }

    /// Mutate the value at `path` in place. The closure works on a clone that
    /// shares structure with the draft, so only what it actually changes is
    /// copied.
    pub fn update<F>(&mut self, path: impl Into<Path>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let path = path.into();
        let mut value = self.get(path.clone());
        f(&mut value)?;
        self.set(path, value);
        Ok(())
    }

    /// Remove the value at `path`. Returns the removed value.
    pub fn remove(&mut self, path: impl Into<Path>) -> Result<Option<Value>> {
        let path = path.into();
        let Some((last, parent)) = path.segments().split_last() else {
            return Ok(None);
        };
        if get_in(&self.root, path.segments()).is_none() {
            return Ok(None);
        }
        let Some(container) = get_mut_in(&mut self.root, parent, false) else {
            return Ok(None);
        };
        match last {
            PathSegment::Key(k) if matches!(container, Value::Map(_)) => {
                container.map_remove(&Value::from(k.as_str()))
            }
            PathSegment::Key(k) => container.remove_key(k),
            PathSegment::Index(i) if container.is_object() => container.remove_key(&i.to_string()),
            PathSegment::Index(i) => container.remove_index(*i).map(Some),
        }
    }

    /// Append to the array at `path`, creating it if missing.
    pub fn push(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.update(path, |slot| {
            if slot.is_null() {
                *slot = Value::array();
            }
            slot.push(value)
        })
    }

    /// Whether the draft differs from its baseline by reference.
    pub fn is_modified(&self) -> bool {
        !same_value(&self.base, &self.root)
    }

    /// Turn the finished draft into the action that commits it.
    ///
    /// `None` when nothing changed. Object roots produce a merge of the
    /// changed top-level keys, or a replacement when keys were removed.
    pub(crate) fn into_action(self) -> Option<Action> {
        if !self.is_modified() {
            return None;
        }
        let keys_removed = match (&self.base, &self.root) {
            (Value::Object(base), Value::Object(root)) => {
                base.keys().any(|k| !root.contains_key(k))
            }
            _ => true,
        };
        if keys_removed {
            return Some(Action::Replace(self.root));
        }

        let (Value::Object(base), Value::Object(root)) = (&self.base, &self.root) else {
            return None;
        };
        let changed: BTreeMap<String, Value> = root
            .iter()
            .filter(|(k, v)| base.get(*k).map(|b| !same_value(b, v)).unwrap_or(true))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if changed.is_empty() {
            None
        } else {
            Some(Action::Merge(Value::Object(Arc::new(changed))))
        }
    }
}
