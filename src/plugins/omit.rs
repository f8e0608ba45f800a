use super::Plugin;
use crate::error::Result;
use crate::value::{get_in, Draft, Path, Value};

/// Removes the given paths from every persisted snapshot.
///
/// The committed state keeps them. On load each omitted path is restored
/// from the initial state, or left out if the initial state lacks it.
pub struct OmitPaths {
    paths: Vec<Path>,
}

impl OmitPaths {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Path>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl Plugin for OmitPaths {
    fn name(&self) -> &str {
        "omit-paths"
    }

    fn before_persist(&self, state: &Value) -> Result<Option<Value>> {
        let mut draft = Draft::new(state.clone());
        for path in &self.paths {
            draft.remove(path.clone())?;
        }
        if !draft.is_modified() {
            return Ok(None);
        }
        Ok(Some(draft.root().clone()))
    }

    fn on_state_loaded(&self, state: &Value, initial: &Value) -> Result<Option<Value>> {
        let mut draft = Draft::new(state.clone());
        for path in &self.paths {
            match get_in(initial, path.segments()) {
                Some(fallback) => draft.set(path.clone(), fallback.clone()),
                None => {
                    draft.remove(path.clone())?;
                }
            }
        }
        if !draft.is_modified() {
            return Ok(None);
        }
        Ok(Some(draft.root().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_omits_nested_and_top_level_paths() {
        let plugin = OmitPaths::new(["session.token", "draft"]);
        let state = Value::from(json!({
            "session": {"token": "secret", "user": "ada"},
            "draft": "unsaved",
            "count": 1
        }));
        let persisted = plugin.before_persist(&state).unwrap().unwrap();
        assert_eq!(
            persisted.to_plain_json(),
            json!({"session": {"user": "ada"}, "count": 1})
        );
        // Committed state untouched.
        assert_eq!(state["session"]["token"].as_str(), Some("secret"));
    }

    #[test]
    fn test_load_restores_omitted_paths_from_initial() {
        let plugin = OmitPaths::new(["session.token", "draft"]);
        let initial = Value::from(json!({
            "session": {"token": "", "user": "anon"},
            "count": 0
        }));
        let loaded = Value::from(json!({
            "session": {"user": "ada"},
            "draft": "stale",
            "count": 3
        }));
        let restored = plugin.on_state_loaded(&loaded, &initial).unwrap().unwrap();
        assert_eq!(
            restored.to_plain_json(),
            json!({"session": {"token": "", "user": "ada"}, "count": 3})
        );
    }

    #[test]
    fn test_missing_paths_leave_state_alone() {
        let plugin = OmitPaths::new(["nothing.here"]);
        assert!(plugin.before_persist(&Value::from(json!({"a": 1}))).unwrap().is_none());
    }
}
