//! Paths into the state tree and structurally-sharing path updates.

use super::equality::deep_equal;
use super::node::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One step of a [`Path`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

/// A location in the state tree.
///
/// Parsed from dotted strings: `"todos.0.title"` is
/// `[Key("todos"), Index(0), Key("title")]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn new() -> Self {
        Path(Vec::new())
    }

    /// Parse a dotted path. All-digit segments become indices.
    pub fn parse(dotted: &str) -> Self {
        Path(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(i) if s.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(i),
                    _ => PathSegment::Key(s.to_string()),
                })
                .collect(),
        )
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn first(&self) -> Option<&PathSegment> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Path {
    fn from(dotted: &str) -> Self {
        Path::parse(dotted)
    }
}

impl From<String> for Path {
    fn from(dotted: String) -> Self {
        Path::parse(&dotted)
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }
}

impl From<&[PathSegment]> for Path {
    fn from(segments: &[PathSegment]) -> Self {
        Path(segments.to_vec())
    }
}

impl FromIterator<PathSegment> for Path {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// Read the value at `path`. `None` if any step is missing.
pub fn get_in<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut node = root;
    for segment in path {
        node = match (segment, node) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
            (PathSegment::Key(k), Value::Map(_)) => node.map_get(&Value::from(k.as_str()))?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(node)
}

/// Return a new root with `new_value` at `path`.
///
/// Only the spine from the root to the leaf is copied; every sibling keeps
/// its identity. Missing or non-container intermediates are replaced by an
/// array when the next segment is an index and an object otherwise.
pub fn set_in(node: &Value, path: &[PathSegment], new_value: Value) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return new_value;
    };

    match (head, node) {
        (PathSegment::Index(i), Value::Array(items)) => {
            let mut items = (**items).clone();
            if items.len() <= *i {
                items.resize(*i + 1, Value::Null);
            }
            let child = set_in(&items[*i], rest, new_value);
            items[*i] = child;
            Value::Array(Arc::new(items))
        }
        (PathSegment::Index(i), Value::Object(map)) => {
            set_object_field(map, i.to_string(), rest, new_value)
        }
        (PathSegment::Index(i), _) => {
            let mut items = vec![Value::Null; *i + 1];
            items[*i] = set_in(&Value::Null, rest, new_value);
            Value::Array(Arc::new(items))
        }
        (PathSegment::Key(k), Value::Object(map)) => set_object_field(map, k.clone(), rest, new_value),
        (PathSegment::Key(k), Value::Map(entries)) => {
            let key = Value::from(k.as_str());
            let mut entries = (**entries).clone();
            match entries.iter_mut().find(|(existing, _)| deep_equal(existing, &key)) {
                Some(entry) => entry.1 = set_in(&entry.1, rest, new_value),
                None => entries.push((key, set_in(&Value::Null, rest, new_value))),
            }
            Value::Map(Arc::new(entries))
        }
        (PathSegment::Key(k), _) => {
            let mut map = BTreeMap::new();
            map.insert(k.clone(), set_in(&Value::Null, rest, new_value));
            Value::Object(Arc::new(map))
        }
    }
}

fn set_object_field(
    map: &Arc<BTreeMap<String, Value>>,
    key: String,
    rest: &[PathSegment],
    new_value: Value,
) -> Value {
    let mut map = (**map).clone();
    let child = set_in(map.get(&key).unwrap_or(&Value::Null), rest, new_value);
    map.insert(key, child);
    Value::Object(Arc::new(map))
}

/// Mutable access to the node at `path`, copying shared nodes on the way down.
///
/// With `create`, missing steps are created as in [`set_in`]; without it a
/// missing step returns `None` (after possibly un-sharing the nodes above it,
/// so callers check existence with [`get_in`] first when that matters).
pub(crate) fn get_mut_in<'a>(
    node: &'a mut Value,
    path: &[PathSegment],
    create: bool,
) -> Option<&'a mut Value> {
    let Some((head, rest)) = path.split_first() else {
        return Some(node);
    };

    if create {
        let fits = matches!(
            (head, &*node),
            (PathSegment::Key(_), Value::Object(_))
                | (PathSegment::Key(_), Value::Map(_))
                | (PathSegment::Index(_), Value::Array(_))
                | (PathSegment::Index(_), Value::Object(_))
        );
        if !fits {
            *node = match head {
                PathSegment::Key(_) => Value::object(),
                PathSegment::Index(_) => Value::array(),
            };
        }
    }

    let child = match (head, node) {
        (PathSegment::Key(k), Value::Object(map)) => {
            let map = Arc::make_mut(map);
            if create {
                map.entry(k.clone()).or_insert(Value::Null)
            } else {
                map.get_mut(k)?
            }
        }
        (PathSegment::Key(k), Value::Map(entries)) => {
            let key = Value::from(k.as_str());
            let entries = Arc::make_mut(entries);
            let position = entries.iter().position(|(existing, _)| deep_equal(existing, &key));
            match position {
                Some(pos) => &mut entries[pos].1,
                None if create => {
                    entries.push((key, Value::Null));
                    &mut entries.last_mut()?.1
                }
                None => return None,
            }
        }
        (PathSegment::Index(i), Value::Object(map)) => {
            let map = Arc::make_mut(map);
            if create {
                map.entry(i.to_string()).or_insert(Value::Null)
            } else {
                map.get_mut(&i.to_string())?
            }
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            let items = Arc::make_mut(items);
            if create && items.len() <= *i {
                items.resize(*i + 1, Value::Null);
            }
            items.get_mut(*i)?
        }
        _ => return None,
    };

    get_mut_in(child, rest, create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::same_value;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        let path = Path::parse("todos.0.title");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("todos".into()),
                PathSegment::Index(0),
                PathSegment::Key("title".into())
            ]
        );
        assert_eq!(path.to_string(), "todos.0.title");
        assert!(Path::parse("").is_empty());
    }

    #[test]
    fn test_get_in() {
        let root = Value::from(json!({"a": {"b": [10, 20]}}));
        assert_eq!(get_in(&root, Path::parse("a.b.1").segments()), Some(&Value::from(20)));
        assert!(get_in(&root, Path::parse("a.c").segments()).is_none());
        assert!(get_in(&root, Path::parse("a.b.5").segments()).is_none());
    }

    #[test]
    fn test_set_in_shares_siblings() {
        let root = Value::from(json!({"left": {"x": 1}, "right": {"y": {"z": 1}}}));
        let updated = set_in(&root, Path::parse("right.y.z").segments(), Value::from(2));

        assert_eq!(updated["right"]["y"]["z"].as_i64(), Some(2));
        assert!(same_value(&root["left"], &updated["left"]));
        assert!(!same_value(&root["right"], &updated["right"]));
        assert_eq!(root["right"]["y"]["z"].as_i64(), Some(1));
    }

    #[test]
    fn test_set_in_creates_containers() {
        let root = Value::object();
        let updated = set_in(&root, Path::parse("list.2.name").segments(), Value::from("c"));

        let list = updated["list"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert!(list[0].is_null());
        assert_eq!(updated["list"][2]["name"].as_str(), Some("c"));
    }

    #[test]
    fn test_get_mut_in_creates_and_copies() {
        let base = Value::from(json!({"a": {"b": 1}, "keep": [1]}));
        let mut root = base.clone();
        *get_mut_in(&mut root, Path::parse("a.c").segments(), true).unwrap() = Value::from(5);

        assert_eq!(root["a"]["c"].as_i64(), Some(5));
        assert!(base["a"].get("c").is_none());
        assert!(same_value(&base["keep"], &root["keep"]));
    }

    fn prefs_map() -> Value {
        Value::from_pairs([(
            "prefs",
            Value::map_of([
                (Value::from("theme"), Value::from("dark")),
                (Value::from("lang"), Value::from(json!({"code": "en"}))),
            ]),
        )])
    }

    #[test]
    fn test_set_in_writes_through_map_entries() {
        let root = prefs_map();
        let updated = set_in(&root, Path::parse("prefs.theme").segments(), Value::from("light"));

        let prefs = &updated["prefs"];
        assert_eq!(prefs.kind(), "map");
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs.map_get(&Value::from("theme")), Some(&Value::from("light")));
        assert!(same_value(
            root["prefs"].map_get(&Value::from("lang")).unwrap(),
            prefs.map_get(&Value::from("lang")).unwrap()
        ));
        assert_eq!(root["prefs"].map_get(&Value::from("theme")), Some(&Value::from("dark")));

        let added = set_in(&root, Path::parse("prefs.size").segments(), Value::from(12));
        assert_eq!(added["prefs"].len(), 3);
    }

    #[test]
    fn test_get_mut_in_descends_into_map_entries() {
        let base = prefs_map();
        let mut root = base.clone();
        *get_mut_in(&mut root, Path::parse("prefs.lang.code").segments(), true).unwrap() =
            Value::from("fr");

        assert_eq!(root["prefs"].kind(), "map");
        assert_eq!(root["prefs"].len(), 2);
        assert_eq!(
            get_in(&root, Path::parse("prefs.lang.code").segments()).and_then(Value::as_str),
            Some("fr")
        );
        assert_eq!(
            get_in(&base, Path::parse("prefs.lang.code").segments()).and_then(Value::as_str),
            Some("en")
        );
        assert!(get_mut_in(&mut root, Path::parse("prefs.missing").segments(), false).is_none());
    }
}
