//! Dynamically shaped state values.
//!
//! State is a tree of [`Value`] nodes. Composite nodes are reference counted,
//! so a committed state can be cloned for free and two states produced by a
//! structurally-sharing update still share every subtree they did not touch.
//! The equality helpers in this module are what selectors and the commit
//! pipeline use to decide whether anything actually changed.

mod draft;
mod equality;
mod node;
mod path;

pub use draft::Draft;
pub use equality::{deep_equal, same_value, shallow_equal, smart_equal, smart_equal_all};
pub use node::{CustomValue, Value};
pub use path::{get_in, set_in, Path, PathSegment};

pub(crate) use node::number_to_json;
