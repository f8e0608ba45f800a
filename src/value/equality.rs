//! Equality strategies used to decide recomputation and notification.

use super::node::Value;
use std::sync::Arc;

/// Numbers compare like `Object.is`: NaN equals NaN, 0 and -0 differ.
fn same_number(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && (a != 0.0 || a.is_sign_negative() == b.is_sign_negative())
}

/// Reference equality.
///
/// Primitives compare by value. Composite nodes are equal only if they are
/// the same allocation, which is what structural sharing preserves for
/// untouched subtrees.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => same_number(*x, *y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) | (Value::Set(x), Value::Set(y)) => Arc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Arc::ptr_eq(x, y),
        (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(x, y),
        (Value::Custom(x), Value::Custom(y)) => std::ptr::addr_eq(Arc::as_ptr(x), Arc::as_ptr(y)),
        _ => false,
    }
}

/// One level of comparison: arrays element-wise and objects key-wise, each
/// with [`same_value`].
pub fn shallow_equal(a: &Value, b: &Value) -> bool {
    if same_value(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| same_value(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| same_value(v, w)).unwrap_or(false))
        }
        _ => false,
    }
}

/// Full structural equality.
///
/// Sets compare as unordered collections and maps as unordered key/value
/// pairs. Recursion is unbounded; state trees are acyclic because every
/// composite node is an immutable `Arc`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    if same_value(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| deep_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| deep_equal(v, w)).unwrap_or(false))
        }
        (Value::Set(x), Value::Set(y)) => {
            x.len() == y.len() && x.iter().all(|p| y.iter().any(|q| deep_equal(p, q)))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .any(|(k2, v2)| deep_equal(k, k2) && deep_equal(v, v2))
                })
        }
        (Value::Custom(x), Value::Custom(y)) => x.equals(y.as_ref()),
        _ => false,
    }
}

/// Hybrid comparison used by memoized selectors.
///
/// Reference equality first; then arrays and objects are compared one level
/// deep (length or key count rejects early), and only an element that is
/// itself composite and not reference-equal falls back to [`deep_equal`].
/// Two distinct primitives are unequal without further work.
pub fn smart_equal(a: &Value, b: &Value) -> bool {
    if same_value(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| element_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| element_equal(v, w)).unwrap_or(false))
        }
        _ if a.is_primitive() || b.is_primitive() => false,
        _ => deep_equal(a, b),
    }
}

fn element_equal(a: &Value, b: &Value) -> bool {
    if same_value(a, b) {
        return true;
    }
    if a.is_primitive() && b.is_primitive() {
        return false;
    }
    deep_equal(a, b)
}

/// Element-wise [`smart_equal`] over two input vectors.
pub fn smart_equal_all(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(p, q)| smart_equal(p, q))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_value_numbers() {
        assert!(same_value(&Value::from(f64::NAN), &Value::from(f64::NAN)));
        assert!(!same_value(&Value::from(0.0), &Value::from(-0.0)));
        assert!(same_value(&Value::from(1), &Value::from(1.0)));
    }

    #[test]
    fn test_same_value_is_reference_for_composites() {
        let a = Value::from(json!({"x": 1}));
        let b = Value::from(json!({"x": 1}));
        assert!(same_value(&a, &a.clone()));
        assert!(!same_value(&a, &b));
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn test_shallow_equal() {
        let shared = Value::from(json!({"deep": true}));
        let a = Value::from_pairs(vec![("s", shared.clone()), ("n", Value::from(1))]);
        let b = Value::from_pairs(vec![("s", shared), ("n", Value::from(1))]);
        assert!(shallow_equal(&a, &b));

        let c = Value::from(json!({"s": {"deep": true}, "n": 1}));
        assert!(!shallow_equal(&a, &c));
    }

    #[test]
    fn test_smart_equal_falls_back_to_deep_for_composites() {
        let a = Value::from(json!([1, {"x": [1, 2]}]));
        let b = Value::from(json!([1, {"x": [1, 2]}]));
        assert!(smart_equal(&a, &b));

        let c = Value::from(json!([1, {"x": [1, 3]}]));
        assert!(!smart_equal(&a, &c));

        let d = Value::from(json!([2, {"x": [1, 2]}]));
        assert!(!smart_equal(&a, &d));
    }

    #[test]
    fn test_smart_equal_length_fast_reject() {
        let a = Value::from(json!({"a": 1}));
        let b = Value::from(json!({"a": 1, "b": 2}));
        assert!(!smart_equal(&a, &b));
    }

    #[test]
    fn test_deep_equal_sets_and_maps_ignore_order() {
        let a = Value::set_of(vec![Value::from(1), Value::from(2)]);
        let b = Value::set_of(vec![Value::from(2), Value::from(1)]);
        assert!(deep_equal(&a, &b));

        let m1 = Value::map_of(vec![
            (Value::from("a"), Value::from(1)),
            (Value::from("b"), Value::from(2)),
        ]);
        let m2 = Value::map_of(vec![
            (Value::from("b"), Value::from(2)),
            (Value::from("a"), Value::from(1)),
        ]);
        assert!(deep_equal(&m1, &m2));
        assert!(!deep_equal(&m1, &a));
    }
}
