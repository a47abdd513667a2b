// ============================================================================
// spark-state - Value Merging
// Deep merge, record/array conversion and structural equality on Value
// ============================================================================
//
// Two merge flavours exist because they serve different callers:
//
// - `merge_payload` coalesces emits while the engine is halted. Arrays
//   concatenate so no element of an intermediate payload is lost.
// - `deep_merge` implements `patch`. Arrays merge element-wise by index so a
//   partial array updates positions in place.
// ============================================================================

use serde_json::{Map, Value};

// =============================================================================
// MERGE
// =============================================================================

/// Merge `incoming` into `target` for pending-emit coalescing.
///
/// Objects merge key-wise and recursively, arrays concatenate, anything else
/// is replaced by `incoming`.
///
/// # Example
/// ```
/// use spark_state::reactivity::merge::merge_payload;
/// use serde_json::json;
///
/// let mut pending = json!({"a": 1, "tags": ["x"]});
/// merge_payload(&mut pending, json!({"b": 2, "tags": ["y"]}));
/// assert_eq!(pending, json!({"a": 1, "b": 2, "tags": ["x", "y"]}));
/// ```
pub fn merge_payload(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(next)) => {
            for (key, value) in next {
                match existing.get_mut(&key) {
                    Some(slot) => merge_payload(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(next)) => existing.extend(next),
        (slot, next) => *slot = next,
    }
}

/// Recursively merge `partial` into `target` the way `patch` does.
///
/// Objects merge key-wise, arrays merge element-wise by index (extra elements
/// are appended), anything else is replaced.
///
/// # Example
/// ```
/// use spark_state::reactivity::merge::deep_merge;
/// use serde_json::json;
///
/// let mut user = json!({"name": "ada", "address": {"city": "london", "zip": "n1"}});
/// deep_merge(&mut user, &json!({"address": {"city": "paris"}}));
/// assert_eq!(user, json!({"name": "ada", "address": {"city": "paris", "zip": "n1"}}));
/// ```
pub fn deep_merge(target: &mut Value, partial: &Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(next)) => {
            for (key, value) in next {
                match existing.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(next)) => {
            for (index, value) in next.iter().enumerate() {
                match existing.get_mut(index) {
                    Some(slot) => deep_merge(slot, value),
                    None => existing.push(value.clone()),
                }
            }
        }
        (slot, next) => *slot = next.clone(),
    }
}

// =============================================================================
// RECORD / ARRAY CONVERSION
// =============================================================================

/// Turn an array into a record keyed by stringified index.
/// Non-array values are returned unchanged.
pub fn array_to_record(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let record: Map<String, Value> = items
                .iter()
                .enumerate()
                .map(|(index, item)| (index.to_string(), item.clone()))
                .collect();
            Value::Object(record)
        }
        other => other.clone(),
    }
}

/// Turn an index-keyed record back into an array.
///
/// Numeric keys are ordered numerically; any non-numeric keys follow in map
/// order. Non-object values are returned unchanged.
pub fn record_to_array(value: Value) -> Value {
    match value {
        Value::Object(record) => {
            let mut indexed = Vec::new();
            let mut rest = Vec::new();
            for (key, item) in record {
                match key.parse::<usize>() {
                    Ok(index) => indexed.push((index, item)),
                    Err(_) => rest.push(item),
                }
            }
            indexed.sort_by_key(|(index, _)| *index);
            Value::Array(indexed.into_iter().map(|(_, item)| item).chain(rest).collect())
        }
        other => other,
    }
}

// =============================================================================
// EQUALITY / KEYS
// =============================================================================

/// Structural equality where numbers compare by numeric value, so `1` and
/// `1.0` are equal.
///
/// # Example
/// ```
/// use spark_state::reactivity::merge::is_equal;
/// use serde_json::json;
///
/// assert!(is_equal(&json!({"n": 1}), &json!({"n": 1.0})));
/// assert!(!is_equal(&json!([1, 2]), &json!([2, 1])));
/// ```
pub fn is_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| is_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, value)| y.get(key).is_some_and(|other| is_equal(value, other)))
        }
        _ => a == b,
    }
}

/// String form of a primary-key value. Strings, numbers and booleans
/// normalize; anything else has no key.
pub fn normalize_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn payload_merge_replaces_scalars() {
        let mut target = json!(1);
        merge_payload(&mut target, json!("two"));
        assert_eq!(target, json!("two"));
    }

    #[test]
    fn payload_merge_recurses_and_concats() {
        let mut target = json!({"a": {"b": [1]}, "keep": true});
        merge_payload(&mut target, json!({"a": {"b": [2], "c": 3}}));
        assert_eq!(target, json!({"a": {"b": [1, 2], "c": 3}, "keep": true}));
    }

    #[test]
    fn deep_merge_arrays_by_index() {
        let mut target = json!([{"done": false, "id": 1}, {"done": false, "id": 2}]);
        deep_merge(&mut target, &json!([{"done": true}]));
        assert_eq!(target, json!([{"done": true, "id": 1}, {"done": false, "id": 2}]));
    }

    #[test]
    fn deep_merge_appends_extra_elements() {
        let mut target = json!([1]);
        deep_merge(&mut target, &json!([9, 2, 3]));
        assert_eq!(target, json!([9, 2, 3]));
    }

    #[test]
    fn deep_merge_type_change_replaces() {
        let mut target = json!({"a": {"nested": 1}});
        deep_merge(&mut target, &json!({"a": "flat"}));
        assert_eq!(target, json!({"a": "flat"}));
    }

    #[test]
    fn record_conversion_orders_numerically() {
        let record = json!({"10": "k", "2": "c", "0": "a", "1": "b"});
        assert_eq!(record_to_array(record), json!(["a", "b", "c", "k"]));
        assert_eq!(array_to_record(&json!(["x", "y"])), json!({"0": "x", "1": "y"}));
    }

    #[test]
    fn normalize_key_variants() {
        assert_eq!(normalize_key(&json!("a1")), Some("a1".to_string()));
        assert_eq!(normalize_key(&json!(42)), Some("42".to_string()));
        assert_eq!(normalize_key(&json!(true)), Some("true".to_string()));
        assert_eq!(normalize_key(&json!(null)), None);
        assert_eq!(normalize_key(&json!({"id": 1})), None);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{0,6}".prop_map(Value::String),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn deep_merge_with_self_is_identity(v in value()) {
            let mut target = v.clone();
            deep_merge(&mut target, &v);
            prop_assert_eq!(target, v);
        }

        #[test]
        fn deep_merge_keeps_every_partial_key(base in value(), partial in value()) {
            let mut target = base.clone();
            deep_merge(&mut target, &partial);
            if let (Value::Object(_), Value::Object(p)) = (&base, &partial) {
                for key in p.keys() {
                    prop_assert!(target.get(key).is_some());
                }
            }
        }

        #[test]
        fn record_round_trip_preserves_arrays(items in prop::collection::vec(leaf(), 0..16)) {
            let array = Value::Array(items);
            prop_assert_eq!(record_to_array(array_to_record(&array)), array);
        }

        #[test]
        fn is_equal_is_reflexive(v in value()) {
            prop_assert!(is_equal(&v, &v));
        }
    }
}
