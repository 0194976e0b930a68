//! Value model shared by slices, storage and the wire formats.

use serde::{de::DeserializeOwned, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A recursively serializable value: primitive, ordered list, or
/// string-keyed map.
pub type StateValue = serde_json::Value;

/// Bound for types a slice can hold.
///
/// Anything that round-trips through serde and compares structurally
/// qualifies; the blanket impl means callers never implement it by hand.
pub trait SliceValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> SliceValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

/// Structural equality of two state values.
///
/// Lists compare element-wise in order, maps compare key sets and values.
/// Identical references short-circuit.
pub fn deep_equal(a: &StateValue, b: &StateValue) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    match (a, b) {
        (StateValue::Array(xs), StateValue::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (StateValue::Object(xs), StateValue::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Equality used to skip no-op writes.
///
/// Two values are equal if `PartialEq` says so or if their encoded forms are
/// [`deep_equal`]. The second check catches values that never equal
/// themselves, such as `NaN`, which encode to the same state value.
pub fn values_equal<T: Serialize + PartialEq>(a: &T, b: &T) -> bool {
    if a == b {
        return true;
    }
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(x), Ok(y)) => deep_equal(&x, &y),
        _ => false,
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
