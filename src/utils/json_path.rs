//! Dotted-path helpers over `serde_json::Value` documents.

use serde_json::{Map, Value};

/// Join a parent path and a property name.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Accept `/` as a separator and strip leading/trailing separators.
pub fn normalize(path: &str) -> String {
    path.replace('/', ".")
        .split('.')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn split(path: &str) -> Vec<&str> {
    path.split('.').filter(|part| !part.is_empty()).collect()
}

/// A segment addressing an array element rather than a property.
pub fn is_element_id(segment: &str) -> bool {
    uuid::Uuid::parse_str(segment).is_ok()
        || (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

/// Look up a dotted path. Numeric segments index into arrays.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    split(path).into_iter().try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Build `{a: {b: value}}` from `a.b` and `value`.
pub fn path_to_payload(path: &str, value: Value) -> Value {
    split(path)
        .into_iter()
        .rev()
        .fold(value, |inner, part| {
            let mut map = Map::new();
            map.insert(part.to_string(), inner);
            Value::Object(map)
        })
}

/// Everything but the last segment.
pub fn parent(path: &str) -> &str {
    path.rfind('.').map_or("", |i| &path[..i])
}

/// Whether `path` equals `other` or one is nested inside the other.
pub fn overlaps(path: &str, other: &str) -> bool {
    path == other
        || path.starts_with(&format!("{}.", other))
        || other.starts_with(&format!("{}.", path))
}

/// Compare a scalar against a path segment (`tags.red` removes `"red"`).
pub fn scalar_matches(value: &Value, segment: &str) -> bool {
    match value {
        Value::String(s) => s == segment,
        Value::Number(n) => n.to_string() == segment,
        Value::Bool(b) => b.to_string() == segment,
        _ => false,
    }
}
