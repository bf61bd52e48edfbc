//! Cache key construction.
//!
//! Keys are `:`-delimited segments. Prefix invalidation only matches whole
//! segments, so `"user"` never matches `"users:1"`.

use serde_json::{Map, Value};

/// Segment delimiter used when building keys.
pub const KEY_DELIMITER: char = ':';

/// Joins segments into a cache key.
pub fn query_key<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for segment in segments {
        if !key.is_empty() {
            key.push(KEY_DELIMITER);
        }
        key.push_str(segment.as_ref());
    }
    key
}

/// Derives the cache key of one list page.
pub fn list_key(base: &str, page: u32, page_size: u32, filters: &Value) -> String {
    format!(
        "{base}{d}page={page}{d}size={page_size}{d}filters={}",
        stable_json(filters),
        d = KEY_DELIMITER
    )
}

/// Serializes a value with object keys in sorted order at every depth.
pub fn stable_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Returns true if `key` lies under `prefix` on a segment boundary.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => {
            rest.is_empty() || rest.starts_with(KEY_DELIMITER) || prefix.ends_with(KEY_DELIMITER)
        }
        None => false,
    }
}
