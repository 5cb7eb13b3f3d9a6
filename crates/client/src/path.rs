// Dot-separated field paths into a record's field map (`address.city`).

use modelsync_common::types::FieldMap;
use serde_json::{Map, Value};

/// First segment of `path`: the top-level field it lives under.
pub fn root(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

pub fn get<'a>(fields: &'a FieldMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(object) => object.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, replacing non-object intermediates with empty
/// objects. Returns the previous value at `path`, if any.
pub fn set(fields: &mut FieldMap, path: &str, value: Value) -> Option<Value> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?;

    let mut current = fields;
    for segment in segments {
        let slot = current.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut()?;
    }
    current.insert(last.to_string(), value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn get_walks_objects_and_array_indexes() {
        let data = fields(json!({ "address": { "city": "Oslo" }, "tags": ["a", "b"] }));
        assert_eq!(get(&data, "address.city"), Some(&json!("Oslo")));
        assert_eq!(get(&data, "tags.1"), Some(&json!("b")));
        assert_eq!(get(&data, "address.zip"), None);
        assert_eq!(get(&data, "tags.x"), None);
    }

    #[test]
    fn set_creates_missing_parents() {
        let mut data = FieldMap::new();
        assert_eq!(set(&mut data, "address.city", json!("Oslo")), None);
        assert_eq!(Value::Object(data), json!({ "address": { "city": "Oslo" } }));
    }

    #[test]
    fn set_returns_previous_value_and_replaces_scalars_on_the_way() {
        let mut data = fields(json!({ "name": "Ada", "address": "unknown" }));
        assert_eq!(set(&mut data, "name", json!("Grace")), Some(json!("Ada")));
        set(&mut data, "address.city", json!("Oslo"));
        assert_eq!(data["address"], json!({ "city": "Oslo" }));
    }

    #[test]
    fn root_is_the_first_segment() {
        assert_eq!(root("address.city"), "address");
        assert_eq!(root("name"), "name");
    }
}
