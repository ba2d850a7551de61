//! Entity placeholder search and substitution over JSON values.

use serde_json::Value;

/// Sentinel standing in for an entity reference that only the tested process
/// (or a later query) can resolve.
pub const ENTITY_PLACEHOLDER: &str = "$entity";

/// JSON-pointer paths of every placeholder occurrence, in document order.
pub fn placeholder_paths(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect(value, String::new(), &mut paths);
    paths
}

fn collect(value: &Value, pointer: String, paths: &mut Vec<String>) {
    match value {
        Value::String(text) if text == ENTITY_PLACEHOLDER => paths.push(pointer),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect(item, format!("{pointer}/{index}"), paths);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect(item, format!("{pointer}/{}", escape_token(key)), paths);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

/// RFC 6901 token escaping.
fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Replace the placeholder at each pointer with `entity`.
///
/// Returns the number of substitutions made; pointers that no longer hold the
/// placeholder are left untouched.
pub fn substitute_entity(value: &mut Value, pointers: &[String], entity: u64) -> usize {
    let mut replaced = 0;
    for pointer in pointers {
        let slot = if pointer.is_empty() {
            Some(&mut *value)
        } else {
            value.pointer_mut(pointer)
        };
        if let Some(slot) = slot {
            if slot.as_str() == Some(ENTITY_PLACEHOLDER) {
                *slot = Value::from(entity);
                replaced += 1;
            }
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_placeholders_in_order() {
        let value = json!({
            "parent": "$entity",
            "children": ["$entity", 3, {"target": "$entity"}],
            "label": "entity"
        });
        assert_eq!(
            placeholder_paths(&value),
            vec!["/parent", "/children/0", "/children/2/target"]
        );
    }

    #[test]
    fn root_placeholder_has_empty_pointer() {
        assert_eq!(placeholder_paths(&json!("$entity")), vec![String::new()]);
        assert!(placeholder_paths(&json!(null)).is_empty());
    }

    #[test]
    fn escapes_keys_with_slashes() {
        let value = json!({"a/b": {"c~d": "$entity"}});
        let paths = placeholder_paths(&value);
        assert_eq!(paths, vec!["/a~1b/c~0d"]);
        assert_eq!(value.pointer(&paths[0]), Some(&json!("$entity")));
    }

    #[test]
    fn substitutes_only_placeholder_slots() {
        let mut value = json!({"parent": "$entity", "other": 1});
        let pointers = vec!["/parent".to_string(), "/other".to_string()];
        let replaced = substitute_entity(&mut value, &pointers, 42);
        assert_eq!(replaced, 1);
        assert_eq!(value, json!({"parent": 42, "other": 1}));
    }

    #[test]
    fn substitutes_root_placeholder() {
        let mut value = json!("$entity");
        assert_eq!(substitute_entity(&mut value, &[String::new()], 7), 1);
        assert_eq!(value, json!(7));
    }
}
