//! Helpers for JSON-shaped documents shared by the local and remote stores.

use serde_json::Value;

/// Copy the top-level fields of `patch` onto `target`.
///
/// Fields named in `deep_keys` are merged one level deeper when both sides hold objects, so a
/// partial `state` patch does not clobber unrelated state fields. Non-object patches are
/// ignored.
pub fn merge_patch(target: &mut Value, patch: &Value, deep_keys: &[&str]) {
    let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) else {
        return;
    };

    for (key, value) in patch {
        let deep = deep_keys.contains(&key.as_str());
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) if deep => {
                for (inner_key, inner_value) in incoming {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Resolve a dotted path (`owner.userId`) inside a document.
pub fn field<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

/// Version counter carried by a document, 0 when absent.
pub fn version_of(document: &Value) -> u64 {
    document.get("version").and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deep_keys_merge_one_level() {
        let mut doc = json!({"a": 1, "state": {"x": 1, "y": {"k": 1}}});
        merge_patch(&mut doc, &json!({"b": 2, "state": {"y": {"j": 2}}}), &["state"]);
        assert_eq!(doc, json!({"a": 1, "b": 2, "state": {"x": 1, "y": {"j": 2}}}));
    }

    #[test]
    fn shallow_keys_are_replaced() {
        let mut doc = json!({"teamA": {"name": "A", "colour": "red"}});
        merge_patch(&mut doc, &json!({"teamA": {"name": "B"}}), &["state"]);
        assert_eq!(doc, json!({"teamA": {"name": "B"}}));
    }

    #[test]
    fn dotted_paths_resolve() {
        let doc = json!({"owner": {"userId": "u1"}, "version": 7});
        assert_eq!(field(&doc, "owner.userId"), Some(&json!("u1")));
        assert_eq!(field(&doc, "owner.email"), None);
        assert_eq!(version_of(&doc), 7);
        assert_eq!(version_of(&json!({})), 0);
    }
}
