use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const END_SUFFIX: &str = "\u{ffff}";
const ID_FIELD: &str = "_id";
const REV_FIELD: &str = "_rev";

/// CouchDB `_id` of document `id` in `collection`.
pub fn doc_id(collection: &str, id: &str) -> String {
    format!("{collection}::{id}")
}

/// Mango selector limited to one collection and one equality constraint.
pub fn collection_selector(collection: &str, field: &str, equals: &Value) -> Value {
    let mut selector = Map::new();
    selector.insert(
        ID_FIELD.into(),
        json!({
            "$gt": format!("{collection}::"),
            "$lt": format!("{collection}::{END_SUFFIX}"),
        }),
    );
    selector.insert(field.into(), equals.clone());
    Value::Object(selector)
}

/// Split a raw CouchDB document into its revision and the application body.
pub fn into_body(mut raw: Value) -> (Option<String>, Value) {
    let rev = match raw.as_object_mut() {
        Some(fields) => {
            fields.remove(ID_FIELD);
            fields
                .remove(REV_FIELD)
                .and_then(|rev| rev.as_str().map(str::to_owned))
        }
        None => None,
    };
    (rev, raw)
}

/// Attach CouchDB bookkeeping fields to an application body.
pub fn with_meta(mut body: Value, doc_id: &str, rev: Option<&str>) -> Value {
    if let Some(fields) = body.as_object_mut() {
        fields.insert(ID_FIELD.into(), Value::from(doc_id));
        match rev {
            Some(rev) => {
                fields.insert(REV_FIELD.into(), Value::from(rev));
            }
            None => {
                fields.remove(REV_FIELD);
            }
        }
    }
    body
}

#[derive(Debug, Deserialize)]
pub struct DatabaseInfo {
    pub update_seq: Value,
}

/// Render a sequence token as the `since` query parameter.
pub fn seq_param(seq: &Value) -> String {
    match seq {
        Value::String(seq) => seq.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct FindRequest {
    pub selector: Value,
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct FindResponse {
    pub docs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_fields_round_trip() {
        let raw = json!({"_id": "games::g1", "_rev": "3-abc", "version": 4});
        let (rev, body) = into_body(raw);
        assert_eq!(rev.as_deref(), Some("3-abc"));
        assert_eq!(body, json!({"version": 4}));

        let stored = with_meta(body, &doc_id("games", "g1"), rev.as_deref());
        assert_eq!(stored["_id"], "games::g1");
        assert_eq!(stored["_rev"], "3-abc");
    }

    #[test]
    fn selector_is_scoped_to_collection() {
        let selector = collection_selector("games", "owner.userId", &json!("u1"));
        assert_eq!(selector["owner.userId"], "u1");
        assert_eq!(selector["_id"]["$gt"], "games::");
    }
}
