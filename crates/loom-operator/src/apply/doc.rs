//! Helpers for manipulating metadata on JSON documents

use serde_json::{Map, Value};

/// Get or create `doc[key]` as an object, returning a mutable reference
pub(crate) fn ensure_object<'a>(doc: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    let obj = doc
        .as_object_mut()
        .expect("document root must be an object");
    let entry = obj
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut().expect("just ensured object")
}

/// Mutable access to metadata.labels, creating the path as needed
pub(crate) fn labels_mut(doc: &mut Value) -> &mut Map<String, Value> {
    let metadata = ensure_object(doc, "metadata");
    let entry = metadata
        .entry("labels".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut().expect("just ensured object")
}

/// Mutable access to metadata.annotations, creating the path as needed
pub(crate) fn annotations_mut(doc: &mut Value) -> &mut Map<String, Value> {
    let metadata = ensure_object(doc, "metadata");
    let entry = metadata
        .entry("annotations".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut().expect("just ensured object")
}

/// Remove a label; returns true if it was present
pub(crate) fn remove_label(doc: &mut Value, key: &str) -> bool {
    doc.pointer_mut("/metadata/labels")
        .and_then(Value::as_object_mut)
        .map(|labels| labels.remove(key).is_some())
        .unwrap_or(false)
}

/// Remove an annotation; returns true if it was present
pub(crate) fn remove_annotation(doc: &mut Value, key: &str) -> bool {
    doc.pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
        .map(|annotations| annotations.remove(key).is_some())
        .unwrap_or(false)
}

/// True when every field of `desired` is present with an equal value in
/// `current`. Objects recurse; arrays and scalars compare exactly.
///
/// Used for drift suppression: after the ignore filter runs on both sides,
/// a desired document that is a subset of the current one needs no write.
pub(crate) fn is_subset(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Object(d), Value::Object(c)) => d
            .iter()
            .all(|(key, value)| c.get(key).is_some_and(|cv| is_subset(value, cv))),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_labels_mut_creates_path() {
        let mut doc = json!({"apiVersion": "v1", "kind": "ConfigMap"});
        labels_mut(&mut doc).insert("a".into(), Value::from("1"));
        assert_eq!(doc["metadata"]["labels"]["a"], "1");
    }

    #[test]
    fn test_remove_label_and_annotation() {
        let mut doc = json!({
            "metadata": {
                "labels": {"keep": "1", "drop": "2"},
                "annotations": {"note": "x"}
            }
        });
        assert!(remove_label(&mut doc, "drop"));
        assert!(!remove_label(&mut doc, "drop"));
        assert!(remove_annotation(&mut doc, "note"));
        assert_eq!(doc["metadata"]["labels"], json!({"keep": "1"}));
    }

    #[test]
    fn test_is_subset_objects_recurse() {
        let desired = json!({"spec": {"selector": {"app": "web"}}});
        let current = json!({
            "spec": {"selector": {"app": "web"}, "replicas": 10},
            "status": {"ready": 10}
        });
        assert!(is_subset(&desired, &current));
    }

    #[test]
    fn test_is_subset_detects_differences() {
        let desired = json!({"spec": {"image": "web:2.0"}});
        let current = json!({"spec": {"image": "web:1.0"}});
        assert!(!is_subset(&desired, &current));

        let desired = json!({"spec": {"newfield": 1}});
        let current = json!({"spec": {}});
        assert!(!is_subset(&desired, &current));
    }

    #[test]
    fn test_is_subset_arrays_compare_exactly() {
        let desired = json!({"spec": {"args": ["a", "b"]}});
        assert!(is_subset(&desired, &json!({"spec": {"args": ["a", "b"]}})));
        assert!(!is_subset(&desired, &json!({"spec": {"args": ["a", "b", "c"]}})));
    }
}
