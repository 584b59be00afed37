//! Path-based field filtering for Kubernetes documents
//!
//! Compiles a small path language over nested JSON documents and removes
//! matching subtrees in place. Used by the apply engine to mask ignored
//! fields out of both the desired and the fetched document before diffing.
//!
//! Supported productions:
//! - root: `$`
//! - child: `.name`
//! - bracketed child with quoted name: `['app.kubernetes.io/name']`
//! - array index: `[2]`, negative indexes count from the end
//! - wildcard: `[*]` (also `.*`)
//! - slice: `[1:3]`, `[::2]`
//! - filter predicate: `[?(@.status == 'active')]`, `[?(@.name)]`
//!
//! Compilation validates every path up-front; removal never errors on an
//! absent path. Array removal preserves the order of remaining siblings,
//! map removal deletes the key entirely.

mod parser;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

pub(crate) use parser::parse_path;

/// Error raised when a path expression fails to compile
#[derive(Debug, Error)]
#[error("invalid path {path:?}: {message}")]
pub struct PathError {
    /// The offending path expression
    pub path: String,
    /// What went wrong
    pub message: String,
}

/// One segment of a compiled path
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Segment {
    /// Named child of a mapping
    Child(String),
    /// Array index; negative counts from the end
    Index(i64),
    /// Every element of an array or every value of a mapping
    Wildcard,
    /// Python-style slice over an array
    Slice {
        /// First index, defaults to 0
        start: Option<i64>,
        /// One past the last index, defaults to len
        end: Option<i64>,
        /// Step, must be positive, defaults to 1
        step: i64,
    },
    /// Predicate over array elements
    Filter(Predicate),
}

/// Comparison operator inside a filter predicate
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Literal operand inside a filter predicate
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

/// A parsed `[?(...)]` predicate: `@.a.b op literal`, or bare `@.a.b`
/// which tests existence.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Predicate {
    pub keys: Vec<String>,
    pub cmp: Option<(CmpOp, Literal)>,
}

impl Predicate {
    fn resolve<'a>(&self, element: &'a Value) -> Option<&'a Value> {
        let mut current = element;
        for key in &self.keys {
            current = current.get(key)?;
        }
        Some(current)
    }

    fn matches(&self, element: &Value) -> bool {
        let Some(found) = self.resolve(element) else {
            return false;
        };
        match &self.cmp {
            None => !found.is_null(),
            Some((op, literal)) => compare(found, *op, literal),
        }
    }
}

fn compare(value: &Value, op: CmpOp, literal: &Literal) -> bool {
    use std::cmp::Ordering;

    let ordering = match (value, literal) {
        (Value::String(s), Literal::Str(l)) => Some(s.as_str().cmp(l.as_str())),
        (Value::Number(n), Literal::Num(l)) => n.as_f64().and_then(|n| n.partial_cmp(l)),
        (Value::Bool(b), Literal::Bool(l)) => Some(b.cmp(l)),
        (Value::Null, Literal::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match ordering {
        Some(ord) => match op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        },
        // Type-incompatible comparisons only satisfy !=
        None => op == CmpOp::Ne,
    }
}

/// A single compiled path expression
#[derive(Clone, Debug)]
pub(crate) struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

/// A reusable set of compiled path expressions.
///
/// Removal is idempotent: applying the same filter twice yields the same
/// document as applying it once, and an empty filter leaves the document
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct FieldFilter {
    paths: Vec<PathExpr>,
}

impl FieldFilter {
    /// Compile a list of path expressions, validating each up-front
    pub fn compile<S: AsRef<str>>(paths: &[S]) -> Result<Self, PathError> {
        let mut compiled = Vec::with_capacity(paths.len());
        for path in paths {
            compiled.push(parse_path(path.as_ref())?);
        }
        Ok(Self { paths: compiled })
    }

    /// Validate a single path expression without building a filter
    pub fn validate(path: &str) -> Result<(), PathError> {
        parse_path(path).map(|_| ())
    }

    /// True when no paths were configured
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The raw path expressions this filter was compiled from
    pub fn raw_paths(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.raw.clone()).collect()
    }

    /// Remove every subtree reachable by any path, in place.
    ///
    /// Missing paths are silent no-ops.
    pub fn apply(&self, doc: &mut Value) {
        for path in &self.paths {
            remove(doc, &path.segments);
        }
    }

    /// Collect the values each path currently matches, for debugging
    pub fn probe(&self, doc: &Value) -> BTreeMap<String, Vec<Value>> {
        let mut results = BTreeMap::new();
        for path in &self.paths {
            let mut matches = Vec::new();
            collect(doc, &path.segments, &mut matches);
            if !matches.is_empty() {
                results.insert(path.raw.clone(), matches);
            }
        }
        results
    }
}

/// Resolve a possibly-negative index against an array length
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    if idx >= 0 {
        let idx = idx as usize;
        (idx < len).then_some(idx)
    } else {
        let from_end = idx.unsigned_abs() as usize;
        (from_end <= len).then(|| len - from_end)
    }
}

/// Indices selected by a slice, in ascending order
fn slice_indices(start: Option<i64>, end: Option<i64>, step: i64, len: usize) -> Vec<usize> {
    let clamp = |i: i64| -> usize {
        if i >= 0 {
            (i as usize).min(len)
        } else {
            len.saturating_sub(i.unsigned_abs() as usize)
        }
    };
    let start = clamp(start.unwrap_or(0));
    let end = clamp(end.unwrap_or(len as i64));
    let step = step.max(1) as usize;

    (start..end).step_by(step).collect()
}

fn remove(value: &mut Value, segments: &[Segment]) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        match (segment, value) {
            (Segment::Child(name), Value::Object(map)) => {
                map.remove(name);
            }
            (Segment::Index(i), Value::Array(arr)) => {
                if let Some(idx) = resolve_index(*i, arr.len()) {
                    arr.remove(idx);
                }
            }
            (Segment::Wildcard, Value::Object(map)) => map.clear(),
            (Segment::Wildcard, Value::Array(arr)) => arr.clear(),
            (Segment::Slice { start, end, step }, Value::Array(arr)) => {
                for idx in slice_indices(*start, *end, *step, arr.len()).into_iter().rev() {
                    arr.remove(idx);
                }
            }
            (Segment::Filter(pred), Value::Array(arr)) => {
                arr.retain(|element| !pred.matches(element));
            }
            _ => {}
        }
        return;
    }

    match (segment, value) {
        (Segment::Child(name), Value::Object(map)) => {
            if let Some(child) = map.get_mut(name) {
                remove(child, rest);
            }
        }
        (Segment::Index(i), Value::Array(arr)) => {
            let len = arr.len();
            if let Some(idx) = resolve_index(*i, len) {
                remove(&mut arr[idx], rest);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for child in map.values_mut() {
                remove(child, rest);
            }
        }
        (Segment::Wildcard, Value::Array(arr)) => {
            for child in arr.iter_mut() {
                remove(child, rest);
            }
        }
        (Segment::Slice { start, end, step }, Value::Array(arr)) => {
            let len = arr.len();
            for idx in slice_indices(*start, *end, *step, len) {
                remove(&mut arr[idx], rest);
            }
        }
        (Segment::Filter(pred), Value::Array(arr)) => {
            for element in arr.iter_mut() {
                if pred.matches(element) {
                    remove(element, rest);
                }
            }
        }
        _ => {}
    }
}

fn collect(value: &Value, segments: &[Segment], out: &mut Vec<Value>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };

    match (segment, value) {
        (Segment::Child(name), Value::Object(map)) => {
            if let Some(child) = map.get(name) {
                collect(child, rest, out);
            }
        }
        (Segment::Index(i), Value::Array(arr)) => {
            if let Some(idx) = resolve_index(*i, arr.len()) {
                collect(&arr[idx], rest, out);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for child in map.values() {
                collect(child, rest, out);
            }
        }
        (Segment::Wildcard, Value::Array(arr)) => {
            for child in arr {
                collect(child, rest, out);
            }
        }
        (Segment::Slice { start, end, step }, Value::Array(arr)) => {
            for idx in slice_indices(*start, *end, *step, arr.len()) {
                collect(&arr[idx], rest, out);
            }
        }
        (Segment::Filter(pred), Value::Array(arr)) => {
            for element in arr {
                if pred.matches(element) {
                    collect(element, rest, out);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "annotations": {
                    "app.kubernetes.io/name": "web",
                    "team": "platform"
                }
            },
            "spec": {
                "replicas": 3,
                "template": {
                    "spec": {
                        "containers": [
                            {"name": "app", "image": "web:1.0"},
                            {"name": "sidecar", "image": "proxy:2.1"}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn test_remove_simple_path() {
        let filter = FieldFilter::compile(&["$.spec.replicas"]).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc);
        assert!(doc["spec"].get("replicas").is_none());
        // Siblings untouched
        assert!(doc["spec"].get("template").is_some());
    }

    #[test]
    fn test_remove_bracketed_key_with_special_chars() {
        let filter =
            FieldFilter::compile(&["$.metadata.annotations['app.kubernetes.io/name']"]).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc);
        let annotations = doc["metadata"]["annotations"].as_object().unwrap();
        assert!(!annotations.contains_key("app.kubernetes.io/name"));
        assert!(annotations.contains_key("team"));
    }

    #[test]
    fn test_remove_array_index_preserves_order() {
        let filter = FieldFilter::compile(&["$.spec.template.spec.containers[0]"]).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc);
        let containers = doc["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "sidecar");
    }

    #[test]
    fn test_negative_index_counts_from_end() {
        let filter = FieldFilter::compile(&["$.spec.template.spec.containers[-1]"]).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc);
        let containers = doc["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "app");
    }

    #[test]
    fn test_wildcard_descends_into_every_element() {
        let filter = FieldFilter::compile(&["$.spec.template.spec.containers[*].image"]).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc);
        for container in doc["spec"]["template"]["spec"]["containers"].as_array().unwrap() {
            assert!(container.get("image").is_none());
            assert!(container.get("name").is_some());
        }
    }

    #[test]
    fn test_slice_removal() {
        let mut doc = json!({"items": [0, 1, 2, 3, 4]});
        let filter = FieldFilter::compile(&["$.items[1:3]"]).unwrap();
        filter.apply(&mut doc);
        assert_eq!(doc["items"], json!([0, 3, 4]));
    }

    #[test]
    fn test_slice_with_step() {
        let mut doc = json!({"items": [0, 1, 2, 3, 4, 5]});
        let filter = FieldFilter::compile(&["$.items[::2]"]).unwrap();
        filter.apply(&mut doc);
        assert_eq!(doc["items"], json!([1, 3, 5]));
    }

    #[test]
    fn test_filter_predicate_equality() {
        let mut doc = json!({
            "items": [
                {"status": "active", "id": 1},
                {"status": "inactive", "id": 2},
                {"status": "active", "id": 3}
            ]
        });
        let filter = FieldFilter::compile(&["$.items[?(@.status == 'inactive')]"]).unwrap();
        filter.apply(&mut doc);
        let items = doc["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 1);
        assert_eq!(items[1]["id"], 3);
    }

    #[test]
    fn test_filter_predicate_existence() {
        let mut doc = json!({
            "items": [
                {"deprecated": true, "id": 1},
                {"id": 2}
            ]
        });
        let filter = FieldFilter::compile(&["$.items[?(@.deprecated)]"]).unwrap();
        filter.apply(&mut doc);
        let items = doc["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], 2);
    }

    #[test]
    fn test_filter_predicate_numeric_comparison() {
        let mut doc = json!({"items": [{"n": 1}, {"n": 5}, {"n": 9}]});
        let filter = FieldFilter::compile(&["$.items[?(@.n > 4)]"]).unwrap();
        filter.apply(&mut doc);
        assert_eq!(doc["items"], json!([{"n": 1}]));
    }

    #[test]
    fn test_missing_path_is_silent() {
        let filter = FieldFilter::compile(&["$.spec.nonexistent.deeply[3].nested"]).unwrap();
        let mut doc = deployment();
        let before = doc.clone();
        filter.apply(&mut doc);
        assert_eq!(doc, before);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let filter =
            FieldFilter::compile(&["$.spec.replicas", "$.spec.template.spec.containers[0]"])
                .unwrap();
        let mut once = deployment();
        filter.apply(&mut once);
        let mut twice = once.clone();
        filter.apply(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_filter_is_identity() {
        let filter = FieldFilter::compile::<&str>(&[]).unwrap();
        let mut doc = deployment();
        let before = doc.clone();
        filter.apply(&mut doc);
        assert_eq!(doc, before);
        assert!(filter.is_empty());
    }

    #[test]
    fn test_compile_rejects_invalid_paths() {
        for bad in [
            "",
            "spec.replicas",       // missing root
            "$.spec.",             // trailing dot
            "$.spec[",             // unterminated bracket
            "$.spec['unclosed]",   // unterminated string
            "$.spec[1:2:0]",       // zero step
            "$.spec[?(status)]",   // predicate missing @
            "$.spec[abc]",         // bare word in bracket
        ] {
            assert!(
                FieldFilter::compile(&[bad]).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_compile_error_quotes_path() {
        let err = FieldFilter::compile(&["$.spec["]).unwrap_err();
        assert!(err.to_string().contains("$.spec["));
    }

    #[test]
    fn test_probe_reports_matching_values() {
        let filter =
            FieldFilter::compile(&["$.spec.replicas", "$.spec.missing"]).unwrap();
        let doc = deployment();
        let probed = filter.probe(&doc);
        assert_eq!(probed.get("$.spec.replicas"), Some(&vec![json!(3)]));
        // Paths with no matches are omitted
        assert!(!probed.contains_key("$.spec.missing"));
    }

    #[test]
    fn test_raw_paths_round_trip() {
        let paths = ["$.spec.replicas", "$.metadata.labels['a.b/c']"];
        let filter = FieldFilter::compile(&paths).unwrap();
        assert_eq!(filter.raw_paths(), paths.to_vec());
    }
}
