//! Rendering helpers shared by the hub and node controllers
//!
//! Rendering happens in two stages. The hub controller resolves the
//! metadata templates (name, namespace, labels, annotations) when it
//! materializes a node from a row. The node controller renders the
//! document bodies on every reconcile, so spec-level template variables
//! stay live.

use std::collections::BTreeMap;

use kube::ResourceExt;
use loom_common::crd::{LoomNode, ResourceGroups, TResource};
use loom_common::{Error, ANNOTATION_ACTIVATE, ANNOTATION_EXTRA_VALUES, ANNOTATION_HOST_OR_URL};
use serde_json::Value;
use tracing::debug;

use crate::apply::{is_cluster_scoped, ObjectRef};
use crate::template::{build_variables, Engine, Variables};

use super::build_resource_key;

/// Resolve one template entry's metadata templates against row variables.
///
/// The rendered values replace the templates in the returned entry; the
/// spec document is left untouched for the node controller to render.
pub fn resolve_resource(
    engine: &Engine,
    resource: &TResource,
    vars: &Variables,
) -> Result<TResource, Error> {
    let mut resolved = resource.clone();

    if let Some(ref name_template) = resource.name_template {
        resolved.name_template = Some(engine.render(name_template, vars)?);
    }
    if let Some(ref namespace_template) = resource.namespace_template {
        resolved.namespace_template = Some(engine.render(namespace_template, vars)?);
    }
    resolved.labels_template = engine.render_map(&resource.labels_template, vars)?;
    resolved.annotations_template = engine.render_map(&resource.annotations_template, vars)?;

    Ok(resolved)
}

/// Resolve every entry of a form's groups, keeping the group shape
pub fn resolve_groups(
    engine: &Engine,
    groups: &ResourceGroups,
    vars: &Variables,
) -> Result<ResourceGroups, Error> {
    groups.try_map(|resource| resolve_resource(engine, resource, vars))
}

/// Render a resolved entry into a concrete document.
///
/// Applies the resolved name/namespace/labels/annotations onto the
/// manifest and renders template variables inside the document body.
/// String fields that fail to render keep their original value so one bad
/// field does not sink the whole resource.
pub fn materialize_document(
    engine: &Engine,
    resource: &TResource,
    vars: &Variables,
    node: &LoomNode,
) -> Result<Value, Error> {
    let mut doc = resource.spec.clone();
    if !doc.is_object() {
        return Err(Error::serialization(format!(
            "resource {} spec is not an object",
            resource.id
        )));
    }

    let kind = resource.kind().unwrap_or("").to_string();

    let metadata = doc
        .as_object_mut()
        .expect("checked above")
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    let metadata = metadata
        .as_object_mut()
        .ok_or_else(|| Error::serialization("metadata is not an object"))?;

    if let Some(name) = resource.name_template.as_deref().filter(|n| !n.is_empty()) {
        metadata.insert("name".to_string(), Value::from(name));
    }

    // Target namespace: the resolved namespace template, else the node's
    // own namespace; cluster-scoped kinds get none
    if !is_cluster_scoped(&kind) {
        let target = resource
            .namespace_template
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .map(String::from)
            .or_else(|| node.namespace());
        if let Some(target) = target {
            metadata.insert("namespace".to_string(), Value::from(target));
        }
    }

    merge_string_map(metadata, "labels", &resource.labels_template);
    merge_string_map(metadata, "annotations", &resource.annotations_template);

    let rendered = render_value(engine, &doc, vars);
    Ok(rendered)
}

fn merge_string_map(
    metadata: &mut serde_json::Map<String, Value>,
    key: &str,
    values: &BTreeMap<String, String>,
) {
    if values.is_empty() {
        return;
    }
    let entry = metadata
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(map) = entry.as_object_mut() {
        for (k, v) in values {
            map.insert(k.clone(), Value::from(v.clone()));
        }
    }
}

/// Recursively render template variables inside a document.
///
/// Strings are rendered through the engine; failures keep the original
/// string. Maps and sequences recurse; other scalars pass through.
pub fn render_value(engine: &Engine, value: &Value, vars: &Variables) -> Value {
    match value {
        Value::String(s) => match engine.render(s, vars) {
            Ok(rendered) => Value::String(rendered),
            Err(e) => {
                debug!(template = %s, error = %e, "template rendering failed for field, keeping original");
                value.clone()
            }
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(engine, v, vars)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(engine, item, vars))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Build template variables from the row data the hub stamped onto the
/// node's annotations.
pub fn build_variables_from_annotations(node: &LoomNode) -> Result<Variables, Error> {
    let annotations = node.annotations();

    let host_or_url = annotations
        .get(ANNOTATION_HOST_OR_URL)
        .cloned()
        .unwrap_or_else(|| node.spec.uid.clone());
    let activate = annotations
        .get(ANNOTATION_ACTIVATE)
        .cloned()
        .unwrap_or_else(|| "true".to_string());

    let extras: BTreeMap<String, String> = match annotations.get(ANNOTATION_EXTRA_VALUES) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            Error::serialization(format!("cannot parse extra values annotation: {e}"))
        })?,
        _ => BTreeMap::new(),
    };

    Ok(build_variables(
        &node.spec.uid,
        &host_or_url,
        &activate,
        &extras,
    ))
}

/// Render every entry of the node and collect the applied keys it would
/// produce. Entries that fail to render are skipped - they will not be
/// applied either.
pub fn build_applied_keys(engine: &Engine, node: &LoomNode, vars: &Variables) -> Vec<String> {
    let mut keys = Vec::new();
    for resource in node.spec.all_resources() {
        let Ok(doc) = materialize_document(engine, &resource, vars, node) else {
            continue;
        };
        let Ok(obj_ref) = ObjectRef::from_doc(&doc) else {
            continue;
        };
        keys.push(build_resource_key(&obj_ref, &resource.id));
    }
    keys
}
