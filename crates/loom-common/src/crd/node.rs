//! LoomNode Custom Resource Definition
//!
//! A LoomNode is the per-tenant materialization object: one exists for each
//! active row reported by a hub, per form referencing that hub. Its spec
//! carries the form's resource entries with name/namespace/label/annotation
//! templates already resolved; the document bodies are rendered at apply
//! time by the node controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, ResourceGroups, TResource, CONDITION_READY};

/// Specification for a LoomNode
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomNode",
    plural = "loomnodes",
    shortname = "ln",
    status = "LoomNodeStatus",
    namespaced,
    printcolumn = r#"{"name":"UID","type":"string","jsonPath":".spec.uid"}"#,
    printcolumn = r#"{"name":"Form","type":"string","jsonPath":".spec.formRef"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyResources"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredResources"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomNodeSpec {
    /// The tenant's primary key from the data source
    pub uid: String,

    /// Name of the LoomForm this node was rendered from
    pub form_ref: String,

    /// Resolved resource entries, grouped by kind (mirrors the form groups)
    #[serde(flatten)]
    pub resources: ResourceGroups,
}

impl LoomNodeSpec {
    /// Flatten every resolved entry across all groups
    pub fn all_resources(&self) -> Vec<TResource> {
        self.resources.all()
    }
}

/// Status for a LoomNode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoomNodeStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default)]
    pub observed_generation: i64,

    /// Number of resources that are ready
    #[serde(default)]
    pub ready_resources: i32,

    /// Total number of desired resources
    #[serde(default)]
    pub desired_resources: i32,

    /// Number of resources that failed
    #[serde(default)]
    pub failed_resources: i32,

    /// Number of resources currently in conflict
    #[serde(default)]
    pub conflicted_resources: i32,

    /// Keys of resources that were successfully applied.
    ///
    /// Format: `Kind/namespace/name@id` with an empty namespace for
    /// cluster-scoped kinds. Enables detection and cleanup of resources
    /// that disappeared from the template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_resources: Vec<String>,

    /// Conditions: Ready, Progressing, Conflicted, Degraded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LoomNodeStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Upsert a condition keyed by type.
    ///
    /// The transition time is refreshed only when status, reason, or
    /// message actually changed. Returns true if anything was modified.
    pub fn set_condition(&mut self, cond: Condition) -> bool {
        for existing in self.conditions.iter_mut() {
            if existing.type_ == cond.type_ {
                if existing.same_state(&cond) {
                    return false;
                }
                *existing = cond;
                return true;
            }
        }
        self.conditions.push(cond);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_refreshes_only_on_change() {
        let mut status = LoomNodeStatus::default();

        let first = Condition::new(CONDITION_READY, ConditionStatus::True, "Reconciled", "ok");
        assert!(status.set_condition(first.clone()));
        let recorded = status.condition(CONDITION_READY).unwrap().clone();

        // Same state, newer timestamp: no update, timestamp preserved
        let mut same = first.clone();
        same.last_transition_time = recorded.last_transition_time + chrono::Duration::seconds(30);
        assert!(!status.set_condition(same));
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().last_transition_time,
            recorded.last_transition_time
        );

        // Changed reason: update, timestamp replaced
        let changed = Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ResourcesFailed",
            "2 resources failed",
        );
        assert!(status.set_condition(changed));
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().reason,
            "ResourcesFailed"
        );
    }

    #[test]
    fn test_is_ready_reads_ready_condition() {
        let mut status = LoomNodeStatus::default();
        assert!(!status.is_ready());

        status.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Reconciled",
            "ok",
        ));
        assert!(status.is_ready());
    }

    #[test]
    fn test_node_spec_flattens_groups() {
        let spec = LoomNodeSpec {
            uid: "acme".to_string(),
            form_ref: "web-form".to_string(),
            resources: ResourceGroups {
                namespaces: vec![TResource {
                    id: "tenant-ns".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        };
        assert_eq!(spec.all_resources().len(), 1);

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["uid"], "acme");
        assert!(value["namespaces"].is_array());
    }
}
