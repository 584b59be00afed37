//! Shared types used across the Loom CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported when all resources are applied and ready
pub const CONDITION_READY: &str = "Ready";
/// Condition type reported while changed resources are being reconciled
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type reported when a field-manager conflict was detected
pub const CONDITION_CONFLICTED: &str = "Conflicted";
/// Condition type reported when the node is unhealthy
pub const CONDITION_DEGRADED: &str = "Degraded";

/// What happens to a managed resource when its owner goes away
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Delete the resource (404 on delete counts as success)
    #[default]
    Delete,
    /// Keep the resource, strip ownership, stamp orphan markers
    Retain,
}

impl DeletionPolicy {
    /// Label value used in annotations and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "Delete",
            Self::Retain => "Retain",
        }
    }

    /// Parse from the persisted annotation value; unknown input falls back
    /// to Delete, the default policy
    pub fn from_annotation(value: &str) -> Self {
        match value {
            "Retain" => Self::Retain,
            _ => Self::Delete,
        }
    }
}

/// How to react to a field-manager conflict during apply
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Retry the apply once with force=true, taking field ownership
    Force,
    /// Surface the conflict and leave the cluster untouched
    #[default]
    Stuck,
}

impl ConflictPolicy {
    /// Label value used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Force => "Force",
            Self::Stuck => "Stuck",
        }
    }
}

/// When a managed resource should be (re)created
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CreationPolicy {
    /// Create once, never reconcile again while it exists
    Once,
    /// Always reconcile toward the desired state
    #[default]
    WhenNeeded,
}

/// How a rendered document is written to the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    /// Server-side apply (three-way merge)
    #[default]
    Apply,
    /// Strategic-merge JSON patch against the current object
    Merge,
    /// Create if absent, else overwrite preserving resourceVersion
    Replace,
}

impl PatchStrategy {
    /// Label value used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

/// A single resource entry within a form.
///
/// The `spec` document is an arbitrary Kubernetes manifest; name, namespace,
/// labels, and annotations are produced from templates with per-tenant
/// variables.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TResource {
    /// Unique identifier within the form (used for dependencies and
    /// applied-key bookkeeping)
    pub id: String,

    /// The Kubernetes resource manifest (apiVersion/kind/metadata/spec/...)
    pub spec: serde_json::Value,

    /// IDs of resources that must be ready before this one is applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_ids: Vec<String>,

    /// When the resource should be created (default: WhenNeeded)
    #[serde(default)]
    pub creation_policy: CreationPolicy,

    /// What happens on owner deletion (default: Delete)
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// How to handle field-manager conflicts (default: Stuck)
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// How the document is written to the cluster (default: apply)
    #[serde(default)]
    pub patch_strategy: PatchStrategy,

    /// Template for the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_template: Option<String>,

    /// Template for the target namespace; empty means the node's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_template: Option<String>,

    /// Labels to apply to the resource (values support templates)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels_template: BTreeMap<String, String>,

    /// Annotations to apply to the resource (values support templates)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations_template: BTreeMap<String, String>,

    /// Path expressions removed from the desired document before diffing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_fields: Vec<String>,

    /// Whether to wait for readiness before dependents proceed (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_ready: Option<bool>,

    /// Maximum seconds to wait for readiness, 1..3600 (default: 300)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

impl TResource {
    /// Effective waitForReady with the documented default
    pub fn wait_for_ready(&self) -> bool {
        self.wait_for_ready.unwrap_or(true)
    }

    /// Effective readiness timeout with the documented default
    pub fn timeout(&self) -> std::time::Duration {
        let secs = self.timeout_seconds.unwrap_or(300).clamp(1, 3600);
        std::time::Duration::from_secs(secs as u64)
    }

    /// The manifest's kind, when present
    pub fn kind(&self) -> Option<&str> {
        self.spec.get("kind").and_then(|k| k.as_str())
    }
}

/// Resource entries grouped by kind.
///
/// Pre-classified kinds get their own group; `manifests` is the catch-all
/// for everything else. Shared by forms (templated entries) and nodes
/// (resolved entries).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroups {
    /// Namespace entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<TResource>,

    /// ServiceAccount entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<TResource>,

    /// ConfigMap entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<TResource>,

    /// Secret entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<TResource>,

    /// PersistentVolumeClaim entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<TResource>,

    /// Deployment entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<TResource>,

    /// StatefulSet entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_sets: Vec<TResource>,

    /// DaemonSet entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daemon_sets: Vec<TResource>,

    /// Service entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<TResource>,

    /// Ingress entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<TResource>,

    /// Job entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<TResource>,

    /// CronJob entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<TResource>,

    /// Catch-all for entries whose kind is not pre-classified
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<TResource>,
}

impl ResourceGroups {
    /// Flatten every group into one list, in group order
    pub fn all(&self) -> Vec<TResource> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.namespaces.iter().cloned());
        out.extend(self.service_accounts.iter().cloned());
        out.extend(self.config_maps.iter().cloned());
        out.extend(self.secrets.iter().cloned());
        out.extend(self.persistent_volume_claims.iter().cloned());
        out.extend(self.deployments.iter().cloned());
        out.extend(self.stateful_sets.iter().cloned());
        out.extend(self.daemon_sets.iter().cloned());
        out.extend(self.services.iter().cloned());
        out.extend(self.ingresses.iter().cloned());
        out.extend(self.jobs.iter().cloned());
        out.extend(self.cron_jobs.iter().cloned());
        out.extend(self.manifests.iter().cloned());
        out
    }

    /// Total number of entries across all groups
    pub fn len(&self) -> usize {
        self.namespaces.len()
            + self.service_accounts.len()
            + self.config_maps.len()
            + self.secrets.len()
            + self.persistent_volume_claims.len()
            + self.deployments.len()
            + self.stateful_sets.len()
            + self.daemon_sets.len()
            + self.services.len()
            + self.ingresses.len()
            + self.jobs.len()
            + self.cron_jobs.len()
            + self.manifests.len()
    }

    /// True when no group has entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a fallible transform to every entry, keeping the group shape
    pub fn try_map<E>(
        &self,
        mut f: impl FnMut(&TResource) -> Result<TResource, E>,
    ) -> Result<ResourceGroups, E> {
        fn map_group<E>(
            group: &[TResource],
            f: &mut impl FnMut(&TResource) -> Result<TResource, E>,
        ) -> Result<Vec<TResource>, E> {
            group.iter().map(|r| f(r)).collect()
        }

        Ok(ResourceGroups {
            namespaces: map_group(&self.namespaces, &mut f)?,
            service_accounts: map_group(&self.service_accounts, &mut f)?,
            config_maps: map_group(&self.config_maps, &mut f)?,
            secrets: map_group(&self.secrets, &mut f)?,
            persistent_volume_claims: map_group(&self.persistent_volume_claims, &mut f)?,
            deployments: map_group(&self.deployments, &mut f)?,
            stateful_sets: map_group(&self.stateful_sets, &mut f)?,
            daemon_sets: map_group(&self.daemon_sets, &mut f)?,
            services: map_group(&self.services, &mut f)?,
            ingresses: map_group(&self.ingresses, &mut f)?,
            jobs: map_group(&self.jobs, &mut f)?,
            cron_jobs: map_group(&self.cron_jobs, &mut f)?,
            manifests: map_group(&self.manifests, &mut f)?,
        })
    }
}

/// Condition status following Kubernetes API conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Build from a boolean
    pub fn from_bool(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }

    /// Numeric gauge value (0=False, 1=True, 2=Unknown)
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::False => 0,
            Self::True => 1,
            Self::Unknown => 2,
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Progressing, Conflicted, Degraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when two conditions agree on everything except the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let res = TResource::default();
        assert_eq!(res.creation_policy, CreationPolicy::WhenNeeded);
        assert_eq!(res.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(res.conflict_policy, ConflictPolicy::Stuck);
        assert_eq!(res.patch_strategy, PatchStrategy::Apply);
        assert!(res.wait_for_ready());
        assert_eq!(res.timeout(), std::time::Duration::from_secs(300));
    }

    #[test]
    fn test_timeout_is_clamped() {
        let res = TResource {
            timeout_seconds: Some(10_000),
            ..Default::default()
        };
        assert_eq!(res.timeout(), std::time::Duration::from_secs(3600));

        let res = TResource {
            timeout_seconds: Some(0),
            ..Default::default()
        };
        assert_eq!(res.timeout(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_patch_strategy_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PatchStrategy::Apply).unwrap(),
            "\"apply\""
        );
        assert_eq!(
            serde_json::to_string(&PatchStrategy::Replace).unwrap(),
            "\"replace\""
        );
        let parsed: PatchStrategy = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(parsed, PatchStrategy::Merge);
    }

    #[test]
    fn test_deletion_policy_annotation_round_trip() {
        assert_eq!(
            DeletionPolicy::from_annotation(DeletionPolicy::Retain.as_str()),
            DeletionPolicy::Retain
        );
        // Unknown annotation values fall back to the default policy
        assert_eq!(
            DeletionPolicy::from_annotation("garbage"),
            DeletionPolicy::Delete
        );
    }

    #[test]
    fn test_resource_groups_flatten_in_group_order() {
        let mk = |id: &str| TResource {
            id: id.to_string(),
            ..Default::default()
        };
        let groups = ResourceGroups {
            namespaces: vec![mk("ns")],
            config_maps: vec![mk("cm")],
            deployments: vec![mk("deploy")],
            manifests: vec![mk("extra")],
            ..Default::default()
        };

        let ids: Vec<_> = groups.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["ns", "cm", "deploy", "extra"]);
        assert_eq!(groups.len(), 4);
        assert!(!groups.is_empty());
    }

    #[test]
    fn test_condition_same_state_ignores_timestamp() {
        let a = Condition::new(CONDITION_READY, ConditionStatus::True, "Reconciled", "ok");
        let mut b = a.clone();
        b.last_transition_time = Utc::now() + chrono::Duration::seconds(60);
        assert!(a.same_state(&b));

        b.reason = "Other".to_string();
        assert!(!a.same_state(&b));
    }

    #[test]
    fn test_condition_status_gauge_values() {
        assert_eq!(ConditionStatus::False.gauge_value(), 0);
        assert_eq!(ConditionStatus::True.gauge_value(), 1);
        assert_eq!(ConditionStatus::Unknown.gauge_value(), 2);
    }
}
