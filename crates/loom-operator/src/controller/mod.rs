//! Reconciliation loops
//!
//! Three cooperating controllers drive the materializer:
//! - [`hub`] polls the data source and materializes one node per row/form
//! - [`form`] validates templates and stamps their status
//! - [`node`] renders, orders, and applies each tenant's resources

pub mod form;
pub mod hub;
pub mod node;
mod render;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::apply::{is_cluster_scoped, ObjectRef};

pub use render::{
    build_applied_keys, build_variables_from_annotations, materialize_document, resolve_groups,
    resolve_resource,
};

/// Requeue backoff base for transient errors
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Requeue backoff cap for transient errors
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Build the applied-resource key for an object: `Kind/namespace/name@id`,
/// with an empty namespace for cluster-scoped kinds.
pub fn build_resource_key(obj_ref: &ObjectRef, resource_id: &str) -> String {
    format!(
        "{}/{}/{}@{}",
        obj_ref.kind,
        obj_ref.namespace.as_deref().unwrap_or(""),
        obj_ref.name,
        resource_id
    )
}

/// Parse an applied-resource key back into (kind, namespace, name, id).
///
/// The namespace component may be empty for cluster-scoped kinds.
pub fn parse_resource_key(key: &str) -> Option<(String, String, String, String)> {
    let (path, id) = key.split_once('@')?;
    let mut parts = path.splitn(3, '/');
    let kind = parts.next()?.to_string();
    let namespace = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    if kind.is_empty() || name.is_empty() || id.is_empty() {
        return None;
    }
    Some((kind, namespace, name, id.to_string()))
}

/// Best-effort apiVersion for a kind recovered from an applied key.
///
/// Orphan pruning only has the key to go on; the well-known kinds map to
/// their stable groups and anything else falls back to core v1.
pub fn api_version_for_kind(kind: &str) -> &'static str {
    match kind {
        "Namespace" | "ServiceAccount" | "Service" | "ConfigMap" | "Secret"
        | "PersistentVolumeClaim" => "v1",
        "Deployment" | "StatefulSet" | "DaemonSet" => "apps/v1",
        "Job" | "CronJob" => "batch/v1",
        "Ingress" | "NetworkPolicy" => "networking.k8s.io/v1",
        _ => "v1",
    }
}

/// Rebuild an [`ObjectRef`] from an applied key's components
pub fn object_ref_from_key(kind: &str, namespace: &str, name: &str) -> ObjectRef {
    let ns = if namespace.is_empty() || is_cluster_scoped(kind) {
        None
    } else {
        Some(namespace)
    };
    ObjectRef::from_parts(api_version_for_kind(kind), kind, name, ns)
}

/// Per-object exponential backoff for transient reconcile errors.
///
/// kube-runtime's error policy has no attempt memory of its own, so the
/// controllers track attempts here: base 1s, doubling, capped at 5m, reset
/// on the next successful reconcile.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl BackoffTracker {
    /// Create a tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().expect("backoff lock poisoned");
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        let delay = BACKOFF_BASE
            .checked_mul(2u32.saturating_pow(*attempt))
            .unwrap_or(BACKOFF_CAP)
            .min(BACKOFF_CAP);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Clear the attempt count after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .expect("backoff lock poisoned")
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_round_trip() {
        let obj_ref = ObjectRef::from_parts("apps/v1", "Deployment", "myapp", Some("default"));
        let key = build_resource_key(&obj_ref, "app-deployment");
        assert_eq!(key, "Deployment/default/myapp@app-deployment");

        let (kind, namespace, name, id) = parse_resource_key(&key).unwrap();
        assert_eq!(kind, "Deployment");
        assert_eq!(namespace, "default");
        assert_eq!(name, "myapp");
        assert_eq!(id, "app-deployment");
    }

    #[test]
    fn test_cluster_scoped_key_has_empty_namespace() {
        let obj_ref = ObjectRef::from_parts("v1", "Namespace", "tenant-ns", None);
        let key = build_resource_key(&obj_ref, "ns");
        assert_eq!(key, "Namespace//tenant-ns@ns");

        let (kind, namespace, name, id) = parse_resource_key(&key).unwrap();
        assert_eq!(kind, "Namespace");
        assert_eq!(namespace, "");
        assert_eq!(name, "tenant-ns");
        assert_eq!(id, "ns");

        let rebuilt = object_ref_from_key(&kind, &namespace, &name);
        assert_eq!(rebuilt.namespace, None);
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(parse_resource_key("no-at-sign").is_none());
        assert!(parse_resource_key("Kind/ns@id").is_none());
        assert!(parse_resource_key("Kind/ns/name@").is_none());
        assert!(parse_resource_key("/ns/name@id").is_none());
    }

    #[test]
    fn test_api_version_lookup() {
        assert_eq!(api_version_for_kind("Deployment"), "apps/v1");
        assert_eq!(api_version_for_kind("ConfigMap"), "v1");
        assert_eq!(api_version_for_kind("CronJob"), "batch/v1");
        assert_eq!(api_version_for_kind("Ingress"), "networking.k8s.io/v1");
        assert_eq!(api_version_for_kind("SomethingCustom"), "v1");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let tracker = BackoffTracker::new();
        assert_eq!(tracker.next_delay("a"), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("a"), Duration::from_secs(2));
        assert_eq!(tracker.next_delay("a"), Duration::from_secs(4));

        for _ in 0..20 {
            tracker.next_delay("a");
        }
        assert_eq!(tracker.next_delay("a"), BACKOFF_CAP);

        // Independent keys do not interfere
        assert_eq!(tracker.next_delay("b"), Duration::from_secs(1));

        tracker.reset("a");
        assert_eq!(tracker.next_delay("a"), Duration::from_secs(1));
    }
}
