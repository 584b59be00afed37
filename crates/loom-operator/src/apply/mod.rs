//! Three-way merge apply with ownership tracking
//!
//! The apply engine takes a rendered document, the owning tenant node, the
//! per-resource policies, and the ignored-paths filter, and converges the
//! cluster toward the desired state. Ownership is recorded in two channels:
//! a controller owner reference when feasible, and tracking labels always -
//! pruning depends on the labels.

mod applier;
mod client;
mod doc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use applier::{Applier, ApplyOutcome, NodeOwner};
pub use client::KubeResourceClient;
pub(crate) use doc::{
    annotations_mut, ensure_object, is_subset, labels_mut, remove_annotation, remove_label,
};

/// Kinds that cannot carry a namespaced owner reference
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
];

/// True for kinds that exist outside any namespace
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Error taxonomy surfaced to the controller loops
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The target resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A field-manager conflict; routed by the resource's conflict policy
    #[error("resource conflict for {namespace}/{name} ({kind}): {message}")]
    Conflict {
        /// Conflicting resource name
        name: String,
        /// Conflicting resource namespace ("" for cluster-scoped)
        namespace: String,
        /// Conflicting resource kind
        kind: String,
        /// Server-reported conflict detail
        message: String,
    },

    /// The document was rejected by the server (400/422) or is malformed
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The operator lacks permission for the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A deadline elapsed (request timeout or readiness wait)
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient failure; the caller should retry with backoff
    #[error("transient error: {0}")]
    Transient(String),

    /// Terminal failure; retrying will not help
    #[error("terminal error: {0}")]
    Terminal(String),
}

impl ApplyError {
    /// Whether the controller should requeue with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Classify a kube client error against the object it concerned
    pub fn classify(err: kube::Error, obj_ref: &ObjectRef) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound(format!("{obj_ref}: {}", ae.message)),
                409 => Self::Conflict {
                    name: obj_ref.name.clone(),
                    namespace: obj_ref.namespace.clone().unwrap_or_default(),
                    kind: obj_ref.kind.clone(),
                    message: ae.message,
                },
                400 | 422 => Self::InvalidSpec(format!("{obj_ref}: {}", ae.message)),
                403 => Self::Forbidden(format!("{obj_ref}: {}", ae.message)),
                408 => Self::Timeout(format!("{obj_ref}: {}", ae.message)),
                code if (500..600).contains(&code) => {
                    Self::Transient(format!("{obj_ref}: {} ({code})", ae.message))
                }
                code => Self::Terminal(format!("{obj_ref}: {} ({code})", ae.message)),
            },
            // Connection-level failures are worth retrying
            other => Self::Transient(format!("{obj_ref}: {other}")),
        }
    }
}

/// Identity of a cluster object extracted from its document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// apiVersion of the document
    pub api_version: String,
    /// kind of the document
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace; None for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Extract the identity from a rendered document
    pub fn from_doc(doc: &Value) -> Result<Self, ApplyError> {
        let api_version = doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| ApplyError::InvalidSpec("document has no apiVersion".into()))?;
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| ApplyError::InvalidSpec("document has no kind".into()))?;
        let name = doc
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ApplyError::InvalidSpec("document has no metadata.name".into()))?;
        let namespace = doc
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .map(String::from);

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace,
        })
    }

    /// Build a reference for pruning from an applied key's components
    pub fn from_parts(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(String::from),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}//{}", self.kind, self.name),
        }
    }
}

/// Abstraction over the dynamic Kubernetes client.
///
/// All operations work on JSON documents so the applier stays testable
/// with a mock; the production impl converts to `DynamicObject`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch the current object, None when absent
    async fn get(&self, obj_ref: &ObjectRef) -> Result<Option<Value>, ApplyError>;

    /// Server-side apply with our field manager
    async fn ssa_apply(&self, doc: &Value, force: bool) -> Result<Value, ApplyError>;

    /// Strategic-merge JSON patch against the current object
    async fn merge_patch(&self, doc: &Value) -> Result<Value, ApplyError>;

    /// Create the object
    async fn create(&self, doc: &Value) -> Result<Value, ApplyError>;

    /// Replace the object (caller sets resourceVersion)
    async fn replace(&self, doc: &Value) -> Result<Value, ApplyError>;

    /// Delete the object; NotFound is surfaced, not swallowed
    async fn delete(&self, obj_ref: &ObjectRef) -> Result<(), ApplyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_ref_from_doc() {
        let doc = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "tenant-a"}
        });
        let obj_ref = ObjectRef::from_doc(&doc).unwrap();
        assert_eq!(obj_ref.api_version, "apps/v1");
        assert_eq!(obj_ref.kind, "Deployment");
        assert_eq!(obj_ref.name, "web");
        assert_eq!(obj_ref.namespace.as_deref(), Some("tenant-a"));
        assert_eq!(obj_ref.to_string(), "Deployment/tenant-a/web");
    }

    #[test]
    fn test_object_ref_cluster_scoped() {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "tenant-a"}
        });
        let obj_ref = ObjectRef::from_doc(&doc).unwrap();
        assert_eq!(obj_ref.namespace, None);
        assert_eq!(obj_ref.to_string(), "Namespace//tenant-a");
    }

    #[test]
    fn test_object_ref_rejects_incomplete_docs() {
        assert!(ObjectRef::from_doc(&json!({"kind": "ConfigMap"})).is_err());
        assert!(ObjectRef::from_doc(&json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {}
        }))
        .is_err());
    }

    #[test]
    fn test_is_cluster_scoped() {
        assert!(is_cluster_scoped("Namespace"));
        assert!(is_cluster_scoped("ClusterRole"));
        assert!(!is_cluster_scoped("Deployment"));
        assert!(!is_cluster_scoped("ConfigMap"));
    }

    #[test]
    fn test_classify_error_codes() {
        let obj_ref = ObjectRef::from_parts("v1", "ConfigMap", "bar", Some("foo"));
        let api_err = |code: u16| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "detail".into(),
                reason: "Because".into(),
                code,
            })
        };

        assert!(matches!(
            ApplyError::classify(api_err(404), &obj_ref),
            ApplyError::NotFound(_)
        ));
        match ApplyError::classify(api_err(409), &obj_ref) {
            ApplyError::Conflict { name, namespace, kind, .. } => {
                assert_eq!(name, "bar");
                assert_eq!(namespace, "foo");
                assert_eq!(kind, "ConfigMap");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(matches!(
            ApplyError::classify(api_err(422), &obj_ref),
            ApplyError::InvalidSpec(_)
        ));
        assert!(matches!(
            ApplyError::classify(api_err(403), &obj_ref),
            ApplyError::Forbidden(_)
        ));
        assert!(matches!(
            ApplyError::classify(api_err(503), &obj_ref),
            ApplyError::Transient(_)
        ));
        assert!(matches!(
            ApplyError::classify(api_err(410), &obj_ref),
            ApplyError::Terminal(_)
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(ApplyError::Transient("x".into()).is_retryable());
        assert!(ApplyError::Timeout("x".into()).is_retryable());
        assert!(!ApplyError::InvalidSpec("x".into()).is_retryable());
        assert!(!ApplyError::Conflict {
            name: "n".into(),
            namespace: "ns".into(),
            kind: "ConfigMap".into(),
            message: "m".into()
        }
        .is_retryable());
    }
}
