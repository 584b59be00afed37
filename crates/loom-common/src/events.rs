//! Kubernetes Event recording for Loom controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ResourceConflict")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "loom-node-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored; no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Template resources are being applied to the cluster
    pub const TEMPLATE_APPLYING: &str = "TemplateResourcesApplying";
    /// All template resources reconciled successfully
    pub const TEMPLATE_APPLIED: &str = "TemplateAppliedSuccess";
    /// Template application finished with failures
    pub const TEMPLATE_APPLIED_PARTIAL: &str = "TemplateAppliedPartial";
    /// Template rendering failed for a resource
    pub const TEMPLATE_RENDER_ERROR: &str = "TemplateRenderError";
    /// A resource apply failed
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// A field-manager conflict was detected
    pub const RESOURCE_CONFLICT: &str = "ResourceConflict";
    /// An orphaned resource was deleted
    pub const ORPHANED_RESOURCE_DELETED: &str = "OrphanedResourceDeleted";
    /// An orphaned resource was retained with orphan markers
    pub const ORPHANED_RESOURCE_RETAINED: &str = "OrphanedResourceRetained";
    /// A resource was retained on node deletion
    pub const RESOURCE_RETAINED: &str = "ResourceRetained";
    /// Node deletion completed
    pub const NODE_DELETED: &str = "NodeDeleted";
    /// Node cleanup had partial failures
    pub const CLEANUP_PARTIAL_FAILURE: &str = "CleanupPartialFailure";
    /// A node is being deleted because its row disappeared
    pub const NODE_DELETING: &str = "NodeDeleting";
    /// Node deletion by the hub failed
    pub const NODE_DELETION_FAILED: &str = "NodeDeletionFailed";
    /// The hub data-source query failed
    pub const DATASOURCE_QUERY_FAILED: &str = "DatasourceQueryFailed";
    /// Form validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deletion/cleanup path
    pub const CLEANUP: &str = "Cleanup";
    /// Hub data-source synchronization
    pub const SYNC: &str = "Sync";
}
