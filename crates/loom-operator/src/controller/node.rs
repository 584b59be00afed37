//! LoomNode controller
//!
//! The critical path: renders each tenant's resources, orders them through
//! the dependency graph, applies level by level with readiness gates,
//! prunes resources that disappeared from the template, and publishes
//! status through the status manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use loom_common::crd::{
    Condition, ConditionStatus, CreationPolicy, DeletionPolicy, LoomNode, TResource,
    CONDITION_CONFLICTED, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
};
use loom_common::events::{actions, reasons};
use loom_common::metrics::{self, ReconcileResult};
use loom_common::{
    Error, EventPublisher, ANNOTATION_CREATED_ONCE, ANNOTATION_DELETION_POLICY, API_GROUP,
    LABEL_TENANT_NAME, LABEL_TENANT_NAMESPACE, VALUE_TRUE,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::apply::{Applier, ApplyError, NodeOwner, ObjectRef, ResourceClient};
use crate::fieldpath::FieldFilter;
use crate::graph;
use crate::readiness::{self, Checker};
use crate::status::{MetricsPayload, StatusManager};
use crate::template::{Engine, Variables};

use super::render::{build_applied_keys, build_variables_from_annotations, materialize_document};
use super::{object_ref_from_key, parse_resource_key, BackoffTracker};

/// Finalizer guarding node cleanup
pub const NODE_FINALIZER: &str = "loomnode.loom.dev/finalizer";

/// Upper bound for the deletion cleanup pass
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Requeue after a full reconcile, for quick readiness convergence
const SPEC_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue after a status-only sweep
const STATUS_REQUEUE: Duration = Duration::from_secs(300);

/// Shared state handed to every node reconcile
pub struct Context {
    /// Kube client for the node objects themselves
    pub client: Client,
    /// Dynamic client for managed resources
    pub resources: Arc<dyn ResourceClient>,
    /// Status event sink
    pub status: Arc<StatusManager>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Shared template engine
    pub engine: Arc<Engine>,
    /// Transient-error backoff state
    pub backoff: BackoffTracker,
}

/// What kind of reconciliation a node needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReconcileType {
    /// Finalizer needs to be added
    Init,
    /// Node is being deleted
    Cleanup,
    /// Status-only fast path, no apply
    Status,
    /// Full reconcile with apply
    Spec,
}

fn determine_reconcile_type(node: &LoomNode) -> ReconcileType {
    if node.meta().deletion_timestamp.is_some() {
        return ReconcileType::Cleanup;
    }
    if !node.finalizers().iter().any(|f| f == NODE_FINALIZER) {
        return ReconcileType::Init;
    }
    let observed = node
        .status
        .as_ref()
        .map(|s| s.observed_generation)
        .unwrap_or(0);
    if node.meta().generation == Some(observed) && observed != 0 {
        // Generation unchanged: likely a child-resource status change
        return ReconcileType::Status;
    }
    ReconcileType::Spec
}

fn node_object_ref(node: &LoomNode) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{API_GROUP}/v1alpha1")),
        kind: Some("LoomNode".to_string()),
        name: node.metadata.name.clone(),
        namespace: node.metadata.namespace.clone(),
        uid: node.metadata.uid.clone(),
        ..Default::default()
    }
}

fn node_owner(node: &LoomNode) -> NodeOwner {
    NodeOwner {
        name: node.name_any(),
        namespace: node.namespace().unwrap_or_default(),
        uid: node.uid().unwrap_or_default(),
    }
}

/// Reconcile one node
pub async fn reconcile(node: Arc<LoomNode>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = node.name_any();
    let start = Instant::now();

    let action = match determine_reconcile_type(&node) {
        ReconcileType::Cleanup => reconcile_cleanup(&node, &ctx).await,
        ReconcileType::Init => reconcile_init(&node, &ctx).await,
        ReconcileType::Status => reconcile_status(&node, &ctx, start).await,
        ReconcileType::Spec => reconcile_spec(&node, &ctx, start).await,
    };

    if action.is_ok() {
        ctx.backoff.reset(&name);
    }
    action
}

/// Error policy: transient errors requeue with exponential backoff,
/// everything else waits for a spec or cluster change.
pub fn error_policy(node: Arc<LoomNode>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = node.name_any();
    if err.is_retryable() {
        let delay = ctx.backoff.next_delay(&name);
        warn!(node = %name, error = %err, delay_secs = delay.as_secs(), "reconcile failed, requeuing");
        Action::requeue(delay)
    } else {
        warn!(node = %name, error = %err, "reconcile failed terminally, waiting for change");
        Action::await_change()
    }
}

/// Add the finalizer and requeue to continue
async fn reconcile_init(node: &LoomNode, ctx: &Context) -> Result<Action, Error> {
    let api: Api<LoomNode> = Api::namespaced(
        ctx.client.clone(),
        &node.namespace().unwrap_or_default(),
    );

    let mut finalizers = node.finalizers().to_vec();
    finalizers.push(NODE_FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &node.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    info!(node = %node.name_any(), "finalizer added");
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Run the deletion path for every owned resource, then drop the finalizer
async fn reconcile_cleanup(node: &LoomNode, ctx: &Context) -> Result<Action, Error> {
    let name = node.name_any();
    if !node.finalizers().iter().any(|f| f == NODE_FINALIZER) {
        return Ok(Action::await_change());
    }

    info!(node = %name, "node deletion requested, starting cleanup");

    let cleanup = tokio::time::timeout(CLEANUP_TIMEOUT, cleanup_resources(node, ctx)).await;
    match cleanup {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(node = %name, error = %e, "cleanup encountered errors, proceeding with deletion");
            ctx.events
                .publish(
                    &node_object_ref(node),
                    EventType::Warning,
                    reasons::CLEANUP_PARTIAL_FAILURE,
                    actions::CLEANUP,
                    Some(format!(
                        "Some resources could not be cleaned up: {e}. Remaining owner-referenced \
                         resources will be garbage collected."
                    )),
                )
                .await;
        }
        Err(_) => {
            warn!(node = %name, "cleanup timed out, proceeding with deletion");
        }
    }

    // Always remove the finalizer after the cleanup attempt
    let api: Api<LoomNode> = Api::namespaced(
        ctx.client.clone(),
        &node.namespace().unwrap_or_default(),
    );
    let finalizers: Vec<String> = node
        .finalizers()
        .iter()
        .filter(|f| *f != NODE_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    ctx.events
        .publish(
            &node_object_ref(node),
            EventType::Normal,
            reasons::NODE_DELETED,
            actions::CLEANUP,
            Some(format!("LoomNode {name} deleted")),
        )
        .await;
    info!(node = %name, "node deletion completed, finalizer removed");
    Ok(Action::await_change())
}

/// Best-effort deletion/retention of every resource the node owns
async fn cleanup_resources(node: &LoomNode, ctx: &Context) -> Result<(), Error> {
    let applier = Applier::new(Arc::clone(&ctx.resources));

    let vars = match build_variables_from_annotations(node) {
        Ok(vars) => vars,
        Err(e) => {
            warn!(error = %e, "failed to build variables for cleanup, using empty set");
            Variables::new()
        }
    };

    let resources = node.spec.all_resources();
    info!(count = resources.len(), "collected resources for cleanup");

    let mut errors = Vec::new();
    let mut retained = 0usize;

    for resource in &resources {
        let doc = match materialize_document(&ctx.engine, resource, &vars, node) {
            Ok(doc) => doc,
            Err(e) => {
                errors.push(format!("render failed for {}: {e}", resource.id));
                continue;
            }
        };
        let obj_ref = match ObjectRef::from_doc(&doc) {
            Ok(obj_ref) => obj_ref,
            Err(e) => {
                errors.push(format!("bad document for {}: {e}", resource.id));
                continue;
            }
        };

        match applier
            .delete_resource(&obj_ref, resource.deletion_policy, "NodeDeleted")
            .await
        {
            Ok(()) => {
                if resource.deletion_policy == DeletionPolicy::Retain {
                    retained += 1;
                    ctx.events
                        .publish(
                            &node_object_ref(node),
                            EventType::Normal,
                            reasons::RESOURCE_RETAINED,
                            actions::CLEANUP,
                            Some(format!(
                                "Resource {obj_ref} retained with orphan markers (ownerReferences removed)"
                            )),
                        )
                        .await;
                }
            }
            Err(e) => {
                errors.push(format!("cleanup failed for {obj_ref}: {e}"));
            }
        }
    }

    info!(
        node = %node.name_any(),
        total = resources.len(),
        retained,
        failed = errors.len(),
        "node resource cleanup completed"
    );

    if errors.is_empty() {
        Ok(())
    } else {
        let shown = errors.iter().take(3).cloned().collect::<Vec<_>>().join("; ");
        Err(Error::internal_with_context(
            "cleanup",
            format!("cleanup had {} errors, first: {shown}", errors.len()),
        ))
    }
}

/// Full reconcile: render, order, prune, apply level by level, publish
async fn reconcile_spec(node: &LoomNode, ctx: &Context, start: Instant) -> Result<Action, Error> {
    let name = node.name_any();
    info!(node = %name, generation = ?node.meta().generation, "running full reconcile");

    let vars = match build_variables_from_annotations(node) {
        Ok(vars) => vars,
        Err(e) => {
            publish_degraded(ctx, node, "VariablesBuildError", &e.to_string()).await;
            metrics::record_reconcile_duration(ReconcileResult::Error, start.elapsed().as_secs_f64());
            return Err(e);
        }
    };

    let resources = node.spec.all_resources();

    let mut dep_graph = match graph::build_graph(&resources) {
        Ok(graph) => graph,
        Err(e) => {
            publish_degraded(ctx, node, "DependencyCycle", &e.to_string()).await;
            metrics::record_reconcile_duration(ReconcileResult::Error, start.elapsed().as_secs_f64());
            return Err(e.into());
        }
    };
    if let Err(e) = dep_graph.topological_sort() {
        publish_degraded(ctx, node, "DependencyCycle", &e.to_string()).await;
        metrics::record_reconcile_duration(ReconcileResult::Error, start.elapsed().as_secs_f64());
        return Err(e.into());
    }
    let levels = dep_graph.by_level();

    // Prune resources whose keys disappeared from the rendered set
    let current_keys = build_applied_keys(&ctx.engine, node, &vars);
    let previous_keys = node
        .status
        .as_ref()
        .map(|s| s.applied_resources.clone())
        .unwrap_or_default();
    let orphaned: Vec<&String> = previous_keys
        .iter()
        .filter(|key| !current_keys.contains(key))
        .collect();
    if !orphaned.is_empty() {
        info!(node = %name, count = orphaned.len(), "found orphaned resources");
        for key in orphaned {
            if let Err(e) = delete_orphaned_resource(node, ctx, key).await {
                warn!(node = %name, key = %key, error = %e, "failed to prune orphaned resource");
            }
        }
    }

    // Apply level by level: a level must be fully applied (and ready,
    // where requested) before the next level starts
    let owner = node_owner(node);
    let applier = Applier::new(Arc::clone(&ctx.resources));
    let checker = Checker::new(Arc::clone(&ctx.resources));
    let total = resources.len() as i32;

    let mut tally = ApplyTally::default();
    let mut progressing_announced = false;

    for (level, level_nodes) in &levels {
        if node_is_gone(node, ctx).await {
            info!(node = %name, "node deleted during reconciliation, stopping");
            return Ok(Action::await_change());
        }

        debug!(node = %name, level, resources = level_nodes.len(), "applying level");
        let outcomes = join_all(level_nodes.iter().map(|graph_node| {
            apply_one(node, ctx, &applier, &checker, &owner, &graph_node.resource, &vars)
        }))
        .await;

        for outcome in outcomes {
            tally.absorb(outcome);
        }

        if tally.changed > 0 && !progressing_announced {
            progressing_announced = true;
            ctx.status
                .publish_progressing_condition(node, true, "Reconciling", "Reconciling changed resources")
                .await;
            ctx.events
                .publish(
                    &node_object_ref(node),
                    EventType::Normal,
                    reasons::TEMPLATE_APPLYING,
                    actions::RECONCILE,
                    Some(format!(
                        "Applying {total} resources from LoomForm '{}' in dependency order",
                        node.spec.form_ref
                    )),
                )
                .await;
        }
    }

    // Publish the full snapshot
    let calc = calculate_node_status(
        tally.ready,
        tally.failed,
        tally.conflicted,
        total,
        current_keys.clone(),
        false,
    );
    publish_status(ctx, node, &calc).await;
    ctx.status
        .publish_observed_generation(node, node.meta().generation.unwrap_or(0))
        .await;

    if tally.changed > 0 {
        let (event_type, reason, note) = if tally.failed > 0 {
            (
                EventType::Warning,
                reasons::TEMPLATE_APPLIED_PARTIAL,
                format!(
                    "Applied LoomForm '{}' with partial success: {} changed, {} ready, {} failed of {} resources",
                    node.spec.form_ref, tally.changed, tally.ready, tally.failed, total
                ),
            )
        } else {
            (
                EventType::Normal,
                reasons::TEMPLATE_APPLIED,
                format!(
                    "Successfully applied LoomForm '{}': {} resources reconciled ({} changed, {} ready)",
                    node.spec.form_ref, total, tally.changed, tally.ready
                ),
            )
        };
        ctx.events
            .publish(&node_object_ref(node), event_type, reason, actions::RECONCILE, Some(note))
            .await;
    }

    let result = if tally.failed > 0 {
        ReconcileResult::PartialFailure
    } else {
        ReconcileResult::Success
    };
    metrics::record_reconcile_duration(result, start.elapsed().as_secs_f64());

    // Stuck conflicts never requeue on their own: when every failure is a
    // conflict, only a template or cluster change can make progress
    if tally.conflicted > 0 && tally.failed == tally.conflicted {
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(SPEC_REQUEUE))
}

/// Status-only fast path: readiness sweep without applying anything
async fn reconcile_status(node: &LoomNode, ctx: &Context, start: Instant) -> Result<Action, Error> {
    let name = node.name_any();
    debug!(node = %name, "running status-only reconcile");

    let vars = build_variables_from_annotations(node)?;
    let resources = node.spec.all_resources();
    let total = resources.len() as i32;

    let mut ready = 0i32;
    let mut failed = 0i32;
    let mut conflicted = 0i32;

    for resource in &resources {
        let Ok(doc) = materialize_document(&ctx.engine, resource, &vars, node) else {
            failed += 1;
            continue;
        };
        let Ok(obj_ref) = ObjectRef::from_doc(&doc) else {
            failed += 1;
            continue;
        };

        match ctx.resources.get(&obj_ref).await {
            Ok(Some(current)) => {
                if has_ownership_conflict(&current, node) {
                    conflicted += 1;
                    failed += 1;
                } else if resource.wait_for_ready() && !readiness::is_ready(&current) {
                    failed += 1;
                } else {
                    ready += 1;
                }
            }
            Ok(None) => failed += 1,
            Err(e) => {
                debug!(object = %obj_ref, error = %e, "status check failed");
                failed += 1;
            }
        }
    }

    let applied = node
        .status
        .as_ref()
        .map(|s| s.applied_resources.clone())
        .unwrap_or_default();
    let calc = calculate_node_status(ready, failed, conflicted, total, applied, false);
    publish_status(ctx, node, &calc).await;
    ctx.status
        .publish_observed_generation(node, node.meta().generation.unwrap_or(0))
        .await;

    metrics::record_reconcile_duration(ReconcileResult::StatusOnly, start.elapsed().as_secs_f64());
    Ok(Action::requeue(STATUS_REQUEUE))
}

/// Per-resource apply outcome folded into the level tally
#[derive(Clone, Debug, Default)]
struct ResourceOutcome {
    ready: bool,
    failed: bool,
    conflicted: bool,
    changed: bool,
}

#[derive(Clone, Debug, Default)]
struct ApplyTally {
    ready: i32,
    failed: i32,
    conflicted: i32,
    changed: i32,
}

impl ApplyTally {
    fn absorb(&mut self, outcome: ResourceOutcome) {
        if outcome.ready {
            self.ready += 1;
        }
        if outcome.failed {
            self.failed += 1;
        }
        if outcome.conflicted {
            self.conflicted += 1;
        }
        if outcome.changed {
            self.changed += 1;
        }
    }
}

/// Render and apply one resource, then gate on readiness when requested
async fn apply_one(
    node: &LoomNode,
    ctx: &Context,
    applier: &Applier,
    checker: &Checker,
    owner: &NodeOwner,
    resource: &TResource,
    vars: &Variables,
) -> ResourceOutcome {
    let node_ref = node_object_ref(node);

    let doc = match materialize_document(&ctx.engine, resource, vars, node) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(id = %resource.id, error = %e, "failed to render resource");
            ctx.events
                .publish(
                    &node_ref,
                    EventType::Warning,
                    reasons::TEMPLATE_RENDER_ERROR,
                    actions::RECONCILE,
                    Some(format!("Failed to render resource {}: {e}", resource.id)),
                )
                .await;
            return ResourceOutcome {
                failed: true,
                ..Default::default()
            };
        }
    };

    let obj_ref = match ObjectRef::from_doc(&doc) {
        Ok(obj_ref) => obj_ref,
        Err(e) => {
            warn!(id = %resource.id, error = %e, "rendered document is not applyable");
            return ResourceOutcome {
                failed: true,
                ..Default::default()
            };
        }
    };

    // ignoreFields is accepted but inert under Once: after creation the
    // resource is never reconciled again anyway
    let filter = if resource.creation_policy == CreationPolicy::Once {
        FieldFilter::default()
    } else {
        match FieldFilter::compile(&resource.ignore_fields) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(id = %resource.id, error = %e, "invalid ignoreFields path");
                return ResourceOutcome {
                    failed: true,
                    ..Default::default()
                };
            }
        }
    };

    let mut doc = doc;
    if resource.creation_policy == CreationPolicy::Once {
        match check_once_created(ctx, &obj_ref).await {
            Ok(true) => {
                debug!(id = %resource.id, object = %obj_ref, "skipping resource (CreationPolicy=Once, already created)");
                return ResourceOutcome {
                    ready: true,
                    ..Default::default()
                };
            }
            Ok(false) => {
                // Stamp the marker so future reconciles skip it
                if let Some(metadata) = doc
                    .pointer_mut("/metadata")
                    .and_then(Value::as_object_mut)
                {
                    let annotations = metadata
                        .entry("annotations".to_string())
                        .or_insert_with(|| json!({}));
                    if let Some(map) = annotations.as_object_mut() {
                        map.insert(ANNOTATION_CREATED_ONCE.to_string(), Value::from(VALUE_TRUE));
                    }
                }
            }
            Err(e) => {
                warn!(id = %resource.id, error = %e, "failed to check Once policy");
                return ResourceOutcome {
                    failed: true,
                    ..Default::default()
                };
            }
        }
    }

    let apply_result = applier
        .apply_resource(
            &doc,
            owner,
            resource.conflict_policy,
            resource.patch_strategy,
            resource.deletion_policy,
            &filter,
        )
        .await;

    metrics::record_apply_attempt(
        &obj_ref.kind,
        apply_result.is_ok(),
        resource.conflict_policy.as_str(),
    );

    let outcome = match apply_result {
        Ok(outcome) => outcome,
        Err(ApplyError::Conflict {
            name,
            namespace,
            kind,
            message,
        }) => {
            metrics::record_conflict(
                &node.name_any(),
                &node.namespace().unwrap_or_default(),
                &kind,
                resource.conflict_policy.as_str(),
            );
            ctx.events
                .publish(
                    &node_ref,
                    EventType::Warning,
                    reasons::RESOURCE_CONFLICT,
                    actions::RECONCILE,
                    Some(format!(
                        "Resource conflict for {namespace}/{name} (Kind: {kind}, Policy: {}). \
                         Another controller or user may be managing this resource. {message}",
                        resource.conflict_policy.as_str()
                    )),
                )
                .await;
            return ResourceOutcome {
                failed: true,
                conflicted: true,
                ..Default::default()
            };
        }
        Err(e) => {
            warn!(id = %resource.id, object = %obj_ref, error = %e, "failed to apply resource");
            ctx.events
                .publish(
                    &node_ref,
                    EventType::Warning,
                    reasons::APPLY_FAILED,
                    actions::RECONCILE,
                    Some(format!("Failed to apply resource {}: {e}", resource.id)),
                )
                .await;
            return ResourceOutcome {
                failed: true,
                ..Default::default()
            };
        }
    };

    // Readiness gate: dependents on the next level must not start until
    // this resource reports ready
    if resource.wait_for_ready() {
        match checker.wait_for_ready(&obj_ref, resource.timeout()).await {
            Ok(()) => ResourceOutcome {
                ready: true,
                changed: outcome.changed,
                ..Default::default()
            },
            Err(ApplyError::Timeout(message)) => {
                warn!(id = %resource.id, object = %obj_ref, "readiness wait timed out");
                ctx.events
                    .publish(
                        &node_ref,
                        EventType::Warning,
                        reasons::APPLY_FAILED,
                        actions::RECONCILE,
                        Some(message),
                    )
                    .await;
                ResourceOutcome {
                    failed: true,
                    changed: outcome.changed,
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(id = %resource.id, object = %obj_ref, error = %e, "readiness wait failed");
                ResourceOutcome {
                    failed: true,
                    changed: outcome.changed,
                    ..Default::default()
                }
            }
        }
    } else {
        ResourceOutcome {
            ready: true,
            changed: outcome.changed,
            ..Default::default()
        }
    }
}

/// Check whether a Once resource already exists with our marker
async fn check_once_created(ctx: &Context, obj_ref: &ObjectRef) -> Result<bool, ApplyError> {
    match ctx.resources.get(obj_ref).await? {
        None => Ok(false),
        Some(current) => Ok(current
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(ANNOTATION_CREATED_ONCE))
            .and_then(Value::as_str)
            == Some(VALUE_TRUE)),
    }
}

/// Delete (or retain) a resource identified only by its applied key.
///
/// The deletion policy is read back from the live object's annotation
/// because the entry is no longer in the template.
async fn delete_orphaned_resource(node: &LoomNode, ctx: &Context, key: &str) -> Result<(), Error> {
    let Some((kind, namespace, name, id)) = parse_resource_key(key) else {
        return Err(Error::internal_with_context(
            "prune",
            format!("invalid resource key: {key}"),
        ));
    };
    let obj_ref = object_ref_from_key(&kind, &namespace, &name);

    let mut policy = DeletionPolicy::Delete;
    match ctx.resources.get(&obj_ref).await {
        Ok(Some(current)) => {
            if let Some(stored) = current
                .pointer("/metadata/annotations")
                .and_then(|a| a.get(ANNOTATION_DELETION_POLICY))
                .and_then(Value::as_str)
            {
                policy = DeletionPolicy::from_annotation(stored);
            }
        }
        Ok(None) => return Ok(()),
        Err(e) => {
            debug!(key = %key, error = %e, "could not read deletion policy, using default");
        }
    }

    let applier = Applier::new(Arc::clone(&ctx.resources));
    applier
        .delete_resource(&obj_ref, policy, "RemovedFromTemplate")
        .await
        .map_err(|e| Error::internal_with_context("prune", e.to_string()))?;

    let (reason, note) = if policy == DeletionPolicy::Retain {
        (
            reasons::ORPHANED_RESOURCE_RETAINED,
            format!("Retained orphaned resource {kind}/{name} (ID: {id}) - removed from template"),
        )
    } else {
        (
            reasons::ORPHANED_RESOURCE_DELETED,
            format!("Deleted orphaned resource {kind}/{name} (ID: {id}) - removed from template"),
        )
    };
    ctx.events
        .publish(
            &node_object_ref(node),
            EventType::Normal,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;

    Ok(())
}

/// True when the fetched resource is owned by someone else entirely
fn has_ownership_conflict(current: &Value, node: &LoomNode) -> bool {
    let owner_refs = current
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array);

    match owner_refs {
        Some(refs) if !refs.is_empty() => {
            let our_uid = node.uid().unwrap_or_default();
            !refs
                .iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(our_uid.as_str()))
        }
        _ => {
            // No owner: tracking labels decide; absent labels mean the
            // object is simply unmanaged, not conflicted
            let labels = current.pointer("/metadata/labels");
            let tenant = labels
                .and_then(|l| l.get(LABEL_TENANT_NAME))
                .and_then(Value::as_str);
            let tenant_ns = labels
                .and_then(|l| l.get(LABEL_TENANT_NAMESPACE))
                .and_then(Value::as_str);

            match (tenant, tenant_ns) {
                (None, None) => false,
                (tenant, tenant_ns) => {
                    tenant != Some(node.name_any().as_str())
                        || tenant_ns != Some(node.namespace().unwrap_or_default().as_str())
                }
            }
        }
    }
}

/// All calculated status fields for a node
#[derive(Clone, Debug)]
pub struct NodeStatusCalc {
    /// Resource counts
    pub ready: i32,
    /// Failed count
    pub failed: i32,
    /// Conflicted count
    pub conflicted: i32,
    /// Desired count
    pub desired: i32,
    /// Applied keys
    pub applied_resources: Vec<String>,
    /// The four computed conditions
    pub conditions: Vec<Condition>,
    /// Node is fully ready
    pub is_ready: bool,
    /// Node is degraded
    pub is_degraded: bool,
    /// Degraded reason label ("" when healthy)
    pub degraded_reason: String,
}

/// Compute the four conditions from resource counts.
///
/// Reason precedence mirrors the status surface: failures and conflicts
/// together, then conflicts, then failures, then not-all-ready.
pub fn calculate_node_status(
    ready: i32,
    failed: i32,
    conflicted: i32,
    desired: i32,
    applied_resources: Vec<String>,
    is_progressing: bool,
) -> NodeStatusCalc {
    let has_conflict = conflicted > 0;
    let is_fully_ready = failed == 0 && conflicted == 0 && ready == desired;
    let is_degraded = failed > 0 || has_conflict || ready != desired;

    let ready_cond = if is_fully_ready {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Reconciled",
            "Successfully reconciled all resources",
        )
    } else if failed > 0 && has_conflict {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ResourcesFailedAndConflicted",
            format!("{failed} resources failed and {conflicted} resources in conflict"),
        )
    } else if has_conflict {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ResourcesConflicted",
            format!("{conflicted} resources in conflict"),
        )
    } else if failed > 0 {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ResourcesFailed",
            format!("{failed} resources failed"),
        )
    } else {
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "NotAllResourcesReady",
            format!("Not all resources are ready: {ready}/{desired} ready"),
        )
    };

    let progressing_cond = if is_progressing {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "Reconciling",
            "Reconciling changed resources",
        )
    } else {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "ReconcileComplete",
            "Reconciliation completed",
        )
    };

    let conflicted_cond = if has_conflict {
        Condition::new(
            CONDITION_CONFLICTED,
            ConditionStatus::True,
            "ResourceConflict",
            "One or more resources are in conflict. Check events for details.",
        )
    } else {
        Condition::new(
            CONDITION_CONFLICTED,
            ConditionStatus::False,
            "NoConflict",
            "No resource conflicts detected",
        )
    };

    let (degraded_cond, degraded_reason) = if !is_degraded {
        (
            Condition::new(
                CONDITION_DEGRADED,
                ConditionStatus::False,
                "Healthy",
                "All resources are healthy",
            ),
            String::new(),
        )
    } else {
        let (reason, message) = if failed > 0 && has_conflict {
            (
                "ResourceFailuresAndConflicts",
                format!("Node has {failed} failed and {conflicted} conflicted resources"),
            )
        } else if failed > 0 {
            ("ResourceFailures", format!("Node has {failed} failed resources"))
        } else if has_conflict {
            (
                "ResourceConflicts",
                format!("Node has {conflicted} conflicted resources"),
            )
        } else {
            (
                "ResourcesNotReady",
                format!("Not all resources are ready: {ready}/{desired} ready"),
            )
        };
        (
            Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message),
            reason.to_string(),
        )
    };

    NodeStatusCalc {
        ready,
        failed,
        conflicted,
        desired,
        applied_resources,
        conditions: vec![ready_cond, progressing_cond, conflicted_cond, degraded_cond],
        is_ready: is_fully_ready,
        is_degraded,
        degraded_reason,
    }
}

/// Publish a calculated status snapshot through the status manager
async fn publish_status(ctx: &Context, node: &LoomNode, calc: &NodeStatusCalc) {
    ctx.status
        .publish_resource_counts(node, calc.ready, calc.failed, calc.desired, calc.conflicted)
        .await;
    ctx.status
        .publish_applied_resources(node, calc.applied_resources.clone())
        .await;
    for condition in &calc.conditions {
        ctx.status
            .publish_condition(
                node,
                &condition.type_,
                condition.status,
                &condition.reason,
                &condition.message,
            )
            .await;
    }
    ctx.status
        .publish_metrics(
            node,
            MetricsPayload {
                ready: calc.ready,
                failed: calc.failed,
                desired: calc.desired,
                conflicted: calc.conflicted,
                conditions: calc.conditions.clone(),
                is_degraded: calc.is_degraded,
                degraded_reason: calc.degraded_reason.clone(),
            },
        )
        .await;
}

/// Publish the degraded surface for an early validation failure
async fn publish_degraded(ctx: &Context, node: &LoomNode, reason: &str, message: &str) {
    ctx.status
        .publish_ready_condition(node, false, reason, message)
        .await;
    ctx.status
        .publish_degraded_condition(node, true, reason, message)
        .await;
    ctx.status
        .publish_metrics(
            node,
            MetricsPayload {
                conditions: vec![Condition::new(
                    CONDITION_DEGRADED,
                    ConditionStatus::True,
                    reason,
                    message,
                )],
                is_degraded: true,
                degraded_reason: reason.to_string(),
                ..Default::default()
            },
        )
        .await;
}

/// Re-read the node to learn whether it was deleted mid-reconcile
async fn node_is_gone(node: &LoomNode, ctx: &Context) -> bool {
    let api: Api<LoomNode> = Api::namespaced(
        ctx.client.clone(),
        &node.namespace().unwrap_or_default(),
    );
    match api.get_opt(&node.name_any()).await {
        Ok(None) => true,
        Ok(Some(current)) => current.meta().deletion_timestamp.is_some(),
        Err(_) => false,
    }
}
