//! The apply engine
//!
//! Converges one rendered document toward the cluster, honoring the
//! per-resource patch strategy, conflict policy, and deletion policy, and
//! recording ownership so pruning can find the resource later.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use loom_common::crd::{ConflictPolicy, DeletionPolicy, PatchStrategy};
use loom_common::{
    ANNOTATION_DELETION_POLICY, ANNOTATION_IGNORED_FIELDS, ANNOTATION_ORPHANED_AT,
    ANNOTATION_ORPHANED_REASON, LABEL_ORPHANED, LABEL_TENANT_NAME, LABEL_TENANT_NAMESPACE,
    ORPHANED_LABEL_VALUE,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    annotations_mut, is_cluster_scoped, is_subset, labels_mut, remove_annotation, remove_label,
    ApplyError, ObjectRef, ResourceClient,
};
use crate::fieldpath::FieldFilter;

/// The tenant node that owns a managed resource
#[derive(Clone, Debug)]
pub struct NodeOwner {
    /// Node name
    pub name: String,
    /// Node namespace
    pub namespace: String,
    /// Node UID, recorded in owner references
    pub uid: String,
}

/// Result of one apply call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The server state changed (created, or resourceVersion bumped)
    pub changed: bool,
    /// Orphan markers were removed from a previously retained object
    pub readopted: bool,
}

/// Applies rendered documents through a [`ResourceClient`]
pub struct Applier {
    client: Arc<dyn ResourceClient>,
}

impl Applier {
    /// Create an applier over the given client
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Apply one rendered document.
    ///
    /// Sets ownership channels, persists the ignore list, removes orphan
    /// markers from a previously retained object, masks ignored fields out
    /// of both sides, then patches per the strategy. Returns whether the
    /// cluster state changed.
    pub async fn apply_resource(
        &self,
        doc: &Value,
        owner: &NodeOwner,
        conflict_policy: ConflictPolicy,
        patch_strategy: PatchStrategy,
        deletion_policy: DeletionPolicy,
        filter: &FieldFilter,
    ) -> Result<ApplyOutcome, ApplyError> {
        let obj_ref = ObjectRef::from_doc(doc)?;

        let mut desired = doc.clone();
        set_ownership(&mut desired, owner, &obj_ref, deletion_policy);
        stamp_policies(&mut desired, deletion_policy, filter);

        let current = self.client.get(&obj_ref).await?;
        let before_version = current.as_ref().and_then(resource_version);

        let mut readopted = false;
        if let Some(ref current) = current {
            // Re-adoption: a retained object coming back under management
            // loses its orphan markers. Best-effort; failures must not
            // block the apply.
            match self.remove_orphan_markers(current).await {
                Ok(removed) => readopted = removed,
                Err(e) => {
                    debug!(object = %obj_ref, error = %e, "failed to remove orphan markers, continuing");
                }
            }
        }

        // Mask ignored fields out of the desired document before the merge
        filter.apply(&mut desired);

        if let Some(ref current) = current {
            if !filter.is_empty() {
                let mut current_masked = current.clone();
                filter.apply(&mut current_masked);
                if is_subset(&desired, &current_masked) {
                    debug!(object = %obj_ref, "no diff after ignore-filter, skipping write");
                    return Ok(ApplyOutcome {
                        changed: false,
                        readopted,
                    });
                }
            }
        }

        match patch_strategy {
            PatchStrategy::Apply => {
                match self.client.ssa_apply(&desired, false).await {
                    Ok(_) => {}
                    Err(ApplyError::Conflict { .. }) if conflict_policy == ConflictPolicy::Force => {
                        // Force retries exactly once with ownership taken
                        self.client.ssa_apply(&desired, true).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            PatchStrategy::Merge => {
                self.client.merge_patch(&desired).await?;
            }
            PatchStrategy::Replace => {
                match current {
                    None => {
                        self.client.create(&desired).await?;
                        return Ok(ApplyOutcome {
                            changed: true,
                            readopted,
                        });
                    }
                    Some(ref current) => {
                        if let Some(rv) = resource_version(current) {
                            set_resource_version(&mut desired, &rv);
                        }
                        self.client.replace(&desired).await?;
                    }
                }
            }
        }

        if before_version.is_none() {
            // Newly created
            return Ok(ApplyOutcome {
                changed: true,
                readopted,
            });
        }

        // Compare resourceVersion before and after to derive `changed`;
        // a failed re-read counts as changed
        let after_version = self
            .client
            .get(&obj_ref)
            .await
            .ok()
            .flatten()
            .and_then(|after| resource_version(&after));

        let changed = match (before_version, after_version) {
            (Some(before), Some(after)) => before != after,
            _ => true,
        };

        Ok(ApplyOutcome { changed, readopted })
    }

    /// Delete or retain a resource per its deletion policy.
    ///
    /// Delete treats 404 as success. Retain strips owner references and
    /// tracking labels, then stamps the orphan markers so the object stays
    /// discoverable.
    pub async fn delete_resource(
        &self,
        obj_ref: &ObjectRef,
        policy: DeletionPolicy,
        orphan_reason: &str,
    ) -> Result<(), ApplyError> {
        match policy {
            DeletionPolicy::Delete => match self.client.delete(obj_ref).await {
                Ok(()) => Ok(()),
                Err(ApplyError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
            DeletionPolicy::Retain => {
                let Some(current) = self.client.get(obj_ref).await? else {
                    return Ok(());
                };

                let mut orphaned = current.clone();
                if let Some(metadata) = orphaned.get_mut("metadata").and_then(Value::as_object_mut)
                {
                    metadata.remove("ownerReferences");
                }
                remove_label(&mut orphaned, LABEL_TENANT_NAME);
                remove_label(&mut orphaned, LABEL_TENANT_NAMESPACE);
                labels_mut(&mut orphaned).insert(
                    LABEL_ORPHANED.to_string(),
                    Value::from(ORPHANED_LABEL_VALUE),
                );

                let annotations = annotations_mut(&mut orphaned);
                annotations.insert(
                    ANNOTATION_ORPHANED_AT.to_string(),
                    Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                if !orphan_reason.is_empty() {
                    annotations.insert(
                        ANNOTATION_ORPHANED_REASON.to_string(),
                        Value::from(orphan_reason),
                    );
                }

                self.client.replace(&orphaned).await?;
                info!(
                    object = %obj_ref,
                    reason = orphan_reason,
                    "orphan markers added - resource retained"
                );
                Ok(())
            }
        }
    }

    /// Strip orphan markers from a cluster object if present.
    ///
    /// Returns true when markers were removed and the object updated.
    async fn remove_orphan_markers(&self, current: &Value) -> Result<bool, ApplyError> {
        let has_label = current
            .pointer("/metadata/labels")
            .and_then(|l| l.get(LABEL_ORPHANED))
            .and_then(Value::as_str)
            == Some(ORPHANED_LABEL_VALUE);
        let has_annotations = current
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .map(|a| {
                a.contains_key(ANNOTATION_ORPHANED_AT) || a.contains_key(ANNOTATION_ORPHANED_REASON)
            })
            .unwrap_or(false);

        if !has_label && !has_annotations {
            return Ok(false);
        }

        let mut cleaned = current.clone();
        let mut changed = remove_label(&mut cleaned, LABEL_ORPHANED);
        changed |= remove_annotation(&mut cleaned, ANNOTATION_ORPHANED_AT);
        changed |= remove_annotation(&mut cleaned, ANNOTATION_ORPHANED_REASON);

        if changed {
            self.client.replace(&cleaned).await?;
            let obj_ref = ObjectRef::from_doc(&cleaned)?;
            info!(object = %obj_ref, "orphan markers removed - resource re-adopted");
        }
        Ok(changed)
    }
}

/// Record ownership on the desired document.
///
/// Tracking labels are always set - pruning depends on them. A controller
/// owner reference is added only when it is safe: same namespace as the
/// owner, a namespaced kind, and a Delete policy (Retain resources must
/// not be garbage-collected with their owner).
fn set_ownership(
    doc: &mut Value,
    owner: &NodeOwner,
    obj_ref: &ObjectRef,
    deletion_policy: DeletionPolicy,
) {
    let labels = labels_mut(doc);
    labels.insert(LABEL_TENANT_NAME.to_string(), Value::from(owner.name.clone()));
    labels.insert(
        LABEL_TENANT_NAMESPACE.to_string(),
        Value::from(owner.namespace.clone()),
    );

    let same_namespace = obj_ref.namespace.as_deref() == Some(owner.namespace.as_str());
    let owner_ref_feasible = same_namespace
        && !is_cluster_scoped(&obj_ref.kind)
        && deletion_policy != DeletionPolicy::Retain;

    if owner_ref_feasible {
        let metadata = super::ensure_object(doc, "metadata");
        metadata.insert(
            "ownerReferences".to_string(),
            json!([{
                "apiVersion": format!("{}/v1alpha1", loom_common::API_GROUP),
                "kind": "LoomNode",
                "name": owner.name,
                "uid": owner.uid,
                "controller": true,
                "blockOwnerDeletion": true,
            }]),
        );
    }
}

/// Persist the deletion policy and ignore list on the object so pruning
/// and restarts see stable values.
fn stamp_policies(doc: &mut Value, deletion_policy: DeletionPolicy, filter: &FieldFilter) {
    let annotations = annotations_mut(doc);
    annotations.insert(
        ANNOTATION_DELETION_POLICY.to_string(),
        Value::from(deletion_policy.as_str()),
    );
    if !filter.is_empty() {
        let paths = serde_json::to_string(&filter.raw_paths()).unwrap_or_else(|_| "[]".into());
        annotations.insert(ANNOTATION_IGNORED_FIELDS.to_string(), Value::from(paths));
    }
}

fn resource_version(doc: &Value) -> Option<String> {
    doc.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(String::from)
}

fn set_resource_version(doc: &mut Value, rv: &str) {
    let metadata = super::ensure_object(doc, "metadata");
    metadata.insert("resourceVersion".to_string(), Value::from(rv));
}
