//! Status event and aggregation types
//!
//! Events are a sum over the kinds of status change a reconcile can
//! produce. The aggregator folds them into one pending update per tenant;
//! later events for the same tenant overwrite earlier ones field by field.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use loom_common::crd::{Condition, LoomNode};

/// Namespaced identity of a tenant node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    /// Node name
    pub name: String,
    /// Node namespace
    pub namespace: String,
}

impl NodeKey {
    /// Build a key from a node object
    pub fn from_node(node: &LoomNode) -> Self {
        Self {
            name: node.name_any(),
            namespace: node.namespace().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metrics snapshot attached to a reconcile's final event
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsPayload {
    /// Ready resource count
    pub ready: i32,
    /// Failed resource count
    pub failed: i32,
    /// Desired resource count
    pub desired: i32,
    /// Conflicted resource count
    pub conflicted: i32,
    /// Conditions to mirror into gauges
    pub conditions: Vec<Condition>,
    /// Whether the node is degraded
    pub is_degraded: bool,
    /// The degraded reason label, "" when healthy
    pub degraded_reason: String,
}

/// The kinds of status change a reconcile can publish
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// Resource counts changed
    ResourceCountsUpdated {
        /// Ready count
        ready: i32,
        /// Failed count
        failed: i32,
        /// Desired count
        desired: i32,
        /// Conflicted count
        conflicted: i32,
    },
    /// A condition changed
    ConditionChanged(Condition),
    /// The applied-keys list changed (full replacement)
    AppliedResourcesUpdated(Vec<String>),
    /// The observed generation advanced
    ObservedGenerationUpdated(i64),
    /// Metrics snapshot; applied out-of-band, no cluster write
    MetricsUpdate(MetricsPayload),
}

/// A status change event for one tenant
#[derive(Clone, Debug)]
pub struct StatusEvent {
    /// Which tenant the event concerns
    pub key: NodeKey,
    /// What changed
    pub payload: EventPayload,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Create an event stamped now
    pub fn new(key: NodeKey, payload: EventPayload) -> Self {
        Self {
            key,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Accumulated status changes for a single tenant.
///
/// `None` fields carry no update. Conditions are keyed by type so a later
/// event for the same type wins.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    /// Generation to record, if any
    pub observed_generation: Option<i64>,
    /// Ready count, if updated
    pub ready: Option<i32>,
    /// Failed count, if updated
    pub failed: Option<i32>,
    /// Desired count, if updated
    pub desired: Option<i32>,
    /// Conflicted count, if updated
    pub conflicted: Option<i32>,
    /// Applied keys, if updated (full replacement)
    pub applied_resources: Option<Vec<String>>,
    /// Conditions keyed by type
    pub conditions: BTreeMap<String, Condition>,
    /// Metrics snapshot, if updated
    pub metrics: Option<MetricsPayload>,
    /// Timestamp of the latest folded event
    pub last_event_time: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Fold one event into this update; last writer wins per field
    pub fn apply_event(&mut self, event: StatusEvent) {
        self.last_event_time = Some(event.timestamp);

        match event.payload {
            EventPayload::ResourceCountsUpdated {
                ready,
                failed,
                desired,
                conflicted,
            } => {
                self.ready = Some(ready);
                self.failed = Some(failed);
                self.desired = Some(desired);
                self.conflicted = Some(conflicted);
            }
            EventPayload::ConditionChanged(condition) => {
                self.conditions.insert(condition.type_.clone(), condition);
            }
            EventPayload::AppliedResourcesUpdated(keys) => {
                self.applied_resources = Some(keys);
            }
            EventPayload::ObservedGenerationUpdated(generation) => {
                self.observed_generation = Some(generation);
            }
            EventPayload::MetricsUpdate(payload) => {
                self.metrics = Some(payload);
            }
        }
    }

    /// True when this update carries anything to write or record
    pub fn has_changes(&self) -> bool {
        self.observed_generation.is_some()
            || self.ready.is_some()
            || self.failed.is_some()
            || self.desired.is_some()
            || self.conflicted.is_some()
            || self.applied_resources.is_some()
            || !self.conditions.is_empty()
            || self.metrics.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_common::crd::{ConditionStatus, CONDITION_READY};

    fn key() -> NodeKey {
        NodeKey {
            name: "tenant-a".to_string(),
            namespace: "tenants".to_string(),
        }
    }

    #[test]
    fn test_counts_last_writer_wins() {
        let mut update = StatusUpdate::default();
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::ResourceCountsUpdated {
                ready: 1,
                failed: 2,
                desired: 5,
                conflicted: 0,
            },
        ));
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::ResourceCountsUpdated {
                ready: 5,
                failed: 0,
                desired: 5,
                conflicted: 0,
            },
        ));

        assert_eq!(update.ready, Some(5));
        assert_eq!(update.failed, Some(0));
        assert!(update.has_changes());
    }

    #[test]
    fn test_conditions_keyed_by_type() {
        let mut update = StatusUpdate::default();
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::ConditionChanged(Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "ResourcesFailed",
                "1 failed",
            )),
        ));
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::ConditionChanged(Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "Reconciled",
                "ok",
            )),
        ));
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::ConditionChanged(Condition::new(
                "Progressing",
                ConditionStatus::False,
                "ReconcileComplete",
                "done",
            )),
        ));

        assert_eq!(update.conditions.len(), 2);
        assert_eq!(update.conditions[CONDITION_READY].reason, "Reconciled");
    }

    #[test]
    fn test_applied_resources_full_replacement() {
        let mut update = StatusUpdate::default();
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::AppliedResourcesUpdated(vec!["a".into(), "b".into()]),
        ));
        update.apply_event(StatusEvent::new(
            key(),
            EventPayload::AppliedResourcesUpdated(vec!["c".into()]),
        ));

        assert_eq!(update.applied_resources, Some(vec!["c".to_string()]));
    }

    #[test]
    fn test_empty_update_has_no_changes() {
        assert!(!StatusUpdate::default().has_changes());
    }

    #[test]
    fn test_last_event_time_tracks_latest() {
        let mut update = StatusUpdate::default();
        let event = StatusEvent::new(key(), EventPayload::ObservedGenerationUpdated(3));
        let stamp = event.timestamp;
        update.apply_event(event);
        assert_eq!(update.last_event_time, Some(stamp));
        assert_eq!(update.observed_generation, Some(3));
    }
}
