//! Metrics catalogue for Loom observability
//!
//! Provides OpenTelemetry metrics for:
//! - Node reconciliation (duration, resource counts, conditions)
//! - Hub synchronization (desired/ready/failed node counts)
//! - Resource apply attempts and conflicts
//! - Degraded-state tracking per node
//!
//! All instruments are updated by the status manager; concurrency safety is
//! the metrics library's contract.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

/// Global meter for Loom metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("loom"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of node reconciliation duration
///
/// Labels:
/// - `result`: success, error, partial_failure, status_only
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("loom_reconcile_duration_seconds")
        .with_description("Duration of LoomNode reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Gauge of ready resources per node
///
/// Labels:
/// - `node`: node name
/// - `namespace`: node namespace
pub static NODE_RESOURCES_READY: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_resources_ready")
        .with_description("Number of ready resources for a LoomNode")
        .with_unit("{resources}")
        .build()
});

/// Gauge of desired resources per node
pub static NODE_RESOURCES_DESIRED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_resources_desired")
        .with_description("Total number of desired resources for a LoomNode")
        .with_unit("{resources}")
        .build()
});

/// Gauge of failed resources per node
pub static NODE_RESOURCES_FAILED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_resources_failed")
        .with_description("Number of failed resources for a LoomNode")
        .with_unit("{resources}")
        .build()
});

/// Gauge of conflicted resources per node
pub static NODE_RESOURCES_CONFLICTED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_resources_conflicted")
        .with_description("Number of resources currently in conflict state for a LoomNode")
        .with_unit("{resources}")
        .build()
});

// ============================================================================
// Hub Metrics
// ============================================================================

/// Gauge of desired nodes per hub (rows x forms from the data source)
///
/// Labels:
/// - `hub`: hub name
/// - `namespace`: hub namespace
pub static HUB_DESIRED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_hub_desired")
        .with_description("Number of desired LoomNodes from the hub data source")
        .with_unit("{nodes}")
        .build()
});

/// Gauge of ready nodes per hub
pub static HUB_READY: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_hub_ready")
        .with_description("Number of ready LoomNodes for a hub")
        .with_unit("{nodes}")
        .build()
});

/// Gauge of failed nodes per hub
pub static HUB_FAILED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_hub_failed")
        .with_description("Number of failed LoomNodes for a hub")
        .with_unit("{nodes}")
        .build()
});

// ============================================================================
// Apply Metrics
// ============================================================================

/// Counter of resource apply attempts
///
/// Labels:
/// - `kind`: resource kind
/// - `result`: success, error
/// - `conflict_policy`: Force, Stuck
pub static APPLY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("loom_apply_attempts_total")
        .with_description("Total number of resource apply attempts")
        .with_unit("{attempts}")
        .build()
});

/// Counter of field-manager conflicts
///
/// Labels:
/// - `node`, `namespace`, `kind`, `conflict_policy`
pub static CONFLICTS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("loom_conflicts_total")
        .with_description("Total number of resource conflicts encountered during reconciliation")
        .with_unit("{conflicts}")
        .build()
});

// ============================================================================
// Condition Metrics
// ============================================================================

/// Gauge of node condition status (0=False, 1=True, 2=Unknown)
///
/// Labels:
/// - `node`, `namespace`, `type`
pub static NODE_CONDITION_STATUS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_condition_status")
        .with_description("Status of LoomNode conditions (0=False, 1=True, 2=Unknown)")
        .build()
});

/// Gauge of node degraded state (1=degraded, 0=healthy)
///
/// Labels:
/// - `node`, `namespace`, `reason`
pub static NODE_DEGRADED_STATUS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("loom_node_degraded_status")
        .with_description("Indicates if a LoomNode is in degraded state (1=degraded, 0=healthy)")
        .build()
});

// ============================================================================
// Label Helpers
// ============================================================================

/// Result label for the reconcile duration histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// All resources reconciled
    Success,
    /// The reconcile itself failed
    Error,
    /// Some resources failed or conflicted
    PartialFailure,
    /// Status-only fast path
    StatusOnly,
}

impl ReconcileResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::PartialFailure => "partial_failure",
            Self::StatusOnly => "status_only",
        }
    }
}

/// Every degraded reason the node controller can emit.
///
/// Zeroing all of them on recovery prevents stale degraded series from
/// lingering after a node becomes healthy again.
pub const DEGRADED_REASONS: &[&str] = &[
    "ResourceFailures",
    "ResourceConflicts",
    "ResourceFailuresAndConflicts",
    "ResourcesNotReady",
    "TemplateRenderError",
    "DependencyCycle",
    "VariablesBuildError",
];

// ============================================================================
// Recording Helpers
// ============================================================================

/// Record a reconcile duration observation
pub fn record_reconcile_duration(result: ReconcileResult, seconds: f64) {
    RECONCILE_DURATION.record(
        seconds,
        &[KeyValue::new("result", result.as_str().to_string())],
    );
}

/// Update per-node resource count gauges
pub fn set_node_resource_counts(
    node: &str,
    namespace: &str,
    ready: i64,
    desired: i64,
    failed: i64,
    conflicted: i64,
) {
    let attrs = [
        KeyValue::new("node", node.to_string()),
        KeyValue::new("namespace", namespace.to_string()),
    ];
    NODE_RESOURCES_READY.record(ready, &attrs);
    NODE_RESOURCES_DESIRED.record(desired, &attrs);
    NODE_RESOURCES_FAILED.record(failed, &attrs);
    NODE_RESOURCES_CONFLICTED.record(conflicted, &attrs);
}

/// Update per-hub node count gauges
pub fn set_hub_counts(hub: &str, namespace: &str, desired: i64, ready: i64, failed: i64) {
    let attrs = [
        KeyValue::new("hub", hub.to_string()),
        KeyValue::new("namespace", namespace.to_string()),
    ];
    HUB_DESIRED.record(desired, &attrs);
    HUB_READY.record(ready, &attrs);
    HUB_FAILED.record(failed, &attrs);
}

/// Count one apply attempt
pub fn record_apply_attempt(kind: &str, success: bool, conflict_policy: &str) {
    APPLY_ATTEMPTS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", if success { "success" } else { "error" }),
            KeyValue::new("conflict_policy", conflict_policy.to_string()),
        ],
    );
}

/// Count one field-manager conflict
pub fn record_conflict(node: &str, namespace: &str, kind: &str, conflict_policy: &str) {
    CONFLICTS_TOTAL.add(
        1,
        &[
            KeyValue::new("node", node.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("conflict_policy", conflict_policy.to_string()),
        ],
    );
}

/// Update a node condition gauge (0=False, 1=True, 2=Unknown)
pub fn set_condition_status(node: &str, namespace: &str, condition_type: &str, value: i64) {
    NODE_CONDITION_STATUS.record(
        value,
        &[
            KeyValue::new("node", node.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("type", condition_type.to_string()),
        ],
    );
}

/// Update the degraded gauge for a node.
///
/// When degraded, sets the given reason series to 1. On recovery, zeroes
/// every reason in [`DEGRADED_REASONS`] so no stale series survives.
pub fn set_degraded_status(node: &str, namespace: &str, degraded: bool, reason: &str) {
    if degraded {
        NODE_DEGRADED_STATUS.record(
            1,
            &[
                KeyValue::new("node", node.to_string()),
                KeyValue::new("namespace", namespace.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    } else {
        for known in DEGRADED_REASONS {
            NODE_DEGRADED_STATUS.record(
                0,
                &[
                    KeyValue::new("node", node.to_string()),
                    KeyValue::new("namespace", namespace.to_string()),
                    KeyValue::new("reason", known.to_string()),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_result_as_str() {
        assert_eq!(ReconcileResult::Success.as_str(), "success");
        assert_eq!(ReconcileResult::Error.as_str(), "error");
        assert_eq!(ReconcileResult::PartialFailure.as_str(), "partial_failure");
        assert_eq!(ReconcileResult::StatusOnly.as_str(), "status_only");
    }

    #[test]
    fn test_degraded_reasons_cover_controller_emissions() {
        // The zeroing list must contain every reason the node controller
        // can set, otherwise recovery leaves a stale series behind.
        for reason in [
            "ResourceFailures",
            "ResourceConflicts",
            "ResourcesNotReady",
            "TemplateRenderError",
            "DependencyCycle",
            "VariablesBuildError",
        ] {
            assert!(DEGRADED_REASONS.contains(&reason), "missing {reason}");
        }
    }

    #[test]
    fn test_recording_helpers_do_not_panic() {
        record_reconcile_duration(ReconcileResult::Success, 0.42);
        set_node_resource_counts("tenant-a", "default", 3, 3, 0, 0);
        set_hub_counts("main-hub", "default", 10, 9, 1);
        record_apply_attempt("Deployment", true, "Stuck");
        record_conflict("tenant-a", "default", "ConfigMap", "Stuck");
        set_condition_status("tenant-a", "default", "Ready", 1);
        set_degraded_status("tenant-a", "default", false, "");
        set_degraded_status("tenant-a", "default", true, "ResourceFailures");
    }
}
