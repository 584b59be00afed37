//! Kind-dispatched readiness rules
//!
//! A pure classifier over fetched resource documents, plus a polling
//! helper that waits for readiness under a per-resource timeout.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::apply::{ApplyError, ObjectRef, ResourceClient};

/// Poll cadence for readiness waits
const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn i64_at(obj: &Value, pointer: &str) -> Option<i64> {
    obj.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> Option<&'a str> {
    obj.pointer(pointer).and_then(Value::as_str)
}

fn slice_at<'a>(obj: &'a Value, pointer: &str) -> Option<&'a Vec<Value>> {
    obj.pointer(pointer).and_then(Value::as_array)
}

/// Look up a condition's status string in `status.conditions`
fn condition_status<'a>(obj: &'a Value, condition_type: &str) -> Option<&'a str> {
    slice_at(obj, "/status/conditions")?
        .iter()
        .find(|c| str_at(c, "/type") == Some(condition_type))
        .and_then(|c| str_at(c, "/status"))
}

/// Classify a fetched resource document as ready or not.
///
/// Dispatches on the document's kind; unknown kinds fall back to the
/// `Ready=True` condition convention, and a resource with no conditions at
/// all counts as ready.
pub fn is_ready(obj: &Value) -> bool {
    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or("");

    match kind {
        "Namespace" => str_at(obj, "/status/phase") == Some("Active"),
        "ConfigMap" | "Secret" | "ServiceAccount" | "CronJob" => true,
        "Service" => is_service_ready(obj),
        "Deployment" => is_deployment_ready(obj),
        "StatefulSet" => is_stateful_set_ready(obj),
        "DaemonSet" => is_daemon_set_ready(obj),
        "Job" => is_job_ready(obj),
        "Ingress" => is_ingress_ready(obj),
        "PersistentVolumeClaim" => str_at(obj, "/status/phase") == Some("Bound"),
        _ => has_ready_condition(obj),
    }
}

fn is_service_ready(obj: &Value) -> bool {
    if str_at(obj, "/spec/type") == Some("LoadBalancer") {
        return slice_at(obj, "/status/loadBalancer/ingress")
            .map(|ingress| !ingress.is_empty())
            .unwrap_or(false);
    }
    true
}

fn is_deployment_ready(obj: &Value) -> bool {
    let generation = i64_at(obj, "/metadata/generation").unwrap_or(0);
    let observed = i64_at(obj, "/status/observedGeneration").unwrap_or(0);
    if generation != observed {
        return false;
    }

    // Absent replicas means 1
    let replicas = i64_at(obj, "/spec/replicas").filter(|r| *r != 0).unwrap_or(1);
    let available = i64_at(obj, "/status/availableReplicas").unwrap_or(0);
    let updated = i64_at(obj, "/status/updatedReplicas").unwrap_or(0);

    available >= replicas && updated >= replicas
}

fn is_stateful_set_ready(obj: &Value) -> bool {
    let generation = i64_at(obj, "/metadata/generation").unwrap_or(0);
    let observed = i64_at(obj, "/status/observedGeneration").unwrap_or(0);
    if generation != observed {
        return false;
    }

    let replicas = i64_at(obj, "/spec/replicas").filter(|r| *r != 0).unwrap_or(1);
    let ready = i64_at(obj, "/status/readyReplicas").unwrap_or(0);
    let updated = i64_at(obj, "/status/updatedReplicas").unwrap_or(0);

    ready >= replicas && updated >= replicas
}

fn is_daemon_set_ready(obj: &Value) -> bool {
    let desired = i64_at(obj, "/status/desiredNumberScheduled").unwrap_or(0);
    let ready = i64_at(obj, "/status/numberReady").unwrap_or(0);
    desired > 0 && ready >= desired
}

fn is_job_ready(obj: &Value) -> bool {
    match condition_status(obj, "Complete") {
        Some("True") => return true,
        _ => {}
    }
    if condition_status(obj, "Failed") == Some("True") {
        return false;
    }
    i64_at(obj, "/status/succeeded").unwrap_or(0) > 0
}

fn is_ingress_ready(obj: &Value) -> bool {
    let has_lb = slice_at(obj, "/status/loadBalancer/ingress")
        .map(|ingress| !ingress.is_empty())
        .unwrap_or(false);
    if has_lb {
        return true;
    }
    // Some ingress controllers never populate status; rules suffice
    slice_at(obj, "/spec/rules")
        .map(|rules| !rules.is_empty())
        .unwrap_or(false)
}

fn has_ready_condition(obj: &Value) -> bool {
    match slice_at(obj, "/status/conditions") {
        // No conditions at all: assume ready if the resource exists
        None => true,
        Some(_) => condition_status(obj, "Ready") == Some("True"),
    }
}

/// A human-readable progress message for events
pub fn readiness_message(obj: &Value) -> String {
    if is_ready(obj) {
        return "Resource is ready".to_string();
    }

    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or("");
    match kind {
        "Deployment" => {
            let replicas = i64_at(obj, "/spec/replicas").unwrap_or(1);
            let available = i64_at(obj, "/status/availableReplicas").unwrap_or(0);
            format!("Waiting for replicas: {available}/{replicas} available")
        }
        "StatefulSet" => {
            let replicas = i64_at(obj, "/spec/replicas").unwrap_or(1);
            let ready = i64_at(obj, "/status/readyReplicas").unwrap_or(0);
            format!("Waiting for replicas: {ready}/{replicas} ready")
        }
        "Job" => {
            let succeeded = i64_at(obj, "/status/succeeded").unwrap_or(0);
            let failed = i64_at(obj, "/status/failed").unwrap_or(0);
            format!("Job status: {succeeded} succeeded, {failed} failed")
        }
        _ => "Waiting for resource to be ready".to_string(),
    }
}

/// Polls a resource until it is ready or the deadline expires
pub struct Checker {
    client: Arc<dyn ResourceClient>,
}

impl Checker {
    /// Create a checker over the given client
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Fetch the object once and classify it; absent means not ready
    pub async fn check_now(&self, obj_ref: &ObjectRef) -> Result<bool, ApplyError> {
        match self.client.get(obj_ref).await? {
            Some(current) => Ok(is_ready(&current)),
            None => Ok(false),
        }
    }

    /// Poll every 2 seconds until the resource is ready.
    ///
    /// Deadline expiry yields `ApplyError::Timeout`. A NotFound during
    /// polling just keeps waiting - the object may still be materializing.
    pub async fn wait_for_ready(
        &self,
        obj_ref: &ObjectRef,
        timeout: Duration,
    ) -> Result<(), ApplyError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        // The first tick fires immediately; skip it so creation has a
        // poll interval to settle
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if tokio::time::Instant::now() >= deadline {
                return Err(ApplyError::Timeout(format!(
                    "timed out after {}s waiting for {} to be ready",
                    timeout.as_secs(),
                    obj_ref
                )));
            }

            match self.client.get(obj_ref).await {
                Ok(Some(current)) => {
                    if is_ready(&current) {
                        return Ok(());
                    }
                    debug!(object = %obj_ref, message = %readiness_message(&current), "not ready yet");
                }
                Ok(None) => {
                    debug!(object = %obj_ref, "resource not found yet, still waiting");
                }
                Err(e) if e.is_retryable() => {
                    debug!(object = %obj_ref, error = %e, "readiness poll failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::MockResourceClient;
    use serde_json::json;

    #[test]
    fn test_namespace_ready_only_when_active() {
        assert!(is_ready(&json!({
            "kind": "Namespace", "status": {"phase": "Active"}
        })));
        assert!(!is_ready(&json!({
            "kind": "Namespace", "status": {"phase": "Terminating"}
        })));
        assert!(!is_ready(&json!({"kind": "Namespace"})));
    }

    #[test]
    fn test_simple_kinds_ready_at_creation() {
        for kind in ["ConfigMap", "Secret", "ServiceAccount", "CronJob"] {
            assert!(is_ready(&json!({"kind": kind})), "{kind} should be ready");
        }
    }

    #[test]
    fn test_service_load_balancer_needs_ingress() {
        assert!(is_ready(&json!({"kind": "Service", "spec": {"type": "ClusterIP"}})));
        assert!(!is_ready(&json!({
            "kind": "Service",
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {}}
        })));
        assert!(is_ready(&json!({
            "kind": "Service",
            "spec": {"type": "LoadBalancer"},
            "status": {"loadBalancer": {"ingress": [{"ip": "10.0.0.1"}]}}
        })));
    }

    #[test]
    fn test_deployment_readiness() {
        let ready = json!({
            "kind": "Deployment",
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 2,
                "availableReplicas": 3,
                "updatedReplicas": 3
            }
        });
        assert!(is_ready(&ready));

        // Stale observed generation
        let mut stale = ready.clone();
        stale["status"]["observedGeneration"] = json!(1);
        assert!(!is_ready(&stale));

        // Not enough available replicas
        let mut short = ready.clone();
        short["status"]["availableReplicas"] = json!(2);
        assert!(!is_ready(&short));

        // Rolling update not finished
        let mut rolling = ready.clone();
        rolling["status"]["updatedReplicas"] = json!(1);
        assert!(!is_ready(&rolling));
    }

    #[test]
    fn test_deployment_absent_replicas_means_one() {
        let obj = json!({
            "kind": "Deployment",
            "metadata": {"generation": 1},
            "spec": {},
            "status": {
                "observedGeneration": 1,
                "availableReplicas": 1,
                "updatedReplicas": 1
            }
        });
        assert!(is_ready(&obj));
    }

    #[test]
    fn test_stateful_set_readiness() {
        let obj = json!({
            "kind": "StatefulSet",
            "metadata": {"generation": 5},
            "spec": {"replicas": 2},
            "status": {
                "observedGeneration": 5,
                "readyReplicas": 2,
                "updatedReplicas": 2
            }
        });
        assert!(is_ready(&obj));

        let mut not_ready = obj.clone();
        not_ready["status"]["readyReplicas"] = json!(1);
        assert!(!is_ready(&not_ready));
    }

    #[test]
    fn test_daemon_set_needs_scheduled_pods() {
        assert!(is_ready(&json!({
            "kind": "DaemonSet",
            "status": {"desiredNumberScheduled": 3, "numberReady": 3}
        })));
        assert!(!is_ready(&json!({
            "kind": "DaemonSet",
            "status": {"desiredNumberScheduled": 0, "numberReady": 0}
        })));
        assert!(!is_ready(&json!({
            "kind": "DaemonSet",
            "status": {"desiredNumberScheduled": 3, "numberReady": 2}
        })));
    }

    #[test]
    fn test_job_condition_precedence() {
        assert!(is_ready(&json!({
            "kind": "Job",
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        })));
        // Failed=True wins over succeeded count
        assert!(!is_ready(&json!({
            "kind": "Job",
            "status": {
                "conditions": [{"type": "Failed", "status": "True"}],
                "succeeded": 1
            }
        })));
        assert!(is_ready(&json!({
            "kind": "Job",
            "status": {"succeeded": 1}
        })));
        assert!(!is_ready(&json!({"kind": "Job", "status": {}})));
    }

    #[test]
    fn test_ingress_lb_or_rules() {
        assert!(is_ready(&json!({
            "kind": "Ingress",
            "status": {"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}
        })));
        assert!(is_ready(&json!({
            "kind": "Ingress",
            "spec": {"rules": [{"host": "a.example.com"}]}
        })));
        assert!(!is_ready(&json!({"kind": "Ingress", "spec": {"rules": []}})));
    }

    #[test]
    fn test_pvc_bound() {
        assert!(is_ready(&json!({
            "kind": "PersistentVolumeClaim",
            "status": {"phase": "Bound"}
        })));
        assert!(!is_ready(&json!({
            "kind": "PersistentVolumeClaim",
            "status": {"phase": "Pending"}
        })));
    }

    #[test]
    fn test_custom_resource_ready_condition() {
        assert!(is_ready(&json!({
            "kind": "Certificate",
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        })));
        assert!(!is_ready(&json!({
            "kind": "Certificate",
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        })));
        // Absent conditions: assume ready
        assert!(is_ready(&json!({"kind": "Certificate", "status": {}})));
        assert!(is_ready(&json!({"kind": "Certificate"})));
    }

    #[test]
    fn test_readiness_messages() {
        let deploy = json!({
            "kind": "Deployment",
            "metadata": {"generation": 1},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 1, "availableReplicas": 1, "updatedReplicas": 1}
        });
        assert_eq!(
            readiness_message(&deploy),
            "Waiting for replicas: 1/3 available"
        );

        let ready = json!({"kind": "ConfigMap"});
        assert_eq!(readiness_message(&ready), "Resource is ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_times_out() {
        let mut client = MockResourceClient::new();
        client.expect_get().returning(|_| {
            Ok(Some(json!({
                "kind": "Deployment",
                "metadata": {"generation": 1},
                "spec": {"replicas": 1},
                "status": {"observedGeneration": 0}
            })))
        });

        let checker = Checker::new(Arc::new(client));
        let obj_ref = ObjectRef::from_parts("apps/v1", "Deployment", "web", Some("t"));
        let err = checker
            .wait_for_ready(&obj_ref, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_succeeds_when_resource_settles() {
        let mut client = MockResourceClient::new();
        let mut polls = 0;
        client.expect_get().returning(move |_| {
            polls += 1;
            if polls < 3 {
                Ok(None)
            } else {
                Ok(Some(json!({"kind": "ConfigMap"})))
            }
        });

        let checker = Checker::new(Arc::new(client));
        let obj_ref = ObjectRef::from_parts("v1", "ConfigMap", "cfg", Some("t"));
        checker
            .wait_for_ready(&obj_ref, Duration::from_secs(60))
            .await
            .unwrap();
    }
}
