//! The status manager worker and its client seam

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Client;
use loom_common::crd::{
    Condition, ConditionStatus, LoomNode, LoomNodeStatus, CONDITION_CONFLICTED,
    CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
};
use loom_common::retry::RetryConfig;
use loom_common::{metrics, Error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use super::types::{EventPayload, MetricsPayload, NodeKey, StatusEvent, StatusUpdate};

/// Default number of pending tenants before a flush
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default periodic flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound of the event channel
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Client seam for reading and writing node status.
///
/// Mocked in tests; the production impl goes through the status
/// subresource so spec writes never race with status writes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeStatusClient: Send + Sync {
    /// Fetch the latest node, None when it no longer exists
    async fn get_node(&self, key: &NodeKey) -> Result<Option<LoomNode>, Error>;

    /// Write the node's status subresource
    async fn update_status(&self, node: &LoomNode) -> Result<(), Error>;
}

/// Production status client over a kube [`Client`]
pub struct KubeNodeStatusClient {
    client: Client,
}

impl KubeNodeStatusClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<LoomNode> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl NodeStatusClient for KubeNodeStatusClient {
    async fn get_node(&self, key: &NodeKey) -> Result<Option<LoomNode>, Error> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn update_status(&self, node: &LoomNode) -> Result<(), Error> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("status-manager", "node has no name"))?;
        let namespace = node.metadata.namespace.as_deref().unwrap_or_default();
        let data = serde_json::to_vec(node)
            .map_err(|e| Error::serialization(format!("cannot serialize node status: {e}")))?;

        self.api(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Tuning for the status manager
#[derive(Clone, Debug)]
pub struct StatusManagerOptions {
    /// Flush when this many tenants have pending updates
    pub batch_size: usize,
    /// Periodic flush interval
    pub flush_interval: Duration,
    /// Bound of the event channel; overflow drops events
    pub event_buffer: usize,
    /// Testing-only: apply each event inline under a mutex
    pub sync_mode: bool,
}

impl Default for StatusManagerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            sync_mode: false,
        }
    }
}

enum Mode {
    Async { tx: mpsc::Sender<StatusEvent> },
    Sync { lock: tokio::sync::Mutex<()> },
}

/// Per-process singleton aggregating status events and flushing them in
/// batches with retry-on-conflict.
pub struct StatusManager {
    client: Arc<dyn NodeStatusClient>,
    mode: Mode,
    shutdown: CancellationToken,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StatusManager {
    /// Create a manager and start its background worker (unless sync mode)
    pub fn new(client: Arc<dyn NodeStatusClient>, options: StatusManagerOptions) -> Arc<Self> {
        let shutdown = CancellationToken::new();

        if options.sync_mode {
            return Arc::new(Self {
                client,
                mode: Mode::Sync {
                    lock: tokio::sync::Mutex::new(()),
                },
                shutdown,
                worker: std::sync::Mutex::new(None),
            });
        }

        let (tx, rx) = mpsc::channel(options.event_buffer.max(1));
        let worker_client = Arc::clone(&client);
        let worker_token = shutdown.clone();
        let batch_size = options.batch_size.max(1);
        let flush_interval = options.flush_interval;

        let handle = tokio::spawn(async move {
            run_worker(worker_client, rx, worker_token, batch_size, flush_interval).await;
        });

        info!(
            batch_size,
            flush_interval_ms = flush_interval.as_millis(),
            "status manager started"
        );

        Arc::new(Self {
            client,
            mode: Mode::Async { tx },
            shutdown,
            worker: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Publish a status event.
    ///
    /// Non-blocking in async mode: when the channel is full the event is
    /// dropped with a debug log - the next reconcile republishes the full
    /// snapshot, so no single event is load-bearing.
    pub async fn publish(&self, event: StatusEvent) {
        match &self.mode {
            Mode::Async { tx } => {
                if let Err(e) = tx.try_send(event) {
                    if let mpsc::error::TrySendError::Full(dropped) = e {
                        debug!(
                            tenant = %dropped.key,
                            "dropping status event, buffer full"
                        );
                    }
                }
            }
            Mode::Sync { lock } => {
                let _guard = lock.lock().await;
                let key = event.key.clone();
                let mut update = StatusUpdate::default();
                update.apply_event(event);
                flush_one(self.client.as_ref(), &key, &update).await;
            }
        }
    }

    /// Flush remaining work and stop the worker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ------------------------------------------------------------------
    // Publish helpers used by the controllers
    // ------------------------------------------------------------------

    /// Publish updated resource counts
    pub async fn publish_resource_counts(
        &self,
        node: &LoomNode,
        ready: i32,
        failed: i32,
        desired: i32,
        conflicted: i32,
    ) {
        self.publish(StatusEvent::new(
            NodeKey::from_node(node),
            EventPayload::ResourceCountsUpdated {
                ready,
                failed,
                desired,
                conflicted,
            },
        ))
        .await;
    }

    /// Publish an arbitrary condition
    pub async fn publish_condition(
        &self,
        node: &LoomNode,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        self.publish(StatusEvent::new(
            NodeKey::from_node(node),
            EventPayload::ConditionChanged(Condition::new(type_, status, reason, message)),
        ))
        .await;
    }

    /// Publish the Ready condition
    pub async fn publish_ready_condition(
        &self,
        node: &LoomNode,
        is_ready: bool,
        reason: &str,
        message: &str,
    ) {
        self.publish_condition(
            node,
            CONDITION_READY,
            ConditionStatus::from_bool(is_ready),
            reason,
            message,
        )
        .await;
    }

    /// Publish the Progressing condition with defaulted reason/message
    pub async fn publish_progressing_condition(
        &self,
        node: &LoomNode,
        is_progressing: bool,
        reason: &str,
        message: &str,
    ) {
        let reason = if reason.is_empty() {
            "ReconcileComplete"
        } else {
            reason
        };
        let message = if message.is_empty() {
            "Reconciliation completed"
        } else {
            message
        };
        self.publish_condition(
            node,
            CONDITION_PROGRESSING,
            ConditionStatus::from_bool(is_progressing),
            reason,
            message,
        )
        .await;
    }

    /// Publish the Conflicted condition
    pub async fn publish_conflicted_condition(&self, node: &LoomNode, has_conflict: bool) {
        let (status, reason, message) = if has_conflict {
            (
                ConditionStatus::True,
                "ResourceConflict",
                "One or more resources are in conflict. Check events for details.",
            )
        } else {
            (
                ConditionStatus::False,
                "NoConflict",
                "No resource conflicts detected",
            )
        };
        self.publish_condition(node, CONDITION_CONFLICTED, status, reason, message)
            .await;
    }

    /// Publish the Degraded condition
    pub async fn publish_degraded_condition(
        &self,
        node: &LoomNode,
        is_degraded: bool,
        reason: &str,
        message: &str,
    ) {
        self.publish_condition(
            node,
            CONDITION_DEGRADED,
            ConditionStatus::from_bool(is_degraded),
            reason,
            message,
        )
        .await;
    }

    /// Publish an observed-generation update
    pub async fn publish_observed_generation(&self, node: &LoomNode, generation: i64) {
        self.publish(StatusEvent::new(
            NodeKey::from_node(node),
            EventPayload::ObservedGenerationUpdated(generation),
        ))
        .await;
    }

    /// Publish the applied-keys list (full replacement)
    pub async fn publish_applied_resources(&self, node: &LoomNode, keys: Vec<String>) {
        self.publish(StatusEvent::new(
            NodeKey::from_node(node),
            EventPayload::AppliedResourcesUpdated(keys),
        ))
        .await;
    }

    /// Publish a metrics snapshot
    pub async fn publish_metrics(&self, node: &LoomNode, payload: MetricsPayload) {
        self.publish(StatusEvent::new(
            NodeKey::from_node(node),
            EventPayload::MetricsUpdate(payload),
        ))
        .await;
    }
}

/// The worker loop: owns the pending map exclusively
async fn run_worker(
    client: Arc<dyn NodeStatusClient>,
    mut rx: mpsc::Receiver<StatusEvent>,
    shutdown: CancellationToken,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut pending: HashMap<NodeKey, StatusUpdate> = HashMap::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if !pending.is_empty() {
                    info!(size = pending.len(), "flushing final batch before shutdown");
                    flush_pending(client.as_ref(), &mut pending).await;
                }
                info!("status manager stopped");
                return;
            }

            _ = ticker.tick() => {
                if !pending.is_empty() {
                    debug!(size = pending.len(), "flushing batch on timer");
                    flush_pending(client.as_ref(), &mut pending).await;
                }
            }

            event = rx.recv() => {
                match event {
                    Some(event) => {
                        pending
                            .entry(event.key.clone())
                            .or_default()
                            .apply_event(event);

                        if pending.len() >= batch_size {
                            debug!(size = pending.len(), "flushing batch on size limit");
                            flush_pending(client.as_ref(), &mut pending).await;
                        }
                    }
                    None => {
                        flush_pending(client.as_ref(), &mut pending).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Flush every pending update, draining the map
async fn flush_pending(client: &dyn NodeStatusClient, pending: &mut HashMap<NodeKey, StatusUpdate>) {
    for (key, update) in pending.drain() {
        if update.has_changes() {
            flush_one(client, &key, &update).await;
        }
    }
}

/// Apply one tenant's aggregated update: metrics out-of-band, then a
/// status write guarded by bounded optimistic-concurrency retry.
async fn flush_one(client: &dyn NodeStatusClient, key: &NodeKey, update: &StatusUpdate) {
    if let Some(ref payload) = update.metrics {
        record_metrics(key, payload);
    }

    let retry = RetryConfig::status_conflicts();
    let mut delay = retry.initial_delay;

    for attempt in 1..=retry.max_attempts {
        match write_status(client, key, update).await {
            Ok(()) => return,
            Err(e) if is_conflict(&e) && attempt < retry.max_attempts => {
                debug!(tenant = %key, attempt, "status update conflict, retrying");
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * retry.backoff_multiplier)
                        .min(retry.max_delay.as_secs_f64()),
                );
            }
            Err(e) => {
                error!(tenant = %key, error = %e, "failed to apply status update");
                return;
            }
        }
    }
}

/// One GET-mutate-write round; a missing tenant is a silent skip
async fn write_status(
    client: &dyn NodeStatusClient,
    key: &NodeKey,
    update: &StatusUpdate,
) -> Result<(), Error> {
    let Some(mut node) = client.get_node(key).await? else {
        debug!(tenant = %key, "node not found, skipping status update");
        return Ok(());
    };

    let status = node.status.get_or_insert_with(LoomNodeStatus::default);
    if !apply_to_status(status, update) {
        return Ok(());
    }

    client.update_status(&node).await
}

/// Mutate the status in place; returns true when anything differed
fn apply_to_status(status: &mut LoomNodeStatus, update: &StatusUpdate) -> bool {
    let mut changed = false;

    if let Some(generation) = update.observed_generation {
        if status.observed_generation != generation {
            status.observed_generation = generation;
            changed = true;
        }
    }
    if let Some(ready) = update.ready {
        if status.ready_resources != ready {
            status.ready_resources = ready;
            changed = true;
        }
    }
    if let Some(failed) = update.failed {
        if status.failed_resources != failed {
            status.failed_resources = failed;
            changed = true;
        }
    }
    if let Some(desired) = update.desired {
        if status.desired_resources != desired {
            status.desired_resources = desired;
            changed = true;
        }
    }
    if let Some(conflicted) = update.conflicted {
        if status.conflicted_resources != conflicted {
            status.conflicted_resources = conflicted;
            changed = true;
        }
    }
    if let Some(ref keys) = update.applied_resources {
        if &status.applied_resources != keys {
            status.applied_resources = keys.clone();
            changed = true;
        }
    }
    for condition in update.conditions.values() {
        // set_condition refreshes LastTransitionTime only on real change
        changed |= status.set_condition(condition.clone());
    }

    changed
}

/// Mirror a metrics payload into the catalogue (no cluster write)
fn record_metrics(key: &NodeKey, payload: &MetricsPayload) {
    metrics::set_node_resource_counts(
        &key.name,
        &key.namespace,
        payload.ready as i64,
        payload.desired as i64,
        payload.failed as i64,
        payload.conflicted as i64,
    );

    for condition in &payload.conditions {
        metrics::set_condition_status(
            &key.name,
            &key.namespace,
            &condition.type_,
            condition.status.gauge_value(),
        );
    }

    metrics::set_degraded_status(
        &key.name,
        &key.namespace,
        payload.is_degraded,
        &payload.degraded_reason,
    );
}

fn is_conflict(err: &Error) -> bool {
    matches!(
        err,
        Error::Kube {
            source: kube::Error::Api(ae)
        } if ae.code == 409
    )
}
