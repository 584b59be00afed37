//! LoomHub controller
//!
//! Polls the external row source on the hub's sync interval, diffs the
//! active rows against existing nodes, and materializes one LoomNode per
//! (form, row) pair. Rows that disappear - or flip inactive - get their
//! nodes deleted; the node controller's finalizer then runs the per-
//! resource deletion policies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use loom_common::crd::{
    Condition, ConditionStatus, LoomForm, LoomHub, LoomHubStatus, LoomNode, LoomNodeSpec,
    MySqlSourceSpec, SourceType, CONDITION_READY,
};
use loom_common::events::{actions, reasons};
use loom_common::{
    metrics, Error, EventPublisher, ANNOTATION_ACTIVATE, ANNOTATION_EXTRA_VALUES,
    ANNOTATION_HOST_OR_URL, API_GROUP, LABEL_FORM, LABEL_HUB,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::datasource::{
    Datasource, MySqlAdapter, MySqlConnectConfig, NodeRow, QueryConfig,
};
use crate::template::{build_variables, Engine};

use super::render::resolve_groups;
use super::BackoffTracker;

#[cfg(test)]
use mockall::automock;

/// Finalizer guarding hub cleanup
pub const HUB_FINALIZER: &str = "loomhub.loom.dev/finalizer";

/// Fallback when the hub's syncInterval fails to parse
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Seam for constructing datasource adapters, mockable in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatasourceFactory: Send + Sync {
    /// Open an adapter for the given connection parameters
    async fn connect(&self, config: &MySqlConnectConfig) -> Result<Arc<dyn Datasource>, Error>;
}

/// Production factory creating MySQL adapters
pub struct MySqlDatasourceFactory;

#[async_trait]
impl DatasourceFactory for MySqlDatasourceFactory {
    async fn connect(&self, config: &MySqlConnectConfig) -> Result<Arc<dyn Datasource>, Error> {
        Ok(Arc::new(MySqlAdapter::connect(config).await?))
    }
}

/// Shared state handed to every hub reconcile
pub struct Context {
    /// Kube client
    pub client: Client,
    /// Shared template engine
    pub engine: Arc<Engine>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Datasource adapter factory
    pub datasources: Arc<dyn DatasourceFactory>,
    /// Transient-error backoff state
    pub backoff: BackoffTracker,
}

fn hub_object_ref(hub: &LoomHub) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{API_GROUP}/v1alpha1")),
        kind: Some("LoomHub".to_string()),
        name: hub.metadata.name.clone(),
        namespace: hub.metadata.namespace.clone(),
        uid: hub.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Parse the hub's syncInterval, falling back to 30s
fn sync_interval(hub: &LoomHub) -> Duration {
    humantime::parse_duration(&hub.spec.source.sync_interval).unwrap_or_else(|_| {
        warn!(
            interval = %hub.spec.source.sync_interval,
            "invalid syncInterval, using default"
        );
        DEFAULT_SYNC_INTERVAL
    })
}

/// Sanitize a row uid into a DNS-1123 name fragment
fn sanitize_name_fragment(raw: &str) -> String {
    let mut out: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.starts_with('-') {
        out.remove(0);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Node name for a (form, uid) pair, capped at the 63-byte name limit
pub fn node_name(form: &str, uid: &str) -> String {
    let combined = format!("{form}-{}", sanitize_name_fragment(uid));
    crate::template::trunc63(&combined)
}

/// Build the desired node for one (form, row) pair.
///
/// Resolves the form's metadata templates against the row's variables and
/// stamps the row data onto annotations for the node controller.
pub fn desired_node(
    hub: &LoomHub,
    form: &LoomForm,
    row: &NodeRow,
    engine: &Engine,
) -> Result<LoomNode, Error> {
    let vars = build_variables(&row.uid, &row.host_or_url, &row.activate, &row.extra);
    let groups = resolve_groups(engine, &form.spec.resources, &vars)?;

    let mut node = LoomNode::new(
        &node_name(&form.name_any(), &row.uid),
        LoomNodeSpec {
            uid: row.uid.clone(),
            form_ref: form.name_any(),
            resources: groups,
        },
    );
    node.metadata.namespace = hub.namespace();

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_HUB.to_string(), hub.name_any());
    labels.insert(LABEL_FORM.to_string(), form.name_any());
    node.metadata.labels = Some(labels);

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_HOST_OR_URL.to_string(), row.host_or_url.clone());
    annotations.insert(ANNOTATION_ACTIVATE.to_string(), row.activate.clone());
    if !row.extra.is_empty() {
        let extra = serde_json::to_string(&row.extra)
            .map_err(|e| Error::serialization(format!("cannot serialize extra values: {e}")))?;
        annotations.insert(ANNOTATION_EXTRA_VALUES.to_string(), extra);
    }
    node.metadata.annotations = Some(annotations);

    Ok(node)
}

/// True when an existing node differs from the desired rendering
pub fn should_update(existing: &LoomNode, desired: &LoomNode) -> bool {
    if existing.spec != desired.spec {
        return true;
    }
    let existing_annotations = existing.metadata.annotations.clone().unwrap_or_default();
    let desired_annotations = desired.metadata.annotations.clone().unwrap_or_default();
    for key in [
        ANNOTATION_HOST_OR_URL,
        ANNOTATION_ACTIVATE,
        ANNOTATION_EXTRA_VALUES,
    ] {
        if existing_annotations.get(key) != desired_annotations.get(key) {
            return true;
        }
    }
    false
}

/// Reconcile one hub: poll the source and converge the node set
pub async fn reconcile(hub: Arc<LoomHub>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = hub.name_any();
    let namespace = hub.namespace().unwrap_or_default();
    let interval = sync_interval(&hub);

    let nodes: Api<LoomNode> = Api::namespaced(ctx.client.clone(), &namespace);
    let hubs: Api<LoomHub> = Api::namespaced(ctx.client.clone(), &namespace);

    // Deletion: remove every node this hub produced, then drop the finalizer
    if hub.meta().deletion_timestamp.is_some() {
        if hub.finalizers().iter().any(|f| f == HUB_FINALIZER) {
            let owned = list_hub_nodes(&nodes, &name).await?;
            info!(hub = %name, count = owned.len(), "hub deleted, removing its nodes");
            for node in owned {
                let node_name = node.name_any();
                if let Err(e) = nodes.delete(&node_name, &Default::default()).await {
                    if !is_not_found(&e) {
                        warn!(hub = %name, node = %node_name, error = %e, "failed to delete node");
                    }
                }
            }

            let finalizers: Vec<String> = hub
                .finalizers()
                .iter()
                .filter(|f| *f != HUB_FINALIZER)
                .cloned()
                .collect();
            hubs.patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
            )
            .await?;
            info!(hub = %name, "finalizer removed, hub cleanup complete");
        }
        return Ok(Action::await_change());
    }

    // Ensure the finalizer is present
    if !hub.finalizers().iter().any(|f| f == HUB_FINALIZER) {
        let mut finalizers = hub.finalizers().to_vec();
        finalizers.push(HUB_FINALIZER.to_string());
        hubs.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Forms referencing this hub
    let forms: Api<LoomForm> = Api::namespaced(ctx.client.clone(), &namespace);
    let referencing: Vec<LoomForm> = forms
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|form| form.spec.hub_ref == name)
        .collect();

    // Query the source; failures surface on the hub's conditions only
    let rows = match query_rows(&hub, &ctx).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(hub = %name, error = %e, "datasource query failed");
            ctx.events
                .publish(
                    &hub_object_ref(&hub),
                    EventType::Warning,
                    reasons::DATASOURCE_QUERY_FAILED,
                    actions::SYNC,
                    Some(e.to_string()),
                )
                .await;
            stamp_hub_status(&hubs, &hub, 0, 0, 0, Some(&e)).await?;
            return Ok(Action::requeue(interval));
        }
    };

    debug!(hub = %name, rows = rows.len(), forms = referencing.len(), "synced source rows");

    // Desired set: one node per (form, row)
    let mut desired: HashMap<(String, String), LoomNode> = HashMap::new();
    for form in &referencing {
        for row in &rows {
            match desired_node(&hub, form, row, &ctx.engine) {
                Ok(node) => {
                    desired.insert((form.name_any(), row.uid.clone()), node);
                }
                Err(e) => {
                    warn!(hub = %name, form = %form.name_any(), uid = %row.uid, error = %e,
                          "failed to render node from form");
                }
            }
        }
    }

    // Existing set, keyed the same way
    let existing_nodes = list_hub_nodes(&nodes, &name).await?;
    let mut existing: HashMap<(String, String), LoomNode> = existing_nodes
        .into_iter()
        .map(|node| {
            (
                (node.spec.form_ref.clone(), node.spec.uid.clone()),
                node,
            )
        })
        .collect();

    // Create or update
    for (key, desired_node) in &desired {
        match existing.remove(key) {
            None => {
                match nodes.create(&PostParams::default(), desired_node).await {
                    Ok(_) => {
                        info!(hub = %name, node = %desired_node.name_any(), "node created");
                    }
                    Err(e) if is_already_exists(&e) => {}
                    Err(e) => {
                        warn!(hub = %name, node = %desired_node.name_any(), error = %e, "failed to create node");
                    }
                }
            }
            Some(mut current) => {
                if should_update(&current, desired_node) {
                    current.spec = desired_node.spec.clone();
                    let mut annotations = current.metadata.annotations.unwrap_or_default();
                    for (k, v) in desired_node.metadata.annotations.clone().unwrap_or_default() {
                        annotations.insert(k, v);
                    }
                    current.metadata.annotations = Some(annotations);

                    match nodes
                        .replace(&current.name_any(), &PostParams::default(), &current)
                        .await
                    {
                        Ok(_) => {
                            info!(hub = %name, node = %current.name_any(), "node updated");
                        }
                        Err(e) => {
                            warn!(hub = %name, node = %current.name_any(), error = %e, "failed to update node");
                        }
                    }
                }
            }
        }
    }

    // Whatever is left in `existing` is no longer desired: row deleted,
    // deactivated, or the form changed
    for (key, node) in existing {
        let node_name = node.name_any();
        info!(hub = %name, node = %node_name, form = %key.0, uid = %key.1,
              "deleting node, no longer in active dataset");
        ctx.events
            .publish(
                &hub_object_ref(&hub),
                EventType::Normal,
                reasons::NODE_DELETING,
                actions::SYNC,
                Some(format!(
                    "Deleting LoomNode '{node_name}' (form: {}, uid: {}) - no longer in active dataset",
                    key.0, key.1
                )),
            )
            .await;
        if let Err(e) = nodes.delete(&node_name, &Default::default()).await {
            if !is_not_found(&e) {
                warn!(hub = %name, node = %node_name, error = %e, "failed to delete node");
                ctx.events
                    .publish(
                        &hub_object_ref(&hub),
                        EventType::Warning,
                        reasons::NODE_DELETION_FAILED,
                        actions::SYNC,
                        Some(format!("Failed to delete LoomNode '{node_name}': {e}")),
                    )
                    .await;
            }
        }
    }

    // Status: desired vs observed readiness
    let total_desired = (referencing.len() * rows.len()) as i32;
    let (ready, failed) = count_node_health(&list_hub_nodes(&nodes, &name).await?);
    stamp_hub_status(&hubs, &hub, total_desired, ready, failed, None).await?;
    metrics::set_hub_counts(
        &name,
        &namespace,
        total_desired as i64,
        ready as i64,
        failed as i64,
    );

    ctx.backoff.reset(&name);
    Ok(Action::requeue(interval))
}

/// Error policy for the hub controller
pub fn error_policy(hub: Arc<LoomHub>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = hub.name_any();
    if err.is_retryable() {
        let delay = ctx.backoff.next_delay(&name);
        warn!(hub = %name, error = %err, delay_secs = delay.as_secs(), "hub reconcile failed, requeuing");
        Action::requeue(delay)
    } else {
        Action::await_change()
    }
}

/// List every node labeled as produced by this hub
async fn list_hub_nodes(api: &Api<LoomNode>, hub_name: &str) -> Result<Vec<LoomNode>, Error> {
    let params = ListParams::default().labels(&format!("{LABEL_HUB}={hub_name}"));
    Ok(api.list(&params).await?.items)
}

/// Count nodes that are ready vs failing
fn count_node_health(nodes: &[LoomNode]) -> (i32, i32) {
    let mut ready = 0;
    let mut failed = 0;
    for node in nodes {
        match &node.status {
            Some(status) if status.is_ready() => ready += 1,
            Some(status) if status.failed_resources > 0 || status.conflicted_resources > 0 => {
                failed += 1;
            }
            _ => {}
        }
    }
    (ready, failed)
}

/// Query the hub's source for active rows
async fn query_rows(hub: &LoomHub, ctx: &Context) -> Result<Vec<NodeRow>, Error> {
    let name = hub.name_any();

    match hub.spec.source.type_ {
        SourceType::MySql => {
            let mysql = hub
                .spec
                .source
                .mysql
                .as_ref()
                .ok_or_else(|| Error::datasource(name.clone(), "mysql configuration missing"))?;

            let password = resolve_password(hub, mysql, ctx).await?;
            let connect = connect_config(mysql, password);

            let adapter = ctx
                .datasources
                .connect(&connect)
                .await
                .map_err(|e| Error::datasource(name.clone(), e.to_string()))?;

            let query = QueryConfig {
                table: mysql.table.clone(),
                value_mappings: hub.spec.value_mappings.clone(),
                extra_mappings: hub.spec.extra_value_mappings.clone(),
            };

            let result = adapter
                .query_nodes(&query)
                .await
                .map_err(|e| Error::datasource(name.clone(), e.to_string()));
            adapter.close().await;
            result
        }
    }
}

/// Build adapter connection parameters from the hub spec
fn connect_config(mysql: &MySqlSourceSpec, password: String) -> MySqlConnectConfig {
    let pool = mysql.pool.clone().unwrap_or_default();
    MySqlConnectConfig {
        host: mysql.host.clone(),
        port: mysql.port,
        username: mysql.username.clone(),
        password,
        database: mysql.database.clone(),
        max_open_conns: pool.max_open_conns,
        max_idle_conns: pool.max_idle_conns,
        conn_max_lifetime: pool
            .conn_max_lifetime
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok()),
    }
}

/// Read the password from the referenced Secret, "" when unset
async fn resolve_password(
    hub: &LoomHub,
    mysql: &MySqlSourceSpec,
    ctx: &Context,
) -> Result<String, Error> {
    let Some(ref secret_ref) = mysql.password_ref else {
        return Ok(String::new());
    };

    let secrets: Api<Secret> =
        Api::namespaced(ctx.client.clone(), &hub.namespace().unwrap_or_default());
    let secret = secrets.get_opt(&secret_ref.name).await?.ok_or_else(|| {
        Error::datasource(
            hub.name_any(),
            format!("password secret {:?} not found", secret_ref.name),
        )
    })?;

    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&secret_ref.key))
        .ok_or_else(|| {
            Error::datasource(
                hub.name_any(),
                format!(
                    "key {:?} not found in secret {:?}",
                    secret_ref.key, secret_ref.name
                ),
            )
        })?;

    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::datasource(hub.name_any(), "password is not valid UTF-8"))
}

/// Write the hub's status and Ready condition
async fn stamp_hub_status(
    api: &Api<LoomHub>,
    hub: &LoomHub,
    desired: i32,
    ready: i32,
    failed: i32,
    sync_error: Option<&Error>,
) -> Result<(), Error> {
    let name = hub.name_any();
    let Some(mut latest) = api.get_opt(&name).await? else {
        return Ok(());
    };

    let condition = match sync_error {
        None => Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Synced",
            format!("Source synced: {desired} desired nodes"),
        ),
        Some(e) => Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "SyncFailed",
            e.to_string(),
        ),
    };

    let status = latest.status.get_or_insert_with(LoomHubStatus::default);
    status.observed_generation = hub.meta().generation;
    status.desired = desired;
    status.ready = ready;
    status.failed = failed;

    match status.conditions.iter_mut().find(|c| c.type_ == CONDITION_READY) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => status.conditions.push(condition),
    }

    let data = serde_json::to_vec(&latest)
        .map_err(|e| Error::serialization(format!("cannot serialize hub status: {e}")))?;
    api.replace_status(&name, &PostParams::default(), data)
        .await?;
    Ok(())
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_common::crd::{
        DataSourceSpec, LoomFormSpec, LoomHubSpec, ResourceGroups, TResource, ValueMappings,
    };

    fn hub() -> LoomHub {
        let mut hub = LoomHub::new(
            "main-hub",
            LoomHubSpec {
                source: DataSourceSpec {
                    type_: SourceType::MySql,
                    sync_interval: "45s".to_string(),
                    mysql: None,
                },
                value_mappings: ValueMappings {
                    uid: "id".to_string(),
                    host_or_url: "url".to_string(),
                    activate: "active".to_string(),
                },
                extra_value_mappings: BTreeMap::new(),
            },
        );
        hub.metadata.namespace = Some("tenants".to_string());
        hub
    }

    fn form() -> LoomForm {
        let mut form = LoomForm::new(
            "web-form",
            LoomFormSpec {
                hub_ref: "main-hub".to_string(),
                resources: ResourceGroups {
                    config_maps: vec![TResource {
                        id: "cfg".to_string(),
                        spec: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                        name_template: Some("{{ uid }}-config".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
        );
        form.metadata.namespace = Some("tenants".to_string());
        form
    }

    fn row() -> NodeRow {
        NodeRow {
            uid: "acme".to_string(),
            host_or_url: "https://acme.example.com".to_string(),
            activate: "1".to_string(),
            extra: BTreeMap::from([("plan".to_string(), "gold".to_string())]),
        }
    }

    #[test]
    fn test_sync_interval_parsing() {
        assert_eq!(sync_interval(&hub()), Duration::from_secs(45));

        let mut bad = hub();
        bad.spec.source.sync_interval = "not-a-duration".to_string();
        assert_eq!(sync_interval(&bad), DEFAULT_SYNC_INTERVAL);
    }

    #[test]
    fn test_node_name_sanitizes_and_truncates() {
        assert_eq!(node_name("web-form", "acme"), "web-form-acme");
        assert_eq!(node_name("web-form", "Acme Corp!"), "web-form-acme-corp");

        let long_uid = "x".repeat(100);
        let name = node_name("web-form", &long_uid);
        assert!(name.len() <= 63);
    }

    #[test]
    fn test_desired_node_resolves_templates_and_stamps_row_data() {
        let node = desired_node(&hub(), &form(), &row(), &Engine::new()).unwrap();

        assert_eq!(node.name_any(), "web-form-acme");
        assert_eq!(node.spec.uid, "acme");
        assert_eq!(node.spec.form_ref, "web-form");
        // Metadata templates resolved with the row's variables
        assert_eq!(
            node.spec.resources.config_maps[0].name_template.as_deref(),
            Some("acme-config")
        );

        let labels = node.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_HUB], "main-hub");
        assert_eq!(labels[LABEL_FORM], "web-form");

        let annotations = node.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations[ANNOTATION_HOST_OR_URL],
            "https://acme.example.com"
        );
        assert_eq!(annotations[ANNOTATION_ACTIVATE], "1");
        let extras: BTreeMap<String, String> =
            serde_json::from_str(&annotations[ANNOTATION_EXTRA_VALUES]).unwrap();
        assert_eq!(extras["plan"], "gold");
    }

    #[test]
    fn test_should_update_detects_row_changes() {
        let engine = Engine::new();
        let existing = desired_node(&hub(), &form(), &row(), &engine).unwrap();

        // Unchanged row: no update
        let same = desired_node(&hub(), &form(), &row(), &engine).unwrap();
        assert!(!should_update(&existing, &same));

        // Host change flows through both annotations and rendered spec
        let mut moved = row();
        moved.host_or_url = "https://acme.other.com".to_string();
        let desired = desired_node(&hub(), &form(), &moved, &engine).unwrap();
        assert!(should_update(&existing, &desired));

        // Extra-value change re-renders too
        let mut upgraded = row();
        upgraded.extra.insert("plan".to_string(), "platinum".to_string());
        let desired = desired_node(&hub(), &form(), &upgraded, &engine).unwrap();
        assert!(should_update(&existing, &desired));
    }

    #[test]
    fn test_count_node_health() {
        use loom_common::crd::LoomNodeStatus;

        let mut ready_node = LoomNode::new("a", LoomNodeSpec::default());
        let mut status = LoomNodeStatus::default();
        status.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Reconciled",
            "ok",
        ));
        ready_node.status = Some(status);

        let mut failed_node = LoomNode::new("b", LoomNodeSpec::default());
        failed_node.status = Some(LoomNodeStatus {
            failed_resources: 2,
            ..Default::default()
        });

        let pending_node = LoomNode::new("c", LoomNodeSpec::default());

        let (ready, failed) = count_node_health(&[ready_node, failed_node, pending_node]);
        assert_eq!(ready, 1);
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_connect_config_defaults_and_pool_parsing() {
        let mysql = MySqlSourceSpec {
            host: "db.internal".to_string(),
            port: 3306,
            username: "loom".to_string(),
            password_ref: None,
            database: "tenants".to_string(),
            table: "accounts".to_string(),
            pool: Some(loom_common::crd::MySqlPoolSpec {
                max_open_conns: Some(50),
                max_idle_conns: None,
                conn_max_lifetime: Some("10m".to_string()),
            }),
        };

        let config = connect_config(&mysql, "hunter2".to_string());
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.max_open_conns, Some(50));
        assert_eq!(config.max_idle_conns, None);
        assert_eq!(config.conn_max_lifetime, Some(Duration::from_secs(600)));
    }
}
