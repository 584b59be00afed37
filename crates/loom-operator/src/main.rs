//! Loom operator - materializes per-tenant Kubernetes workloads
//!
//! Boot surface: kubeconfig path, metrics/health bind address, optional
//! leader-election namespace, log level. Exit code 0 on clean shutdown,
//! non-zero on fatal initialization errors.

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Config, CustomResourceExt};
use tracing::{info, warn};

use loom_common::crd::{LoomForm, LoomHub, LoomNode};
use loom_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use loom_common::telemetry::{init_telemetry, TelemetryConfig};
use loom_common::{KubeEventPublisher, FIELD_MANAGER};

use loom_operator::apply::KubeResourceClient;
use loom_operator::controller::{form, hub, node, BackoffTracker};
use loom_operator::status::{KubeNodeStatusClient, StatusManager, StatusManagerOptions};
use loom_operator::template::Engine;

/// Loom - CRD-driven multi-tenant workload materializer
#[derive(Parser, Debug)]
#[command(name = "loom-operator", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig file; in-cluster config when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<std::path::PathBuf>,

    /// Bind address for the health endpoints
    #[arg(long, default_value = "0.0.0.0:8081")]
    metrics_bind_address: String,

    /// Namespace for the leader-election Lease; no election when omitted
    #[arg(long)]
    leader_election_namespace: Option<String>,

    /// Base log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for all three kinds
        for crd in [LoomHub::crd(), LoomForm::crd(), LoomNode::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "loom-operator".to_string(),
        log_level: cli.log_level.clone(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("telemetry initialization failed: {e}"))?;

    let client = build_client(cli.kubeconfig.as_deref()).await?;

    ensure_crds_installed(&client).await?;

    // Health endpoints come up before leader election so probes pass on
    // standby replicas
    let health_addr = cli.metrics_bind_address.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(&health_addr).await {
            warn!(error = %e, "health server failed");
        }
    });

    // Optional leader election: only the leader runs controllers
    let mut leader_guard = None;
    if let Some(ref namespace) = cli.leader_election_namespace {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "loom-operator".to_string());
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            namespace,
            &identity,
        ));
        leader_guard = Some(elector.acquire().await?);
    }

    run_controllers(client, leader_guard).await
}

/// Build the kube client from an explicit kubeconfig or the environment
async fn build_client(kubeconfig: Option<&std::path::Path>) -> anyhow::Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let config = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("cannot read kubeconfig {path:?}: {e}"))?;
            let config =
                Config::from_custom_kubeconfig(config, &KubeConfigOptions::default()).await?;
            Client::try_from(config)?
        }
        None => Client::try_default().await?,
    };
    Ok(client)
}

/// Install/update the Loom CRDs via server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        ("loomhubs.loom.dev", LoomHub::crd()),
        ("loomforms.loom.dev", LoomForm::crd()),
        ("loomnodes.loom.dev", LoomNode::crd()),
    ] {
        info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {name}: {e}"))?;
    }

    info!("all Loom CRDs installed");
    Ok(())
}

/// Liveness/readiness endpoints
async fn serve_health(addr: &str) -> anyhow::Result<()> {
    use axum::routing::get;

    let router = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "health endpoints listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Start the three controllers and block until shutdown
async fn run_controllers(
    client: Client,
    mut leader_guard: Option<loom_common::leader_election::LeaderGuard>,
) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::new());
    let resources = Arc::new(KubeResourceClient::new(client.clone()));
    let status = StatusManager::new(
        Arc::new(KubeNodeStatusClient::new(client.clone())),
        StatusManagerOptions::default(),
    );

    let node_ctx = Arc::new(node::Context {
        client: client.clone(),
        resources: resources.clone(),
        status: Arc::clone(&status),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "loom-node-controller",
        )),
        engine: Arc::clone(&engine),
        backoff: BackoffTracker::new(),
    });

    let form_ctx = Arc::new(form::Context {
        client: client.clone(),
        engine: Arc::clone(&engine),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "loom-form-controller",
        )),
        backoff: BackoffTracker::new(),
    });

    let hub_ctx = Arc::new(hub::Context {
        client: client.clone(),
        engine: Arc::clone(&engine),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "loom-hub-controller",
        )),
        datasources: Arc::new(hub::MySqlDatasourceFactory),
        backoff: BackoffTracker::new(),
    });

    let nodes: Api<LoomNode> = Api::all(client.clone());
    let forms: Api<LoomForm> = Api::all(client.clone());
    let hubs: Api<LoomHub> = Api::all(client.clone());

    let node_controller = Controller::new(nodes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(node::reconcile, node::error_policy, node_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "node controller error");
            }
        });

    let form_controller = Controller::new(forms, WatcherConfig::default())
        .shutdown_on_signal()
        .run(form::reconcile, form::error_policy, form_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "form controller error");
            }
        });

    let hub_controller = Controller::new(hubs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(hub::reconcile, hub::error_policy, hub_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "hub controller error");
            }
        });

    info!("controllers started");

    match leader_guard {
        Some(ref mut guard) => {
            tokio::select! {
                _ = futures::future::join3(node_controller, form_controller, hub_controller) => {
                    info!("controllers stopped");
                }
                _ = guard.lost() => {
                    warn!("leadership lost, shutting down");
                }
            }
        }
        None => {
            futures::future::join3(node_controller, form_controller, hub_controller).await;
            info!("controllers stopped");
        }
    }

    // Flush pending status work before exit
    status.shutdown().await;
    Ok(())
}
