//! # Initialization
//!
//! Operator start-up: rustls, tracing, metrics, probe server, Kubernetes client,
//! credential secret cache, reconciler context and the admission webhook server.

use crate::admission::start_webhook_server;
use crate::config::{OperatorConfig, SharedOperatorConfig};
use crate::constants::{
    DEFAULT_SERVER_POLL_INTERVAL_MS, DEFAULT_SERVER_STARTUP_TIMEOUT_SECS, LABEL_MANAGED_SECRET,
};
use crate::controller::credentials::KubeSecretReader;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability;
use crate::provider::http::HttpClientFactory;
use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    pub config: SharedOperatorConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sm_service_operator=info".into());
    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(e) = result {
        warn!("Tracing subscriber init returned error (may already be initialized): {}", e);
    }
}

/// Initialize the operator runtime
pub async fn initialize() -> Result<InitializationResult> {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    let config: SharedOperatorConfig = Arc::new(OperatorConfig::from_env());
    init_tracing(&config.log_format);

    info!("Starting SM Service Operator");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        management_namespace = %config.management_namespace,
        release_namespace = %config.release_namespace,
        enable_namespace_secrets = config.enable_namespace_secrets,
        enable_limited_cache = config.enable_limited_cache,
        cluster_id = %config.cluster_id,
        "Operator configuration loaded"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = server_state.clone();
    let metrics_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let secrets = start_secret_cache(client.clone(), config.enable_limited_cache).await?;
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        config.clone(),
        Arc::new(HttpClientFactory::new()),
        Arc::new(KubeSecretReader::new(
            client.clone(),
            Some(secrets),
            config.enable_limited_cache,
        )),
    ));

    summarize_existing::<ServiceInstance>(&client).await?;
    summarize_existing::<ServiceBinding>(&client).await?;

    let webhook_port = config.webhook_port;
    let cert_dir = config.webhook_cert_dir.clone();
    tokio::spawn(async move {
        if let Err(e) = start_webhook_server(webhook_port, &cert_dir).await {
            error!("Admission webhook server error: {}", e);
        }
    });

    info!("Operator initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        config,
    })
}

/// Reflector over secrets used for credential lookups
///
/// With the limited cache only labelled secrets are cached; the rest are read
/// directly by [`KubeSecretReader`].
async fn start_secret_cache(client: Client, limited: bool) -> Result<Store<Secret>> {
    let api: Api<Secret> = Api::all(client);
    let watch_config = if limited {
        watcher::Config::default().labels(LABEL_MANAGED_SECRET)
    } else {
        watcher::Config::default()
    };

    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watch_config))
        .default_backoff()
        .touched_objects();
    tokio::spawn(async move {
        stream
            .for_each(|event| async move {
                if let Err(e) = event {
                    warn!(error = %e, "Secret cache watch error");
                }
            })
            .await;
    });

    reader
        .wait_until_ready()
        .await
        .context("Secret cache stopped before becoming ready")?;
    info!(limited, cached = reader.state().len(), "Secret cache ready");
    Ok(reader)
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(DEFAULT_SERVER_STARTUP_TIMEOUT_SECS);
    let poll_interval = Duration::from_millis(DEFAULT_SERVER_POLL_INTERVAL_MS);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log how many resources of kind `K` already exist, by namespace
async fn summarize_existing<K>(client: &Client) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let kind = K::kind(&());
    let api: Api<K> = Api::all(client.clone());
    let list = match api.list_metadata(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(resource.kind = %kind, error = %e, "CRD is not queryable yet");
            return Ok(());
        }
    };

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in &list.items {
        by_namespace
            .entry(item.namespace().unwrap_or_default())
            .or_default()
            .push(item.name_any());
    }

    info!("Startup Resource Summary");
    info!("Resource Kind: {}", kind);
    info!("Total Resources: {}", list.items.len());
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, mut names) in by_namespace {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), shown);
    }
    Ok(())
}
