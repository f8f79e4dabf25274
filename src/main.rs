//! KaaS orchestrator - provisioning coordinator and MicroK8s lifecycle daemon

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kaas::agent::DefaultKubeClientFactory;
use kaas::cache::InfoCache;
use kaas::coordinator::{
    request_channel, CoordinatorOptions, NoopHooks, ProvisioningCoordinator,
};
use kaas::microk8s::Microk8sAdapter;
use kaas::provider::ProviderRegistry;
use kaas::store::InMemoryStore;
use kaas::types::Provider;
use kaas::{DEFAULT_POLL_INTERVAL_SECS, MAX_STATE_RETRIES};

/// KaaS - drives provisioning requests to agent-connected Kubernetes
/// clusters and manages self-hosted MicroK8s clusters over SSH
#[derive(Parser, Debug)]
#[command(name = "kaas", version, about, long_about = None)]
struct Cli {
    /// Path to the multi-document YAML manifests for the platform agent
    #[arg(long, env = "KAAS_AGENT_MANIFESTS")]
    agent_manifests: std::path::PathBuf,

    /// Delay between state machine attempts, in seconds
    #[arg(long, env = "KAAS_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval_secs: u64,

    /// Retries per provisioning state before a task is failed
    #[arg(long, env = "KAAS_MAX_STATE_RETRIES", default_value_t = MAX_STATE_RETRIES)]
    max_state_retries: u32,

    /// Hours between provider metadata refresh sweeps
    #[arg(long, env = "KAAS_CACHE_REFRESH_HOURS", default_value_t = 12)]
    cache_refresh_hours: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let agent_manifests = tokio::fs::read_to_string(&cli.agent_manifests)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to read agent manifests {:?}: {}",
                cli.agent_manifests,
                e
            )
        })?;

    let store = Arc::new(InMemoryStore::new());
    let kube_factory = Arc::new(DefaultKubeClientFactory::new(agent_manifests));

    let mut registry = ProviderRegistry::new();
    registry.register(
        Provider::Microk8s,
        Arc::new(Microk8sAdapter::new(kube_factory.clone())),
    );
    let registry = Arc::new(registry);

    let options = CoordinatorOptions {
        poll_interval: Duration::from_secs(cli.poll_interval_secs),
        max_state_retries: cli.max_state_retries,
    };
    let coordinator = ProvisioningCoordinator::new(
        store.clone(),
        registry.clone(),
        kube_factory,
        Arc::new(NoopHooks),
        options,
    );

    let (cache, cache_updates) = InfoCache::new(store.clone(), registry);
    let cache = cache
        .with_refresh_interval(Duration::from_secs(cli.cache_refresh_hours * 60 * 60));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The handle is the submission point for the surrounding platform's
    // request boundary; the daemon itself only restores persisted tasks.
    let (_handle, requests) = request_channel();

    let coordinator_shutdown = shutdown_rx.clone();
    let coordinator_task =
        tokio::spawn(async move { coordinator.run(requests, coordinator_shutdown).await });
    let cache_task =
        tokio::spawn(async move { cache.run(cache_updates, shutdown_rx).await });

    tracing::info!("kaas orchestrator started");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown signal received");
    shutdown_tx
        .send(true)
        .map_err(|e| anyhow::anyhow!("Failed to broadcast shutdown: {}", e))?;

    coordinator_task
        .await
        .map_err(|e| anyhow::anyhow!("Coordinator task panicked: {}", e))?;
    cache_task
        .await
        .map_err(|e| anyhow::anyhow!("Cache task panicked: {}", e))?;

    tracing::info!("kaas orchestrator stopped");
    Ok(())
}
