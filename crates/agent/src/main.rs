//! Drain Rollout Agent - rescues node drains blocked by disruption budgets
//!
//! This binary runs as a DaemonSet on each Kubernetes node. While its node
//! is cordoned it restarts single-replica deployments whose disruption
//! budget would otherwise keep the drain waiting forever.

use agent_lib::{
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    KubeClusterReader, RemediationLoopBuilder,
};
use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drain rollout agent
#[derive(Parser)]
#[command(name = "drain-rollout-agent")]
#[command(version, about = "Restarts single-replica deployments blocking a node drain", long_about = None)]
struct Cli {
    /// Path to kubeconfig file, used when not running in a cluster
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Node to watch (defaults to AGENT_NODE_NAME / KUBERNETES_NODE_NAME)
    #[arg(long)]
    node_name: Option<String>,

    /// Report stuck deployments without restarting them
    #[arg(long)]
    dry_run: bool,
}

/// Build a client from in-cluster credentials, falling back to a kubeconfig file
async fn kube_client(kubeconfig: Option<&str>) -> Result<kube::Client> {
    let client_config = match kube::Config::incluster() {
        Ok(client_config) => {
            info!("Using in-cluster configuration");
            client_config
        }
        Err(e) => {
            let path = config::kubeconfig_path(kubeconfig)?;
            info!(
                reason = %e,
                path = %path.display(),
                "Not running in a cluster, using kubeconfig"
            );

            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
    };

    kube::Client::try_from(client_config).context("Failed to create Kubernetes client")
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting drain-rollout-agent");

    let cli = Cli::parse();

    let mut config = config::AgentConfig::load()?;
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }
    config.dry_run |= cli.dry_run;
    info!(
        node_name = %config.node_name,
        interval_secs = config.interval_secs,
        fail_fast = config.fail_fast,
        restart_marker_ttl_secs = ?config.restart_marker_ttl_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::with_stall_after(config.stall_after());
    health_registry.register(components::NODE_WATCH).await;
    health_registry.register(components::CLUSTER_API).await;

    let metrics = AgentMetrics::new();

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.interval_secs, config.dry_run);

    let client = kube_client(cli.kubeconfig.as_deref()).await?;
    let reader = Arc::new(KubeClusterReader::new(client));

    let remediation_loop = RemediationLoopBuilder::new()
        .reader(reader)
        .node_name(config.node_name.clone())
        .interval(config.interval())
        .error_policy(config.error_policy())
        .restart_marker_ttl(config.restart_marker_ttl())
        .dry_run(config.dry_run)
        .health(health_registry.clone())
        .build()
        .context("Invalid remediation loop configuration")?;

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry,
        metrics,
        config.node_name.clone(),
        config.dry_run,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut loop_handle = tokio::spawn(remediation_loop.run(shutdown_rx));

    let result = tokio::select! {
        joined = &mut loop_handle => {
            joined
                .context("Remediation loop panicked")?
                .context("Remediation loop failed")
        }
        reason = shutdown_signal() => {
            logger.log_shutdown(reason);
            let _ = shutdown_tx.send(());
            loop_handle
                .await
                .context("Remediation loop panicked")?
                .context("Remediation loop failed")
        }
    };

    api_handle.abort();
    info!("Shutting down");

    result
}
