//! Cluster API Operator - installs, upgrades and removes Cluster API providers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use capi_operator::controller_runner::build_provider_controllers;
use capi_operator::deployment_finalizer::{
    build_deployment_finalizer, FinalizerContext, KubeDeploymentOps,
};
use capi_operator::secret_watch::run_secret_propagator;
use capi_operator::startup::{ensure_crds_installed, render_crds};
use capi_operator::store::ClusterProviderStore;
use capi_operator_common::kube_utils::create_client;
use capi_operator_common::telemetry::{init_telemetry, TelemetryConfig};
use capi_operator_provider::config::{DEFAULT_CLUSTERCTL_CONFIG_PATH, DEFAULT_PROVIDER_READY_TIMEOUT};
use capi_operator_provider::{init_registry, Context, KubeClusterOps, OperatorConfig};

/// Cluster API Operator - declarative lifecycle management of Cluster API providers
#[derive(Parser, Debug)]
#[command(name = "capi-operator", version, about, long_about = None)]
struct Cli {
    /// Print the provider CRDs as YAML and exit
    #[arg(long)]
    crd: bool,

    /// clusterctl config file with provider and image overrides
    #[arg(long, env = "CLUSTERCTL_CONFIG", default_value = DEFAULT_CLUSTERCTL_CONFIG_PATH)]
    clusterctl_config: PathBuf,

    /// Seconds to wait for provider deployments to become ready
    #[arg(long, default_value_t = DEFAULT_PROVIDER_READY_TIMEOUT.as_secs())]
    provider_ready_timeout: u64,

    /// Parallel reconciles per provider kind
    #[arg(long, default_value_t = 4)]
    concurrency: u16,

    /// Namespace of the operator's own Deployment
    #[arg(long, env = "POD_NAMESPACE")]
    operator_namespace: Option<String>,

    /// Name of the operator's own Deployment
    #[arg(long, env = "OPERATOR_DEPLOYMENT_NAME", default_value = "capi-operator-controller-manager")]
    operator_deployment: String,

    /// Do not apply the provider CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", render_crds(init_registry())?);
        return Ok(());
    }

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(None).await?;
    let registry = init_registry();

    let config = OperatorConfig::load(&cli.clusterctl_config)?
        .with_ready_timeout(Duration::from_secs(cli.provider_ready_timeout));
    tracing::info!(
        path = %cli.clusterctl_config.display(),
        ready_timeout_secs = cli.provider_ready_timeout,
        "Operator configuration loaded"
    );

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client, registry).await?;
    }

    let shutdown = CancellationToken::new();
    let ops = Arc::new(KubeClusterOps::new(client.clone()));
    let ctx = Arc::new(
        Context::builder(client.clone())
            .cluster_ops(ops.clone())
            .config(Arc::new(config))
            .cancel(shutdown.clone())
            .build()?,
    );
    let store = Arc::new(ClusterProviderStore::new(ops));

    tracing::info!("Starting Cluster API operator controllers...");
    let mut controllers = build_provider_controllers(client.clone(), ctx, cli.concurrency);

    match cli.operator_namespace.as_deref() {
        Some(namespace) => {
            tracing::info!("- Operator deployment finalizer");
            let finalizer_ctx = Arc::new(FinalizerContext {
                store: store.clone(),
                deployments: Arc::new(KubeDeploymentOps::new(client.clone())),
                pod_name: std::env::var("POD_NAME").ok(),
            });
            controllers.push(Box::pin(build_deployment_finalizer(
                client.clone(),
                namespace,
                &cli.operator_deployment,
                finalizer_ctx,
            )));
        }
        None => {
            tracing::warn!("Operator namespace unknown, deployment finalizer disabled");
        }
    }

    let propagator = tokio::spawn(run_secret_propagator(
        client,
        registry,
        store,
        shutdown.clone(),
    ));
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    futures::future::join_all(controllers).await;

    shutdown.cancel();
    if let Err(e) = propagator.await {
        tracing::warn!(error = %e, "Secret propagator task failed");
    }
    tracing::info!("Cluster API operator stopped");
    Ok(())
}

/// Cancel in-flight readiness waits when the process is asked to stop
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_manifest() {
        let cli = Cli::try_parse_from(["capi-operator"]).unwrap();
        assert!(!cli.crd);
        assert!(!cli.skip_crd_install);
        assert_eq!(cli.concurrency, 4);
        assert_eq!(cli.provider_ready_timeout, 300);
        assert_eq!(cli.operator_deployment, "capi-operator-controller-manager");
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "capi-operator",
            "--clusterctl-config",
            "/tmp/clusterctl.yaml",
            "--provider-ready-timeout",
            "60",
            "--concurrency",
            "8",
            "--operator-namespace",
            "capi-operator-system",
            "--skip-crd-install",
        ])
        .unwrap();
        assert_eq!(cli.clusterctl_config, PathBuf::from("/tmp/clusterctl.yaml"));
        assert_eq!(cli.provider_ready_timeout, 60);
        assert_eq!(cli.concurrency, 8);
        assert_eq!(cli.operator_namespace.as_deref(), Some("capi-operator-system"));
        assert!(cli.skip_crd_install);
    }
}
