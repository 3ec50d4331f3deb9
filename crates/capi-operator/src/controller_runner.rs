//! Controller runner - builds one controller future per provider kind
//!
//! All seven kinds share one [`Context`]: the cluster operations, HTTP
//! client, clusterctl config and failure counters are process-wide.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use capi_operator_common::crd::{
    AddonProvider, BootstrapProvider, ControlPlaneProvider, CoreProvider, GenericProvider,
    IPAMProvider, InfrastructureProvider, RuntimeExtensionProvider,
};
use capi_operator_provider::{error_policy, reconcile, Context};
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the controllers of every provider kind, core first
pub fn build_provider_controllers(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    vec![
        provider_controller::<CoreProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<BootstrapProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<ControlPlaneProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<InfrastructureProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<AddonProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<IPAMProvider>(client.clone(), ctx.clone(), concurrency),
        provider_controller::<RuntimeExtensionProvider>(client, ctx, concurrency),
    ]
}

fn provider_controller<P: GenericProvider>(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> ControllerFuture {
    let kind = P::PROVIDER_TYPE.kind();
    let providers: Api<P> = Api::all(client);

    tracing::info!("- {} controller", kind);

    Box::pin(
        Controller::new(
            providers,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::<P>, error_policy::<P>, ctx)
        .for_each(log_reconcile_result(kind)),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
