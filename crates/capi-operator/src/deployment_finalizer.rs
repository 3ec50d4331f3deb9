//! Operator-deployment finalizer
//!
//! Holds the operator's own Deployment while provider CRs still exist, so
//! that uninstalling the operator first tears the providers down through
//! their normal deletion path. Each provider CR carrying the provider
//! finalizer is asked to delete; the Deployment is released once none remain
//! and this replica is the last one standing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capi_operator_common::crd::ProviderObject;
use capi_operator_common::{Error, PROVIDER_FINALIZER};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::store::ProviderStore;

/// Recheck interval while providers are being torn down
pub const CLEANUP_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue after a failed cleanup reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Operations on the operator's own Deployment
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentOps: Send + Sync {
    /// Add or remove the provider finalizer on the Deployment
    async fn set_finalizer(&self, deployment: &Deployment, present: bool) -> Result<(), Error>;

    /// Names of the Deployment's pods that are not terminating
    async fn active_replicas(&self, deployment: &Deployment) -> Result<Vec<String>, Error>;
}

/// [`DeploymentOps`] against the API server
pub struct KubeDeploymentOps {
    client: Client,
}

impl KubeDeploymentOps {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentOps for KubeDeploymentOps {
    async fn set_finalizer(&self, deployment: &Deployment, present: bool) -> Result<(), Error> {
        let namespace = deployment.namespace().unwrap_or_default();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let finalizers = with_finalizer(deployment.finalizers(), present);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            &deployment.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn active_replicas(&self, deployment: &Deployment) -> Result<Vec<String>, Error> {
        let namespace = deployment.namespace().unwrap_or_default();
        let labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector(&labels)))
            .await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .map(ResourceExt::name_any)
            .collect())
    }
}

/// Finalizer list with [`PROVIDER_FINALIZER`] present or absent
pub fn with_finalizer(current: &[String], present: bool) -> Vec<String> {
    let mut finalizers: Vec<String> = current
        .iter()
        .filter(|f| f.as_str() != PROVIDER_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(PROVIDER_FINALIZER.to_string());
    }
    finalizers
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether this replica may drop the Deployment's finalizer.
///
/// Among replicas not being deleted, the one with the smallest pod name
/// releases. With no pod identity, or no other live replica, this one does.
pub fn should_release(own_pod: Option<&str>, active: &[String]) -> bool {
    let Some(own) = own_pod else {
        return true;
    };
    match active.iter().filter(|p| p.as_str() != own).min() {
        Some(other) => own < other.as_str() && active.iter().any(|p| p == own),
        None => true,
    }
}

/// Context for the deployment finalizer controller
pub struct FinalizerContext {
    /// Provider CR access
    pub store: Arc<dyn ProviderStore>,
    /// Deployment access
    pub deployments: Arc<dyn DeploymentOps>,
    /// This replica's pod name
    pub pod_name: Option<String>,
}

/// Reconcile the operator Deployment
#[instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(deployment: Arc<Deployment>, ctx: Arc<FinalizerContext>) -> Result<Action, Error> {
    let holds = deployment.finalizers().iter().any(|f| f == PROVIDER_FINALIZER);

    if deployment.metadata.deletion_timestamp.is_none() {
        if !holds {
            info!("adding finalizer to operator deployment");
            ctx.deployments.set_finalizer(&deployment, true).await?;
        }
        return Ok(Action::await_change());
    }

    if !holds {
        return Ok(Action::await_change());
    }

    let remaining = delete_remaining(ctx.store.as_ref()).await?;
    if remaining > 0 {
        info!(remaining, "waiting for provider CRs to be deleted");
        return Ok(Action::requeue(CLEANUP_REQUEUE));
    }

    let active = ctx.deployments.active_replicas(&deployment).await?;
    if !should_release(ctx.pod_name.as_deref(), &active) {
        debug!(replicas = active.len(), "another replica will release the operator deployment");
        return Ok(Action::requeue(CLEANUP_REQUEUE));
    }

    info!("all provider CRs gone, releasing operator deployment");
    ctx.deployments.set_finalizer(&deployment, false).await?;
    Ok(Action::await_change())
}

/// Ask every provider holding the provider finalizer to delete.
///
/// Returns how many such providers still exist.
pub async fn delete_remaining(store: &dyn ProviderStore) -> Result<usize, Error> {
    let remaining: Vec<ProviderObject> = store
        .list_all()
        .await?
        .into_iter()
        .filter(|p| p.has_finalizer(PROVIDER_FINALIZER))
        .collect();
    for provider in remaining.iter().filter(|p| !p.is_deleting()) {
        info!(provider = %provider.key(), kind = %provider.provider_type, "deleting provider before operator removal");
        store.delete_provider(provider).await?;
    }
    Ok(remaining.len())
}

/// Requeue on failure
pub fn error_policy(_deployment: Arc<Deployment>, error: &Error, _ctx: Arc<FinalizerContext>) -> Action {
    warn!(error = %error, "operator deployment cleanup failed");
    Action::requeue(ERROR_REQUEUE)
}

/// Controller future watching the operator's own Deployment
pub fn build_deployment_finalizer(
    client: Client,
    namespace: &str,
    name: &str,
    ctx: Arc<FinalizerContext>,
) -> impl std::future::Future<Output = ()> + Send {
    let deployments: Api<Deployment> = Api::namespaced(client, namespace);
    Controller::new(
        deployments,
        WatcherConfig::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(25),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        if let Err(e) = result {
            warn!(error = ?e, "operator deployment reconciliation error");
        }
        std::future::ready(())
    })
}
