//! Applying, upgrading and removing a provider's objects
//!
//! Objects are written with server-side apply under the operator's field
//! owner, so replaying an install is idempotent. Installed objects are found
//! again through the managed-by and provider labels; CRDs and Namespaces are
//! never deleted because other providers and user workloads depend on them.

use std::time::Duration;

use capi_operator_common::kube_utils::{is_deployment_ready, poll_with_backoff};
use capi_operator_common::retry::RetryConfig;
use capi_operator_common::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ClusterOps;
use crate::components::{managed_selector, ManifestObject, ObjectKey};

/// Kinds left in place on upgrade and delete
pub const PRESERVED_KINDS: &[&str] = &["CustomResourceDefinition", "Namespace"];

/// Message of a readiness wait that ran out of time
pub const READINESS_TIMEOUT_MESSAGE: &str = "Timed out waiting for deployment to become ready";

/// Whether an object survives upgrade and delete
pub fn is_preserved(key: &ObjectKey) -> bool {
    PRESERVED_KINDS.contains(&key.kind.as_str())
}

/// Installed objects the new version no longer ships
pub fn stale_objects(installed: &[ObjectKey], desired: &[ObjectKey]) -> Vec<ObjectKey> {
    installed
        .iter()
        .filter(|old| !is_preserved(old))
        .filter(|old| !desired.iter().any(|new| new.same_object(old)))
        .cloned()
        .collect()
}

/// Default readiness polling: 1s doubling to 10s
pub fn readiness_poll() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
    }
}

/// Writes a component's objects to the cluster
pub struct Installer<'a> {
    ops: &'a dyn ClusterOps,
    ready_timeout: Duration,
    poll: RetryConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Installer<'a> {
    /// Installer waiting up to `ready_timeout` for deployments
    pub fn new(ops: &'a dyn ClusterOps, ready_timeout: Duration, cancel: &'a CancellationToken) -> Self {
        Self {
            ops,
            ready_timeout,
            poll: readiness_poll(),
            cancel,
        }
    }

    /// Override the readiness polling backoff
    pub fn with_poll(mut self, poll: RetryConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Apply every object, then wait for the Deployments among them
    pub async fn install(&self, objects: &[ManifestObject]) -> Result<(), Error> {
        let values: Vec<serde_json::Value> = objects.iter().map(|o| o.value().clone()).collect();
        self.ops.apply_objects(&values).await?;
        debug!(objects = values.len(), "components applied");

        for deployment in objects.iter().filter(|o| o.kind() == "Deployment") {
            let namespace = deployment.namespace().unwrap_or("default");
            self.wait_for_deployment(deployment.name(), namespace).await?;
        }
        Ok(())
    }

    /// Wait until a Deployment reports Available with all replicas updated.
    ///
    /// Cancellation ends the wait as a timeout.
    pub async fn wait_for_deployment(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let ops = self.ops;
        let poll = poll_with_backoff(self.ready_timeout, &self.poll, READINESS_TIMEOUT_MESSAGE, || async move {
            Ok(ops
                .get_deployment(name, namespace)
                .await?
                .is_some_and(|d| is_deployment_ready(&d)))
        });
        tokio::select! {
            result = poll => result,
            _ = self.cancel.cancelled() => Err(Error::timeout(format!(
                "{}: interrupted",
                READINESS_TIMEOUT_MESSAGE
            ))),
        }
    }

    /// Delete installed objects of `component` that `desired` no longer contains
    pub async fn remove_stale(
        &self,
        component: &str,
        desired: &[ManifestObject],
    ) -> Result<Vec<ObjectKey>, Error> {
        let installed = self.ops.list_managed_objects(&managed_selector(component)).await?;
        let desired: Vec<ObjectKey> = desired.iter().map(ManifestObject::key).collect();
        let stale = stale_objects(&installed, &desired);
        if !stale.is_empty() {
            info!(component, count = stale.len(), "removing objects dropped by the new version");
            self.ops.delete_objects(&stale).await?;
        }
        Ok(stale)
    }

    /// Delete everything installed for `component` except preserved kinds
    pub async fn uninstall(&self, component: &str) -> Result<usize, Error> {
        let doomed = self.remaining(component).await?;
        self.ops.delete_objects(&doomed).await?;
        info!(component, count = doomed.len(), "provider components deleted");
        Ok(doomed.len())
    }

    /// Installed objects of `component` an uninstall still has to remove
    pub async fn remaining(&self, component: &str) -> Result<Vec<ObjectKey>, Error> {
        let installed = self.ops.list_managed_objects(&managed_selector(component)).await?;
        Ok(installed.into_iter().filter(|k| !is_preserved(k)).collect())
    }
}
