//! Kubernetes operations used by the reconciler
//!
//! [`ClusterOps`] is the single seam between the pipeline and the API
//! server. Provider objects are addressed kind-erased through the registry,
//! so one implementation serves all seven provider kinds.

use async_trait::async_trait;
use capi_operator_common::crd::{ProviderObject, ProviderType, PROVIDER_GROUP, PROVIDER_VERSION};
use capi_operator_common::kube_utils::{
    apply_objects_with_discovery, dynamic_api, resolve_resource, run_discovery, ApplyOptions,
    ResourceScopes,
};
use capi_operator_common::{Error, FIELD_MANAGER};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::verbs;
use kube::Client;
use tracing::{debug, trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::components::ObjectKey;
use crate::registry::registry;

/// Kinds never listed when collecting installed objects
const SKIPPED_KINDS: &[&str] = &["Event", "Endpoints", "EndpointSlice", "Lease", "Pod", "ReplicaSet"];

/// Trait abstracting Kubernetes operations for provider reconciliation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// List providers of one kind across all namespaces
    async fn list_providers(
        &self,
        provider_type: ProviderType,
    ) -> Result<Vec<ProviderObject>, Error>;

    /// Get a Secret, `None` if missing
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Get a ConfigMap, `None` if missing
    async fn get_configmap(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// List ConfigMaps in a namespace matching a label selector
    async fn list_configmaps(&self, namespace: &str, selector: &str)
        -> Result<Vec<ConfigMap>, Error>;

    /// Server-side apply a ConfigMap
    async fn apply_configmap(&self, configmap: &ConfigMap) -> Result<(), Error>;

    /// Server-side apply arbitrary objects (CRDs, then namespaces, then the rest)
    async fn apply_objects(&self, objects: &[serde_json::Value]) -> Result<(), Error>;

    /// Identities of every object matching a label selector, across all listable kinds
    async fn list_managed_objects(&self, selector: &str) -> Result<Vec<ObjectKey>, Error>;

    /// Scope of every kind the API server serves
    async fn resource_scopes(&self) -> Result<ResourceScopes, Error>;

    /// Delete objects; already-gone objects are fine
    async fn delete_objects(&self, keys: &[ObjectKey]) -> Result<(), Error>;

    /// Get a Deployment, `None` if missing
    async fn get_deployment(&self, name: &str, namespace: &str)
        -> Result<Option<Deployment>, Error>;

    /// Write a provider's status with server-side apply
    async fn patch_provider_status(&self, provider: &ProviderObject) -> Result<(), Error>;

    /// Add a finalizer to a provider
    async fn add_finalizer(&self, provider: &ProviderObject, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a provider
    async fn remove_finalizer(&self, provider: &ProviderObject, finalizer: &str)
        -> Result<(), Error>;

    /// Set an annotation on a provider
    async fn set_annotation(
        &self,
        provider: &ProviderObject,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Delete a provider object
    async fn delete_provider(&self, provider: &ProviderObject) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterOps {
    client: Client,
}

impl KubeClusterOps {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn provider_api(&self, provider: &ProviderObject) -> Result<Api<DynamicObject>, Error> {
        let info = registry()?.get(provider.provider_type).ok_or_else(|| {
            Error::internal_with_context(
                "client",
                format!("unregistered provider type {}", provider.provider_type),
            )
        })?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            provider.namespace(),
            &info.api_resource(),
        ))
    }

    async fn patch_finalizers(
        &self,
        provider: &ProviderObject,
        update: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), Error> {
        let api = self.provider_api(provider)?;
        let Some(current) = api.get_opt(provider.name()).await? else {
            return Ok(());
        };
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if !update(&mut finalizers) {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(provider.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn list_providers(
        &self,
        provider_type: ProviderType,
    ) -> Result<Vec<ProviderObject>, Error> {
        let info = registry()?.get(provider_type).ok_or_else(|| {
            Error::internal_with_context("client", format!("unregistered provider type {}", provider_type))
        })?;
        info.list(self.client.clone()).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_configmap(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_configmaps(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn apply_configmap(&self, configmap: &ConfigMap) -> Result<(), Error> {
        let name = configmap
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::serialization_for_kind("ConfigMap", "missing metadata.name"))?;
        let namespace = configmap.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(configmap),
        )
        .await?;
        trace!(configmap = %name, namespace = %namespace, "applied ConfigMap");
        Ok(())
    }

    async fn apply_objects(&self, objects: &[serde_json::Value]) -> Result<(), Error> {
        apply_objects_with_discovery(&self.client, objects, &ApplyOptions::new(FIELD_MANAGER)).await
    }

    async fn resource_scopes(&self) -> Result<ResourceScopes, Error> {
        Ok(ResourceScopes::from_discovery(&run_discovery(&self.client).await?))
    }

    async fn list_managed_objects(&self, selector: &str) -> Result<Vec<ObjectKey>, Error> {
        let discovery = run_discovery(&self.client).await?;
        let params = ListParams::default().labels(selector);
        let mut keys = Vec::new();

        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST)
                    || !caps.supports_operation(verbs::DELETE)
                    || SKIPPED_KINDS.contains(&resource.kind.as_str())
                {
                    continue;
                }
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
                match api.list_metadata(&params).await {
                    Ok(list) => {
                        keys.extend(list.items.into_iter().filter_map(|obj| {
                            Some(ObjectKey {
                                api_version: resource.api_version.clone(),
                                kind: resource.kind.clone(),
                                namespace: obj.metadata.namespace,
                                name: obj.metadata.name?,
                            })
                        }));
                    }
                    Err(e) => {
                        debug!(kind = %resource.kind, error = %e, "skipping unlistable kind");
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn delete_objects(&self, keys: &[ObjectKey]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let discovery = run_discovery(&self.client).await?;
        let mut first_error = None;

        for key in keys {
            let Some((resource, namespaced)) =
                resolve_resource(&discovery, &key.api_version, &key.kind)
            else {
                debug!(object = %key, "kind no longer served, nothing to delete");
                continue;
            };
            let api = dynamic_api(&self.client, &resource, namespaced, key.namespace.as_deref());
            match api.delete(&key.name, &DeleteParams::background()).await {
                Ok(_) => trace!(object = %key, "deleted"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    warn!(object = %key, error = %e, "delete failed, continuing");
                    first_error.get_or_insert(Error::install(format!(
                        "failed to delete {}: {}",
                        key, e
                    )));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_provider_status(&self, provider: &ProviderObject) -> Result<(), Error> {
        let api = self.provider_api(provider)?;
        let patch = serde_json::json!({
            "apiVersion": format!("{}/{}", PROVIDER_GROUP, PROVIDER_VERSION),
            "kind": provider.provider_type.kind(),
            "status": provider.status,
        });
        api.patch_status(
            provider.name(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, provider: &ProviderObject, finalizer: &str) -> Result<(), Error> {
        self.patch_finalizers(provider, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(
        &self,
        provider: &ProviderObject,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(provider, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn set_annotation(
        &self,
        provider: &ProviderObject,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let api = self.provider_api(provider)?;
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { key: value }
            }
        });
        api.patch(provider.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_provider(&self, provider: &ProviderObject) -> Result<(), Error> {
        let api = self.provider_api(provider)?;
        match api.delete(provider.name(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
