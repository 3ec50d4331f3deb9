//! Provider-type registry
//!
//! Maps each provider category to its CRD, list function and clusterctl
//! naming. Populated once at startup before any controller watches, then
//! only read. Code that must handle every kind (cross-provider preflight,
//! the secret propagator, CRD installation) iterates the registry instead of
//! naming the seven Rust types.

use std::sync::OnceLock;

use capi_operator_common::crd::{
    AddonProvider, BootstrapProvider, ControlPlaneProvider, CoreProvider, GenericProvider,
    IPAMProvider, InfrastructureProvider, ProviderObject, ProviderType, RuntimeExtensionProvider,
    ALL_PROVIDER_TYPES, PROVIDER_GROUP, PROVIDER_VERSION,
};
use capi_operator_common::Error;
use futures::future::BoxFuture;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, CustomResourceExt};
use tracing::info;

/// Lists every object of one kind, kind-erased
pub type ListFn = fn(Client) -> BoxFuture<'static, Result<Vec<ProviderObject>, Error>>;

/// Generates the CRD of one kind
pub type CrdFn = fn() -> CustomResourceDefinition;

/// Everything known about one provider category
pub struct ProviderTypeInfo {
    /// Category
    pub provider_type: ProviderType,
    /// clusterctl type string
    pub clusterctl_type: &'static str,
    /// Component name prefix
    pub prefix: &'static str,
    list: ListFn,
    crd: CrdFn,
}

impl ProviderTypeInfo {
    /// Dynamic API resource for the kind
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: PROVIDER_GROUP.to_string(),
            version: PROVIDER_VERSION.to_string(),
            api_version: format!("{}/{}", PROVIDER_GROUP, PROVIDER_VERSION),
            kind: self.provider_type.kind().to_string(),
            plural: self.provider_type.plural().to_string(),
        }
    }

    /// List all providers of this kind across namespaces
    pub async fn list(&self, client: Client) -> Result<Vec<ProviderObject>, Error> {
        (self.list)(client).await
    }

    /// The kind's CRD
    pub fn crd(&self) -> CustomResourceDefinition {
        (self.crd)()
    }
}

fn list_kind<P: GenericProvider>(client: Client) -> BoxFuture<'static, Result<Vec<ProviderObject>, Error>> {
    Box::pin(async move {
        let api: Api<P> = Api::all(client);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(GenericProvider::to_object).collect())
    })
}

fn info<P: GenericProvider + CustomResourceExt>() -> ProviderTypeInfo {
    ProviderTypeInfo {
        provider_type: P::PROVIDER_TYPE,
        clusterctl_type: P::PROVIDER_TYPE.clusterctl_type(),
        prefix: P::PROVIDER_TYPE.prefix(),
        list: list_kind::<P>,
        crd: P::crd,
    }
}

/// The registry
pub struct ProviderRegistry {
    types: Vec<ProviderTypeInfo>,
}

impl ProviderRegistry {
    fn new() -> Self {
        Self {
            types: vec![
                info::<CoreProvider>(),
                info::<BootstrapProvider>(),
                info::<ControlPlaneProvider>(),
                info::<InfrastructureProvider>(),
                info::<AddonProvider>(),
                info::<IPAMProvider>(),
                info::<RuntimeExtensionProvider>(),
            ],
        }
    }

    /// Info for a category
    pub fn get(&self, provider_type: ProviderType) -> Option<&ProviderTypeInfo> {
        self.types.iter().find(|t| t.provider_type == provider_type)
    }

    /// Info for a kind name, e.g. `InfrastructureProvider`
    pub fn by_kind(&self, kind: &str) -> Option<&ProviderTypeInfo> {
        self.types.iter().find(|t| t.provider_type.kind() == kind)
    }

    /// All categories, core first
    pub fn iter(&self) -> impl Iterator<Item = &ProviderTypeInfo> {
        self.types.iter()
    }

    /// CRDs of every kind
    pub fn crds(&self) -> Vec<CustomResourceDefinition> {
        self.types.iter().map(ProviderTypeInfo::crd).collect()
    }
}

static REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

/// Populate the registry. Idempotent; call before starting controllers.
pub fn init_registry() -> &'static ProviderRegistry {
    REGISTRY.get_or_init(|| {
        let registry = ProviderRegistry::new();
        info!(kinds = registry.types.len(), "provider type registry initialized");
        registry
    })
}

/// The registry, failing if [`init_registry`] has not run
pub fn registry() -> Result<&'static ProviderRegistry, Error> {
    REGISTRY.get().ok_or_else(|| {
        Error::internal_with_context("registry", "provider type registry used before initialization")
    })
}

/// Every registered category, core first
pub fn registered_types() -> Vec<ProviderType> {
    match REGISTRY.get() {
        Some(registry) => registry.iter().map(|t| t.provider_type).collect(),
        None => ALL_PROVIDER_TYPES.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_every_category_in_order() {
        let registry = init_registry();
        let types: Vec<_> = registry.iter().map(|t| t.provider_type).collect();
        assert_eq!(types, ALL_PROVIDER_TYPES);
        assert!(super::registry().is_ok());
        assert_eq!(registered_types(), ALL_PROVIDER_TYPES);
    }

    #[test]
    fn naming_matches_clusterctl() {
        let registry = init_registry();
        let infra = registry.get(ProviderType::Infrastructure).unwrap();
        assert_eq!(infra.prefix, "infrastructure-");
        assert_eq!(infra.clusterctl_type, "InfrastructureProvider");
        assert_eq!(registry.get(ProviderType::Core).unwrap().prefix, "");
        assert_eq!(
            registry.get(ProviderType::RuntimeExtension).unwrap().prefix,
            "runtime-extension-"
        );
    }

    #[test]
    fn api_resources_and_crds_agree() {
        let registry = init_registry();
        for info in registry.iter() {
            let ar = info.api_resource();
            let crd = info.crd();
            assert_eq!(ar.kind, crd.spec.names.kind);
            assert_eq!(ar.plural, crd.spec.names.plural);
            assert_eq!(ar.group, crd.spec.group);
        }
        assert_eq!(registry.crds().len(), 7);
        assert!(registry.by_kind("IPAMProvider").is_some());
        assert!(registry.by_kind("Provider").is_none());
    }
}
