//! CRD installation utilities
//!
//! The operator installs the CRDs of the seven provider kinds on startup
//! using server-side apply, so the CRD versions always match the operator.

use capi_operator_common::FIELD_MANAGER;
use capi_operator_provider::ProviderRegistry;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

/// Ensure the CRDs of every registered provider kind are installed
pub async fn ensure_crds_installed(client: &Client, registry: &ProviderRegistry) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in registry.crds() {
        let name = crd.name_any();
        tracing::info!("Installing {} CRD...", name);
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("Provider CRDs installed/updated");
    Ok(())
}

/// Every provider CRD as a multi-document YAML stream
pub fn render_crds(registry: &ProviderRegistry) -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for crd in registry.crds() {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD {}: {}", crd.name_any(), e))?;
        docs.push(yaml);
    }
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capi_operator_provider::init_registry;

    #[test]
    fn renders_every_kind() {
        let yaml = render_crds(init_registry()).unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 7);
        assert_eq!(yaml.matches("---\n").count(), 6);
        assert!(yaml.contains("name: coreproviders.operator.cluster.x-k8s.io"));
        assert!(yaml.contains("name: runtimeextensionproviders.operator.cluster.x-k8s.io"));
    }
}
