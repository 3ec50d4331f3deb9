//! Predefined provider catalog
//!
//! Providers listed here may omit `spec.fetchConfig`; their release URL is
//! taken from the catalog. The `providers:` section of the clusterctl config
//! adds entries or replaces built-in ones with the same name and type.

use std::collections::BTreeMap;

use capi_operator_common::crd::ProviderType;
use serde::Deserialize;

/// One known provider
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Provider name, e.g. `aws`
    pub name: String,
    /// Release URL
    pub url: String,
    /// Provider category
    #[serde(rename = "type", deserialize_with = "deserialize_provider_type")]
    pub provider_type: ProviderType,
}

fn deserialize_provider_type<'de, D>(deserializer: D) -> Result<ProviderType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    ProviderType::parse(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown provider type {:?}", raw)))
}

const GITHUB: &str = "https://github.com";

const BUILTIN: &[(ProviderType, &str, &str)] = &[
    (ProviderType::Core, "cluster-api", "kubernetes-sigs/cluster-api/releases/latest/core-components.yaml"),
    (ProviderType::Bootstrap, "kubeadm", "kubernetes-sigs/cluster-api/releases/latest/bootstrap-components.yaml"),
    (ProviderType::Bootstrap, "talos", "siderolabs/cluster-api-bootstrap-provider-talos/releases/latest/bootstrap-components.yaml"),
    (ProviderType::Bootstrap, "microk8s", "canonical/cluster-api-bootstrap-provider-microk8s/releases/latest/bootstrap-components.yaml"),
    (ProviderType::Bootstrap, "k0smotron", "k0sproject/k0smotron/releases/latest/bootstrap-components.yaml"),
    (ProviderType::Bootstrap, "rke2", "rancher/cluster-api-provider-rke2/releases/latest/bootstrap-components.yaml"),
    (ProviderType::ControlPlane, "kubeadm", "kubernetes-sigs/cluster-api/releases/latest/control-plane-components.yaml"),
    (ProviderType::ControlPlane, "talos", "siderolabs/cluster-api-control-plane-provider-talos/releases/latest/control-plane-components.yaml"),
    (ProviderType::ControlPlane, "microk8s", "canonical/cluster-api-control-plane-provider-microk8s/releases/latest/control-plane-components.yaml"),
    (ProviderType::ControlPlane, "k0smotron", "k0sproject/k0smotron/releases/latest/control-plane-components.yaml"),
    (ProviderType::ControlPlane, "rke2", "rancher/cluster-api-provider-rke2/releases/latest/control-plane-components.yaml"),
    (ProviderType::Infrastructure, "aws", "kubernetes-sigs/cluster-api-provider-aws/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "azure", "kubernetes-sigs/cluster-api-provider-azure/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "gcp", "kubernetes-sigs/cluster-api-provider-gcp/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "vsphere", "kubernetes-sigs/cluster-api-provider-vsphere/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "openstack", "kubernetes-sigs/cluster-api-provider-openstack/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "docker", "kubernetes-sigs/cluster-api/releases/latest/infrastructure-components-development.yaml"),
    (ProviderType::Infrastructure, "metal3", "metal3-io/cluster-api-provider-metal3/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "hetzner", "syself/cluster-api-provider-hetzner/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "proxmox", "ionos-cloud/cluster-api-provider-proxmox/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "digitalocean", "kubernetes-sigs/cluster-api-provider-digitalocean/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "ibmcloud", "kubernetes-sigs/cluster-api-provider-ibmcloud/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "kubevirt", "kubernetes-sigs/cluster-api-provider-kubevirt/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Infrastructure, "k0smotron", "k0sproject/k0smotron/releases/latest/infrastructure-components.yaml"),
    (ProviderType::Addon, "helm", "kubernetes-sigs/cluster-api-addon-provider-helm/releases/latest/addon-components.yaml"),
    (ProviderType::Ipam, "in-cluster", "kubernetes-sigs/cluster-api-ipam-provider-in-cluster/releases/latest/ipam-components.yaml"),
];

/// Catalog keyed by (type, name)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderCatalog {
    entries: BTreeMap<(ProviderType, String), CatalogEntry>,
}

impl ProviderCatalog {
    /// The bundled catalog
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|(provider_type, name, path)| {
                (
                    (*provider_type, name.to_string()),
                    CatalogEntry {
                        name: name.to_string(),
                        url: format!("{}/{}", GITHUB, path),
                        provider_type: *provider_type,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Add entries, replacing any with the same type and name
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = CatalogEntry>) -> Self {
        for entry in overrides {
            self.entries
                .insert((entry.provider_type, entry.name.clone()), entry);
        }
        self
    }

    /// Entry for a provider, if predefined
    pub fn lookup(&self, provider_type: ProviderType, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(&(provider_type, name.to_string()))
    }

    /// Whether a provider is predefined
    pub fn is_predefined(&self, provider_type: ProviderType, name: &str) -> bool {
        self.lookup(provider_type, name).is_some()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_knows_core_and_aws() {
        let catalog = ProviderCatalog::builtin();
        let core = catalog.lookup(ProviderType::Core, "cluster-api").unwrap();
        assert!(core.url.ends_with("/cluster-api/releases/latest/core-components.yaml"));
        assert!(catalog.is_predefined(ProviderType::Infrastructure, "aws"));
        assert!(!catalog.is_predefined(ProviderType::Infrastructure, "my-custom-aws"));
        // names are per type
        assert!(!catalog.is_predefined(ProviderType::Bootstrap, "aws"));
    }

    #[test]
    fn overrides_replace_and_extend() {
        let catalog = ProviderCatalog::builtin().with_overrides(vec![
            CatalogEntry {
                name: "aws".to_string(),
                url: "https://mirror.local/aws/releases/latest/infrastructure-components.yaml"
                    .to_string(),
                provider_type: ProviderType::Infrastructure,
            },
            CatalogEntry {
                name: "my-infra".to_string(),
                url: "https://github.com/me/my-infra/releases/latest/infrastructure-components.yaml"
                    .to_string(),
                provider_type: ProviderType::Infrastructure,
            },
        ]);
        let builtin_len = ProviderCatalog::builtin().len();
        assert_eq!(catalog.len(), builtin_len + 1);
        assert!(catalog
            .lookup(ProviderType::Infrastructure, "aws")
            .unwrap()
            .url
            .starts_with("https://mirror.local"));
        assert!(catalog.is_predefined(ProviderType::Infrastructure, "my-infra"));
    }

    #[test]
    fn entries_deserialize_from_clusterctl_shape() {
        let entry: CatalogEntry = serde_json::from_value(serde_json::json!({
            "name": "in-cluster",
            "url": "https://github.com/x/y/releases/latest/ipam-components.yaml",
            "type": "IPAMProvider"
        }))
        .unwrap();
        assert_eq!(entry.provider_type, ProviderType::Ipam);

        let bad = serde_json::from_value::<CatalogEntry>(serde_json::json!({
            "name": "x", "url": "y", "type": "Banana"
        }));
        assert!(bad.is_err());
    }
}
