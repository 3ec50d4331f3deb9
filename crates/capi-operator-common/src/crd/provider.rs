//! Provider custom resources
//!
//! Seven kinds share one spec and one status shape. Each kind is a separate
//! CRD so RBAC and `kubectl get` work per category; code that does not care
//! about the category goes through [`GenericProvider`] or the kind-erased
//! [`ProviderObject`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::NamespaceResourceScope;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, Condition, READY_CONDITION};

/// API group of all provider kinds
pub const PROVIDER_GROUP: &str = "operator.cluster.x-k8s.io";
/// API version of all provider kinds
pub const PROVIDER_VERSION: &str = "v1alpha2";
/// Name the core provider must carry
pub const CORE_PROVIDER_NAME: &str = "cluster-api";

// =============================================================================
// Provider type
// =============================================================================

/// The provider categories, matching clusterctl's provider type enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderType {
    /// Cluster API core controllers
    Core,
    /// Bootstrap providers (kubeadm, talos, ...)
    Bootstrap,
    /// Control plane providers
    ControlPlane,
    /// Infrastructure providers (aws, azure, docker, ...)
    Infrastructure,
    /// Addon providers (helm, ...)
    Addon,
    /// IP address management providers
    Ipam,
    /// Runtime extension providers
    RuntimeExtension,
}

/// All provider types, core first.
pub const ALL_PROVIDER_TYPES: &[ProviderType] = &[
    ProviderType::Core,
    ProviderType::Bootstrap,
    ProviderType::ControlPlane,
    ProviderType::Infrastructure,
    ProviderType::Addon,
    ProviderType::Ipam,
    ProviderType::RuntimeExtension,
];

impl ProviderType {
    /// CRD kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Core => "CoreProvider",
            Self::Bootstrap => "BootstrapProvider",
            Self::ControlPlane => "ControlPlaneProvider",
            Self::Infrastructure => "InfrastructureProvider",
            Self::Addon => "AddonProvider",
            Self::Ipam => "IPAMProvider",
            Self::RuntimeExtension => "RuntimeExtensionProvider",
        }
    }

    /// CRD plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Core => "coreproviders",
            Self::Bootstrap => "bootstrapproviders",
            Self::ControlPlane => "controlplaneproviders",
            Self::Infrastructure => "infrastructureproviders",
            Self::Addon => "addonproviders",
            Self::Ipam => "ipamproviders",
            Self::RuntimeExtension => "runtimeextensionproviders",
        }
    }

    /// clusterctl provider type string, as used in clusterctl.yaml
    pub fn clusterctl_type(&self) -> &'static str {
        self.kind()
    }

    /// Short type slug used in labels and file names
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Bootstrap => "bootstrap",
            Self::ControlPlane => "control-plane",
            Self::Infrastructure => "infrastructure",
            Self::Addon => "addon",
            Self::Ipam => "ipam",
            Self::RuntimeExtension => "runtime-extension",
        }
    }

    /// Prefix of the clusterctl component name
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Core => "",
            Self::Bootstrap => "bootstrap-",
            Self::ControlPlane => "control-plane-",
            Self::Infrastructure => "infrastructure-",
            Self::Addon => "addon-",
            Self::Ipam => "ipam-",
            Self::RuntimeExtension => "runtime-extension-",
        }
    }

    /// Default components file name in a release
    pub fn components_file(&self) -> String {
        format!("{}-components.yaml", self.slug())
    }

    /// clusterctl component name for a provider of this type, e.g. `infrastructure-aws`
    pub fn component_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Parse a clusterctl type string (`InfrastructureProvider`) or slug (`infrastructure`)
    pub fn parse(value: &str) -> Option<Self> {
        ALL_PROVIDER_TYPES
            .iter()
            .copied()
            .find(|t| t.clusterctl_type().eq_ignore_ascii_case(value) || t.slug() == value)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Where the provider's release artifacts come from.
///
/// At most one field may be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfiguration {
    /// Release URL, e.g. `https://github.com/kubernetes-sigs/cluster-api-provider-aws/releases/latest/infrastructure-components.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// OCI artifact reference, e.g. `ghcr.io/org/provider:v1.0.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<String>,

    /// Selector over ConfigMaps holding one version each
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl FetchConfiguration {
    /// Number of populated alternatives
    pub fn populated(&self) -> usize {
        [self.url.is_some(), self.oci.is_some(), self.selector.is_some()]
            .iter()
            .filter(|set| **set)
            .count()
    }
}

/// Reference to a Secret holding variables and credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace, defaults to the provider namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to a ConfigMap with extra manifests under the `manifests` key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapReference {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace, defaults to the provider namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Per-container overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name to customize
    pub name: String,

    /// Full image reference, or `:tag` to only replace the tag
    #[serde(default, rename = "imageURL", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Flags merged into the container args as `--key=value`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,

    /// Environment variables merged by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Replacement entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// Deployment-level overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Container overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerSpec>,

    /// Service account for the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Pull secrets for the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// Controller-manager settings rendered as flags on the `manager` container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSpec {
    /// Feature gates, rendered as `--feature-gates=A=true,B=false`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,

    /// Log verbosity (`--v`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<i32>,

    /// Resync period, e.g. `10m` (`--sync-period`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_period: Option<String>,

    /// Worker count (`--concurrency`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_reconciles: Option<i32>,

    /// pprof listen address (`--profiler-address`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiler_address: Option<String>,

    /// Health endpoint address (`--health-addr`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_addr: Option<String>,

    /// Metrics listen address (`--metrics-bind-addr`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_bind_addr: Option<String>,

    /// Leader election toggle (`--leader-elect`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_elect: Option<bool>,
}

/// Overrides for a deployment other than the provider's manager
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AdditionalDeployment {
    /// Deployment overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSpec>,
    /// Manager flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerSpec>,
}

/// Desired state shared by every provider kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Desired version; empty means latest available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Artifact source; may be omitted for predefined providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_config: Option<FetchConfiguration>,

    /// Secret with template variables and credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret: Option<SecretReference>,

    /// Extra manifests appended to the components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_manifests: Option<ConfigMapReference>,

    /// RFC 7396 merge patches applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_patches: Vec<String>,

    /// Overrides for the provider's manager deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSpec>,

    /// Manager flags for the provider's manager deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerSpec>,

    /// Overrides for other deployments, keyed by deployment name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_deployments: BTreeMap<String, AdditionalDeployment>,
}

impl ProviderSpec {
    /// `spec.version` with empty strings treated as unset
    pub fn desired_version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.is_empty())
    }
}

/// Observed state shared by every provider kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Contract declared by the installed version's metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,

    /// Conditions, Ready first
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation this status corresponds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Version currently installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
}

// =============================================================================
// Kinds
// =============================================================================

macro_rules! provider_kind {
    ($(#[$doc:meta])* $spec:ident => $kind:ident, $kind_str:tt, $plural:tt, $short:tt, $ptype:expr) => {
        $(#[$doc])*
        #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
        #[kube(
            group = "operator.cluster.x-k8s.io",
            version = "v1alpha2",
            kind = $kind_str,
            plural = $plural,
            shortname = $short,
            status = "ProviderStatus",
            namespaced,
            printcolumn = r#"{"name":"InstalledVersion","type":"string","jsonPath":".status.installedVersion"}"#,
            printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#
        )]
        pub struct $spec {
            /// Shared provider settings
            #[serde(flatten)]
            pub provider: ProviderSpec,
        }

        impl GenericProvider for $kind {
            const PROVIDER_TYPE: ProviderType = $ptype;

            fn provider_spec(&self) -> &ProviderSpec {
                &self.spec.provider
            }

            fn provider_spec_mut(&mut self) -> &mut ProviderSpec {
                &mut self.spec.provider
            }

            fn provider_status(&self) -> Option<&ProviderStatus> {
                self.status.as_ref()
            }

            fn provider_status_mut(&mut self) -> &mut ProviderStatus {
                self.status.get_or_insert_with(ProviderStatus::default)
            }
        }
    };
}

provider_kind!(
    /// Cluster API core provider (singleton, named `cluster-api`)
    CoreProviderSpec => CoreProvider, "CoreProvider", "coreproviders", "cop", ProviderType::Core
);
provider_kind!(
    /// Bootstrap provider
    BootstrapProviderSpec => BootstrapProvider, "BootstrapProvider", "bootstrapproviders", "bp", ProviderType::Bootstrap
);
provider_kind!(
    /// Control plane provider
    ControlPlaneProviderSpec => ControlPlaneProvider, "ControlPlaneProvider", "controlplaneproviders", "cpp", ProviderType::ControlPlane
);
provider_kind!(
    /// Infrastructure provider
    InfrastructureProviderSpec => InfrastructureProvider, "InfrastructureProvider", "infrastructureproviders", "ip", ProviderType::Infrastructure
);
provider_kind!(
    /// Addon provider
    AddonProviderSpec => AddonProvider, "AddonProvider", "addonproviders", "ap", ProviderType::Addon
);
provider_kind!(
    /// IPAM provider
    IPAMProviderSpec => IPAMProvider, "IPAMProvider", "ipamproviders", "ipamp", ProviderType::Ipam
);
provider_kind!(
    /// Runtime extension provider
    RuntimeExtensionProviderSpec => RuntimeExtensionProvider, "RuntimeExtensionProvider", "runtimeextensionproviders", "rep", ProviderType::RuntimeExtension
);

// =============================================================================
// Generic access
// =============================================================================

/// Capability set implemented by every provider kind.
pub trait GenericProvider:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Category of this kind
    const PROVIDER_TYPE: ProviderType;

    /// Shared spec
    fn provider_spec(&self) -> &ProviderSpec;

    /// Shared spec, mutable
    fn provider_spec_mut(&mut self) -> &mut ProviderSpec;

    /// Status, if any has been written
    fn provider_status(&self) -> Option<&ProviderStatus>;

    /// Status, created empty when missing
    fn provider_status_mut(&mut self) -> &mut ProviderStatus;

    /// Conditions, empty when no status exists
    fn conditions(&self) -> &[Condition] {
        self.provider_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the conditions
    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.provider_status_mut().conditions = conditions;
    }

    /// Kind-erased snapshot
    fn to_object(&self) -> ProviderObject {
        ProviderObject {
            provider_type: Self::PROVIDER_TYPE,
            metadata: self.meta().clone(),
            spec: self.provider_spec().clone(),
            status: self.provider_status().cloned().unwrap_or_default(),
        }
    }
}

/// A provider of any kind, detached from its concrete type.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderObject {
    /// Category
    pub provider_type: ProviderType,
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Shared spec
    pub spec: ProviderSpec,
    /// Shared status
    pub status: ProviderStatus,
}

impl ProviderObject {
    /// Create a provider with the given identity and spec (status empty)
    pub fn new(
        provider_type: ProviderType,
        name: impl Into<String>,
        namespace: impl Into<String>,
        spec: ProviderSpec,
    ) -> Self {
        Self {
            provider_type,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
            status: ProviderStatus::default(),
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// clusterctl component name, e.g. `infrastructure-aws`
    pub fn component_name(&self) -> String {
        self.provider_type.component_name(self.name())
    }

    /// Whether Ready=True
    pub fn is_ready(&self) -> bool {
        is_condition_true(&self.status.conditions, READY_CONDITION)
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// `status.installedVersion` with empty strings treated as unset
    pub fn installed_version(&self) -> Option<&str> {
        self.status
            .installed_version
            .as_deref()
            .filter(|v| !v.is_empty())
    }

    /// `name/namespace` for logs and messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Owner reference pointing at this provider
    pub fn owner_reference(
        &self,
    ) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
        Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: format!("{}/{}", PROVIDER_GROUP, PROVIDER_VERSION),
            kind: self.provider_type.kind().to_string(),
            name: self.metadata.name.clone()?,
            uid: self.metadata.uid.clone()?,
            controller: Some(true),
            block_owner_deletion: Some(false),
        })
    }
}
