//! Custom resource definitions for the seven provider kinds

mod provider;
mod types;

pub use provider::{
    AddonProvider, AddonProviderSpec, AdditionalDeployment, BootstrapProvider,
    BootstrapProviderSpec, ConfigMapReference, ContainerSpec, ControlPlaneProvider,
    ControlPlaneProviderSpec, CoreProvider, CoreProviderSpec, DeploymentSpec,
    FetchConfiguration, GenericProvider, IPAMProvider, IPAMProviderSpec,
    InfrastructureProvider, InfrastructureProviderSpec, ManagerSpec, ProviderObject,
    ProviderSpec, ProviderStatus, ProviderType, RuntimeExtensionProvider,
    RuntimeExtensionProviderSpec, SecretReference, ALL_PROVIDER_TYPES, CORE_PROVIDER_NAME,
    PROVIDER_GROUP, PROVIDER_VERSION,
};
pub use types::{
    get_condition, is_condition_true, reasons, set_condition, Condition, ConditionSeverity,
    ConditionStatus, PREFLIGHT_CHECK_CONDITION, PROVIDER_INSTALLED_CONDITION,
    PROVIDER_UPGRADED_CONDITION, READY_CONDITION,
};
