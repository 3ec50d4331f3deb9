//! Operator-wide configuration
//!
//! Loaded once at startup from the optional clusterctl config file and
//! read-only afterwards. The file contributes catalog overrides
//! (`providers:`) and image override rules (`images:`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use capi_operator_common::{yaml, Error};
use serde::Deserialize;
use tracing::{debug, info};

use crate::catalog::{CatalogEntry, ProviderCatalog};

/// Default location of the clusterctl config
pub const DEFAULT_CLUSTERCTL_CONFIG_PATH: &str = "/config/clusterctl.yaml";

/// Default cap on waiting for provider deployments
pub const DEFAULT_PROVIDER_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Contracts this operator can install
pub const SUPPORTED_CONTRACTS: &[&str] = &["v1beta1", "v1beta2"];

/// Key of the image rule applying to every component
pub const ALL_COMPONENTS: &str = "all";

/// One image override rule
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ImageOverride {
    /// Replacement repository (everything before the image name)
    #[serde(default)]
    pub repository: Option<String>,
    /// Replacement tag
    #[serde(default)]
    pub tag: Option<String>,
}

impl ImageOverride {
    /// Whether the rule changes nothing
    pub fn is_empty(&self) -> bool {
        self.repository.is_none() && self.tag.is_none()
    }
}

/// Raw shape of clusterctl.yaml; unknown keys are ignored
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterctlConfig {
    /// Catalog additions and overrides
    #[serde(default)]
    pub providers: Vec<CatalogEntry>,
    /// Image rules keyed by component name or `all`
    #[serde(default)]
    pub images: BTreeMap<String, ImageOverride>,
}

impl ClusterctlConfig {
    /// Parse clusterctl.yaml contents
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let value = yaml::parse_yaml(raw)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization(format!("invalid clusterctl config: {}", e)))
    }
}

/// Settings shared by every reconcile
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Predefined providers
    pub catalog: ProviderCatalog,
    /// Image rules keyed by component name or `all`
    pub images: BTreeMap<String, ImageOverride>,
    /// How long to wait for deployments to become ready
    pub provider_ready_timeout: Duration,
    /// Installable contracts
    pub supported_contracts: Vec<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            catalog: ProviderCatalog::builtin(),
            images: BTreeMap::new(),
            provider_ready_timeout: DEFAULT_PROVIDER_READY_TIMEOUT,
            supported_contracts: SUPPORTED_CONTRACTS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl OperatorConfig {
    /// Combine the built-in catalog with a parsed clusterctl config
    pub fn from_clusterctl(config: ClusterctlConfig) -> Self {
        Self {
            catalog: ProviderCatalog::builtin().with_overrides(config.providers),
            images: config.images,
            ..Self::default()
        }
    }

    /// Load from a clusterctl config path. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no clusterctl config, using built-in catalog");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::internal_with_context(
                    "config",
                    format!("failed to read {}: {}", path.display(), e),
                ))
            }
        };
        let parsed = ClusterctlConfig::parse(&raw)?;
        info!(
            path = %path.display(),
            providers = parsed.providers.len(),
            image_rules = parsed.images.len(),
            "loaded clusterctl config"
        );
        Ok(Self::from_clusterctl(parsed))
    }

    /// Override the readiness timeout
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.provider_ready_timeout = timeout;
        self
    }

    /// Effective image rule for a component.
    ///
    /// The component's own rule wins field by field over the `all` rule.
    pub fn image_override_for(&self, component: &str) -> Option<ImageOverride> {
        let all = self.images.get(ALL_COMPONENTS);
        let own = self.images.get(component);
        let merged = ImageOverride {
            repository: own
                .and_then(|o| o.repository.clone())
                .or_else(|| all.and_then(|a| a.repository.clone())),
            tag: own
                .and_then(|o| o.tag.clone())
                .or_else(|| all.and_then(|a| a.tag.clone())),
        };
        (!merged.is_empty()).then_some(merged)
    }

    /// Whether a contract can be installed
    pub fn supports_contract(&self, contract: &str) -> bool {
        self.supported_contracts.iter().any(|c| c == contract)
    }
}
