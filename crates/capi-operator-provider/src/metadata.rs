//! Release metadata (`metadata.yaml`) parsing
//!
//! Every provider release ships a clusterctl Metadata document mapping
//! major/minor release series to the Cluster API contract they implement.

use capi_operator_common::{yaml, Error};
use semver::Version;
use serde::Deserialize;

/// Name of the metadata file in a release
pub const METADATA_FILE: &str = "metadata.yaml";

/// One release series entry
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ReleaseSeries {
    /// Major version
    pub major: u64,
    /// Minor version
    pub minor: u64,
    /// Contract, e.g. `v1beta1`
    pub contract: String,
}

/// clusterctl Metadata document
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Declared release series
    #[serde(default)]
    pub release_series: Vec<ReleaseSeries>,
}

impl Metadata {
    /// Parse raw `metadata.yaml` bytes
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::serialization_for_kind("Metadata", e.to_string()))?;
        let value = yaml::parse_yaml(text)?;
        if value.is_null() {
            return Err(Error::serialization_for_kind("Metadata", "metadata is empty"));
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("Metadata", e.to_string()))
    }

    /// Release series covering a version
    pub fn release_series_for(&self, version: &Version) -> Option<&ReleaseSeries> {
        self.release_series
            .iter()
            .find(|s| s.major == version.major && s.minor == version.minor)
    }

    /// Contract implemented by a version
    pub fn contract_for(&self, version: &Version) -> Option<&str> {
        self.release_series_for(version).map(|s| s.contract.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPI_METADATA: &str = r#"
apiVersion: clusterctl.cluster.x-k8s.io/v1alpha3
kind: Metadata
releaseSeries:
  - major: 1
    minor: 3
    contract: v1beta1
  - major: 1
    minor: 4
    contract: v1beta1
  - major: 0
    minor: 4
    contract: v1alpha4
"#;

    #[test]
    fn contract_lookup_by_major_minor() {
        let metadata = Metadata::parse(CAPI_METADATA.as_bytes()).unwrap();
        assert_eq!(metadata.release_series.len(), 3);
        assert_eq!(metadata.contract_for(&Version::new(1, 4, 3)), Some("v1beta1"));
        assert_eq!(metadata.contract_for(&Version::new(0, 4, 8)), Some("v1alpha4"));
        assert_eq!(metadata.contract_for(&Version::new(1, 5, 0)), None);
    }

    #[test]
    fn empty_or_invalid_metadata_is_rejected() {
        assert!(Metadata::parse(b"").is_err());
        assert!(Metadata::parse(b"releaseSeries: nope").is_err());
    }
}
