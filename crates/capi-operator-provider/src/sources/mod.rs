//! Artifact sources
//!
//! A source enumerates the versions a provider has published and fetches
//! the `metadata.yaml` and components file of one version. Three sources
//! exist: GitHub releases, OCI artifacts and in-cluster ConfigMaps.

pub mod configmap;
pub mod github;
pub mod oci;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use capi_operator_common::Error;
use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};

pub use configmap::ConfigMapSource;
pub use github::GitHubSource;
pub use oci::OciSource;

/// Where artifacts come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// GitHub release assets
    GitHub,
    /// OCI registry artifact
    Oci,
    /// ConfigMaps in the management cluster
    ConfigMap,
}

impl SourceKind {
    /// Short name used in annotations and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Oci => "oci",
            Self::ConfigMap => "configmap",
        }
    }

    /// Whether artifacts live outside the cluster
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::ConfigMap)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Files of one release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtifactFiles {
    /// `metadata.yaml`
    pub metadata: Vec<u8>,
    /// Components YAML; empty when fetched in metadata-only mode
    pub components: Vec<u8>,
    /// Extra manifests stored alongside (ConfigMap repositories only)
    pub manifests: Option<Vec<u8>>,
}

/// Trait implemented by every artifact source
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Which kind of source this is
    fn kind(&self) -> SourceKind;

    /// Location the artifacts are read from, e.g. `https://github.com/org/repo#file`.
    ///
    /// Mirrored releases are stamped with it so a changed fetchConfig is not
    /// served the previous location's files.
    fn origin(&self) -> String;

    /// Published versions, unsorted
    async fn versions(&self) -> Result<Vec<String>, Error>;

    /// Files of a version. With `skip_components` only the metadata is fetched.
    async fn fetch(&self, version: &str, skip_components: bool) -> Result<ArtifactFiles, Error>;
}

/// Credentials read from a provider's config secret
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SourceCredentials {
    /// GitHub personal access token
    pub github_token: Option<String>,
    /// Registry user name
    pub oci_username: Option<String>,
    /// Registry password
    pub oci_password: Option<String>,
    /// Registry bearer token
    pub oci_access_token: Option<String>,
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("oci_username", &self.oci_username)
            .field("oci_password", &self.oci_password.as_ref().map(|_| "<redacted>"))
            .field("oci_access_token", &self.oci_access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SourceCredentials {
    /// Pick the credential keys out of secret data
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| data.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            github_token: get("github-token"),
            oci_username: get("oci-username"),
            oci_password: get("oci-password"),
            oci_access_token: get("oci-access-token"),
        }
    }
}

/// Secret `data` and `stringData` decoded to strings; non-UTF-8 values are skipped
pub fn secret_string_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(k, v)| String::from_utf8(v.0.clone()).ok().map(|v| (k.clone(), v)))
        .collect();
    if let Some(string_data) = &secret.string_data {
        out.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Content hash of a config secret; empty when the secret is missing.
///
/// Covers `data` and `stringData` so any edit to either changes the hash.
pub fn secret_data_hash(secret: Option<&Secret>) -> String {
    let Some(secret) = secret else {
        return String::new();
    };
    let mut hasher = Sha256::new();
    for (key, value) in secret.data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(&value.0);
        hasher.update([0]);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([1]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}
