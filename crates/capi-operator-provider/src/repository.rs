//! Per-reconcile manifest repository
//!
//! Resolves a provider's artifact source, picks the target version and holds
//! the fetched files keyed by version. Releases pulled from GitHub or an OCI
//! registry are written back to the provider's ConfigMap mirror, and the
//! mirror is consulted first, so a version seen once keeps installing while
//! the upstream is unreachable.

use std::collections::BTreeMap;
use std::sync::Arc;

use capi_operator_common::crd::ProviderObject;
use capi_operator_common::retry::RetryConfig;
use capi_operator_common::Error;
use tracing::{debug, info, warn};

use crate::catalog::ProviderCatalog;
use crate::client::ClusterOps;
use crate::http::HttpFetcher;
use crate::metadata::{Metadata, METADATA_FILE};
use crate::sources::configmap::{encode_release, selector_to_string, MANIFESTS_KEY};
use crate::sources::{
    ArtifactFiles, ArtifactSource, ConfigMapSource, GitHubSource, OciSource, SourceCredentials,
    SourceKind,
};
use crate::version::latest_version;

/// Files of one or more versions, addressable by version and file name
#[derive(Clone, Debug)]
pub struct ManifestRepository {
    source: SourceKind,
    components_file: String,
    skip_components: bool,
    versions: Vec<String>,
    releases: BTreeMap<String, ArtifactFiles>,
}

impl ManifestRepository {
    /// Empty repository
    pub fn new(source: SourceKind, components_file: impl Into<String>, skip_components: bool) -> Self {
        Self {
            source,
            components_file: components_file.into(),
            skip_components,
            versions: Vec::new(),
            releases: BTreeMap::new(),
        }
    }

    /// Where the files came from
    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Name under which the components are addressed
    pub fn components_file(&self) -> &str {
        &self.components_file
    }

    /// Whether components were skipped on fetch
    pub fn skips_components(&self) -> bool {
        self.skip_components
    }

    /// Versions the source offers
    pub fn get_versions(&self) -> &[String] {
        &self.versions
    }

    /// Record the versions offered by the source
    pub fn set_versions(&mut self, versions: Vec<String>) {
        self.versions = versions;
    }

    /// Store the files of a version
    pub fn insert(&mut self, version: impl Into<String>, files: ArtifactFiles) {
        let version = version.into();
        if !self.versions.contains(&version) {
            self.versions.push(version.clone());
        }
        self.releases.insert(version, files);
    }

    /// One file of a version.
    ///
    /// `metadata.yaml`, the components file (or `components.yaml`) and
    /// `manifests` are addressable.
    pub fn get_file(&self, version: &str, name: &str) -> Result<&[u8], Error> {
        let files = self
            .releases
            .get(version)
            .ok_or_else(|| Error::not_found(format!("version {} is not in the repository", version)))?;
        let content = if name == METADATA_FILE {
            Some(files.metadata.as_slice())
        } else if name == self.components_file || name == "components.yaml" {
            (!self.skip_components).then_some(files.components.as_slice())
        } else if name == MANIFESTS_KEY {
            files.manifests.as_deref()
        } else {
            None
        };
        content.ok_or_else(|| {
            Error::not_found(format!("file {} not found for version {}", name, version))
        })
    }

    /// Parsed metadata of a version
    pub fn metadata(&self, version: &str) -> Result<Metadata, Error> {
        Metadata::parse(self.get_file(version, METADATA_FILE)?)
    }

    /// Raw components of a version
    pub fn components(&self, version: &str) -> Result<&[u8], Error> {
        self.get_file(version, &self.components_file)
    }
}

/// Builds a [`ManifestRepository`] for a provider
pub struct RepositoryLoader<'a> {
    ops: Arc<dyn ClusterOps>,
    http: Arc<dyn HttpFetcher>,
    catalog: &'a ProviderCatalog,
    retry: RetryConfig,
}

impl<'a> RepositoryLoader<'a> {
    /// Loader over the given clients
    pub fn new(
        ops: Arc<dyn ClusterOps>,
        http: Arc<dyn HttpFetcher>,
        catalog: &'a ProviderCatalog,
        retry: RetryConfig,
    ) -> Self {
        Self {
            ops,
            http,
            catalog,
            retry,
        }
    }

    /// Pick the source from `spec.fetchConfig`, falling back to the catalog.
    ///
    /// Returns the source and the components file name it serves.
    pub fn source_for(
        &self,
        provider: &ProviderObject,
        credentials: &SourceCredentials,
    ) -> Result<(Box<dyn ArtifactSource>, String), Error> {
        let default_file = provider.provider_type.components_file();
        let fetch = provider.spec.fetch_config.clone().unwrap_or_default();

        if let Some(selector) = &fetch.selector {
            let source = ConfigMapSource::new(
                self.ops.clone(),
                provider.namespace(),
                selector_to_string(selector),
            );
            return Ok((Box::new(source), default_file));
        }
        if let Some(reference) = &fetch.oci {
            let source = OciSource::new(
                self.http.clone(),
                reference,
                &default_file,
                credentials.clone(),
                self.retry.clone(),
            )?;
            return Ok((Box::new(source), default_file));
        }

        let url = match &fetch.url {
            Some(url) => url.clone(),
            None => self
                .catalog
                .lookup(provider.provider_type, provider.name())
                .map(|entry| entry.url.clone())
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "{} {} is not a predefined provider and has no fetchConfig",
                        provider.provider_type,
                        provider.name()
                    ))
                })?,
        };
        let source = GitHubSource::new(
            self.http.clone(),
            &url,
            &default_file,
            credentials.github_token.clone(),
            self.retry.clone(),
        )?;
        let file = source
            .release()
            .file
            .clone()
            .unwrap_or(default_file);
        Ok((Box::new(source), file))
    }

    /// Load the provider at `version`, or the latest offered version when `None`.
    pub async fn load(
        &self,
        provider: &ProviderObject,
        credentials: &SourceCredentials,
        version: Option<&str>,
        skip_components: bool,
    ) -> Result<(ManifestRepository, String), Error> {
        let (source, components_file) = self.source_for(provider, credentials)?;
        let kind = source.kind();
        let mut repository = ManifestRepository::new(kind, components_file, skip_components);
        let mirror = kind
            .is_remote()
            .then(|| ConfigMapSource::mirror(self.ops.clone(), provider, &source.origin()));

        let target = match version {
            Some(version) => version.to_string(),
            None => {
                let versions = self.list_versions(source.as_ref(), mirror.as_ref()).await?;
                let latest = latest_version(&versions).ok_or_else(|| {
                    Error::not_found(format!(
                        "no versions available for {} {}",
                        provider.provider_type,
                        provider.name()
                    ))
                })?;
                repository.set_versions(versions);
                latest
            }
        };

        let files = self
            .fetch_version(provider, source.as_ref(), mirror.as_ref(), &target, skip_components)
            .await?;
        repository.insert(target.clone(), files);
        Ok((repository, target))
    }

    async fn list_versions(
        &self,
        source: &dyn ArtifactSource,
        mirror: Option<&ConfigMapSource>,
    ) -> Result<Vec<String>, Error> {
        match (source.versions().await, mirror) {
            (Ok(versions), _) => Ok(versions),
            (Err(e), Some(mirror)) => {
                let mirrored = mirror.versions().await.unwrap_or_default();
                if mirrored.is_empty() {
                    return Err(e);
                }
                warn!(
                    source = %source.kind(),
                    error = %e,
                    "listing upstream versions failed, using mirrored versions"
                );
                Ok(mirrored)
            }
            (Err(e), None) => Err(e),
        }
    }

    async fn fetch_version(
        &self,
        provider: &ProviderObject,
        source: &dyn ArtifactSource,
        mirror: Option<&ConfigMapSource>,
        version: &str,
        skip_components: bool,
    ) -> Result<ArtifactFiles, Error> {
        let Some(mirror) = mirror else {
            return source.fetch(version, skip_components).await;
        };

        match mirror.fetch(version, skip_components).await {
            Ok(files) => {
                debug!(provider = %provider.key(), version, "serving release from mirror");
                return Ok(files);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(provider = %provider.key(), version, error = %e, "mirror unreadable"),
        }

        let files = source.fetch(version, skip_components).await?;
        if !skip_components {
            self.write_mirror(provider, version, &files, source).await;
        }
        Ok(files)
    }

    async fn write_mirror(
        &self,
        provider: &ProviderObject,
        version: &str,
        files: &ArtifactFiles,
        source: &dyn ArtifactSource,
    ) {
        let configmaps = match encode_release(provider, version, files, source.kind(), &source.origin()) {
            Ok(configmaps) => configmaps,
            Err(e) => {
                warn!(provider = %provider.key(), version, error = %e, "cannot mirror release");
                return;
            }
        };
        for configmap in &configmaps {
            if let Err(e) = self.ops.apply_configmap(configmap).await {
                warn!(provider = %provider.key(), version, error = %e, "failed to write mirror");
                return;
            }
        }
        info!(
            provider = %provider.key(),
            version,
            configmaps = configmaps.len(),
            "mirrored release into cluster"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterOps;
    use crate::http::{HttpResponse, MockHttpFetcher};
    use capi_operator_common::crd::{FetchConfiguration, ProviderSpec, ProviderType};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const METADATA: &str = "releaseSeries:\n  - major: 2\n    minor: 5\n    contract: v1beta1\n";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    fn aws(fetch_config: Option<FetchConfiguration>) -> ProviderObject {
        ProviderObject::new(
            ProviderType::Infrastructure,
            "aws",
            "capa-system",
            ProviderSpec {
                fetch_config,
                ..Default::default()
            },
        )
    }

    /// GitHub that serves one release, or nothing at all
    fn github(up: bool) -> MockHttpFetcher {
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(move |request| {
            if !up {
                return Ok(HttpResponse::status(503));
            }
            if request.url.contains("/repos/") {
                return Ok(HttpResponse::ok(
                    r#"[{"tag_name":"v2.5.0"},{"tag_name":"v2.4.0"},{"tag_name":"v2.6.0-rc.1"}]"#,
                ));
            }
            if request.url.ends_with("/metadata.yaml") {
                return Ok(HttpResponse::ok(METADATA));
            }
            if request.url.ends_with("/infrastructure-components.yaml") {
                return Ok(HttpResponse::ok("kind: Namespace"));
            }
            Ok(HttpResponse::status(404))
        });
        http
    }

    /// ClusterOps backed by an in-memory ConfigMap store
    fn store() -> (MockClusterOps, Arc<Mutex<Vec<ConfigMap>>>) {
        let stored = Arc::new(Mutex::new(Vec::<ConfigMap>::new()));
        let mut ops = MockClusterOps::new();
        let writes = stored.clone();
        ops.expect_apply_configmap().returning(move |cm| {
            writes.lock().unwrap().push(cm.clone());
            Ok(())
        });
        let reads = stored.clone();
        ops.expect_list_configmaps().returning(move |_, selector| {
            let version = selector
                .split(',')
                .find_map(|part| part.strip_prefix("provider.cluster.x-k8s.io/version="))
                .map(str::to_string);
            Ok(reads
                .lock()
                .unwrap()
                .iter()
                .filter(|cm| {
                    version.is_none()
                        || cm.metadata.labels.as_ref().unwrap()
                            ["provider.cluster.x-k8s.io/version"]
                            == *version.as_ref().unwrap()
                })
                .cloned()
                .collect())
        });
        (ops, stored)
    }

    #[tokio::test]
    async fn predefined_provider_resolves_latest_release_and_mirrors_it() {
        let (ops, stored) = store();
        let catalog = ProviderCatalog::builtin();
        let loader = RepositoryLoader::new(Arc::new(ops), Arc::new(github(true)), &catalog, fast_retry());

        let (repo, version) = loader
            .load(&aws(None), &SourceCredentials::default(), None, false)
            .await
            .unwrap();
        assert_eq!(version, "v2.5.0");
        assert_eq!(repo.source(), SourceKind::GitHub);
        assert_eq!(repo.get_versions().len(), 3);
        assert_eq!(repo.components("v2.5.0").unwrap(), b"kind: Namespace");
        assert_eq!(repo.metadata("v2.5.0").unwrap().release_series[0].contract, "v1beta1");
        assert!(repo.get_file("v2.5.0", "manifests").unwrap_err().is_not_found());
        assert!(repo.get_file("v9.9.9", METADATA_FILE).unwrap_err().is_not_found());
        assert_eq!(stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mirrored_release_survives_an_upstream_outage() {
        let (ops, _stored) = store();
        let ops: Arc<dyn ClusterOps> = Arc::new(ops);
        let catalog = ProviderCatalog::builtin();
        let provider = aws(None);

        RepositoryLoader::new(ops.clone(), Arc::new(github(true)), &catalog, fast_retry())
            .load(&provider, &SourceCredentials::default(), Some("v2.5.0"), false)
            .await
            .unwrap();

        let offline = RepositoryLoader::new(ops, Arc::new(github(false)), &catalog, fast_retry());
        let (repo, version) = offline
            .load(&provider, &SourceCredentials::default(), None, false)
            .await
            .unwrap();
        assert_eq!(version, "v2.5.0");
        assert_eq!(repo.components("v2.5.0").unwrap(), b"kind: Namespace");
    }

    #[tokio::test]
    async fn changed_fetch_config_is_not_served_the_old_mirror() {
        let (ops, stored) = store();
        let ops: Arc<dyn ClusterOps> = Arc::new(ops);
        let catalog = ProviderCatalog::builtin();

        RepositoryLoader::new(ops.clone(), Arc::new(github(true)), &catalog, fast_retry())
            .load(&aws(None), &SourceCredentials::default(), Some("v2.5.0"), false)
            .await
            .unwrap();

        let mut fork = MockHttpFetcher::new();
        fork.expect_get().returning(|request| {
            assert!(request.url.contains("/me/capa/"), "unexpected {}", request.url);
            if request.url.ends_with("/metadata.yaml") {
                return Ok(HttpResponse::ok(METADATA));
            }
            Ok(HttpResponse::ok("kind: Fork"))
        });
        let forked = aws(Some(FetchConfiguration {
            url: Some("https://github.com/me/capa/releases".to_string()),
            ..Default::default()
        }));
        let (repo, _) = RepositoryLoader::new(ops, Arc::new(fork), &catalog, fast_retry())
            .load(&forked, &SourceCredentials::default(), Some("v2.5.0"), false)
            .await
            .unwrap();

        assert_eq!(repo.components("v2.5.0").unwrap(), b"kind: Fork");
        assert_eq!(stored.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_provider_without_fetch_config_is_not_found() {
        let catalog = ProviderCatalog::builtin();
        let loader = RepositoryLoader::new(
            Arc::new(MockClusterOps::new()),
            Arc::new(MockHttpFetcher::new()),
            &catalog,
            fast_retry(),
        );
        let mut provider = aws(None);
        provider.metadata.name = Some("my-custom-aws".to_string());
        let err = loader
            .load(&provider, &SourceCredentials::default(), None, false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn skip_components_fetches_metadata_only() {
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(|request| {
            assert!(request.url.ends_with("/metadata.yaml"), "unexpected {}", request.url);
            Ok(HttpResponse::ok(METADATA))
        });
        let mut ops = MockClusterOps::new();
        ops.expect_list_configmaps().returning(|_, _| Ok(Vec::new()));
        let catalog = ProviderCatalog::builtin();
        let loader = RepositoryLoader::new(Arc::new(ops), Arc::new(http), &catalog, fast_retry());

        let provider = aws(Some(FetchConfiguration {
            url: Some("https://github.com/me/capa/releases".to_string()),
            ..Default::default()
        }));
        let (repo, _) = loader
            .load(&provider, &SourceCredentials::default(), Some("v2.5.0"), true)
            .await
            .unwrap();
        assert!(repo.skips_components());
        assert!(repo.metadata("v2.5.0").is_ok());
        assert!(repo.components("v2.5.0").unwrap_err().is_not_found());
    }

    #[test]
    fn source_selection_follows_fetch_config() {
        let catalog = ProviderCatalog::builtin();
        let loader = RepositoryLoader::new(
            Arc::new(MockClusterOps::new()),
            Arc::new(MockHttpFetcher::new()),
            &catalog,
            fast_retry(),
        );
        let creds = SourceCredentials::default();

        let oci = aws(Some(FetchConfiguration {
            oci: Some("ghcr.io/me/capa:v2.5.0".to_string()),
            ..Default::default()
        }));
        let (source, file) = loader.source_for(&oci, &creds).unwrap();
        assert_eq!(source.kind(), SourceKind::Oci);
        assert_eq!(file, "infrastructure-components.yaml");

        let selector = aws(Some(FetchConfiguration {
            selector: Some(Default::default()),
            ..Default::default()
        }));
        assert_eq!(loader.source_for(&selector, &creds).unwrap().0.kind(), SourceKind::ConfigMap);

        let mut docker = aws(None);
        docker.metadata.name = Some("docker".to_string());
        let (source, file) = loader.source_for(&docker, &creds).unwrap();
        assert_eq!(source.kind(), SourceKind::GitHub);
        assert_eq!(file, "infrastructure-components-development.yaml");
    }
}
