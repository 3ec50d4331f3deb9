//! ConfigMap repository
//!
//! One ConfigMap per version, labeled with the provider name, type and
//! version. The same layout serves two purposes: users can ship provider
//! releases into the cluster themselves, and releases fetched from GitHub or
//! an OCI registry are mirrored here so later reconciles survive upstream
//! outages.
//!
//! Keys: `metadata` (plain), `components` (plain, or gzip under binaryData
//! when annotated `compressed=true`), optional `manifests`. Compressed
//! components that still exceed one ConfigMap are split across `-part-N`
//! ConfigMaps carrying the same labels plus a part index.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use capi_operator_common::crd::ProviderObject;
use capi_operator_common::Error;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use tracing::debug;

use super::{ArtifactFiles, ArtifactSource, SourceKind};
use crate::client::ClusterOps;

/// Provider name label
pub const NAME_LABEL: &str = "provider.cluster.x-k8s.io/name";
/// Provider type label
pub const TYPE_LABEL: &str = "provider.cluster.x-k8s.io/type";
/// Version label
pub const VERSION_LABEL: &str = "provider.cluster.x-k8s.io/version";
/// Part index label on split ConfigMaps
pub const PART_LABEL: &str = "provider.cluster.x-k8s.io/part";
/// Set to `true` when components are gzip-compressed
pub const COMPRESSED_ANNOTATION: &str = "provider.cluster.x-k8s.io/compressed";
/// Where a mirrored release came from (`github` or `oci`)
pub const SOURCE_ANNOTATION: &str = "provider.cluster.x-k8s.io/source";
/// Location a mirrored release was fetched from, see [`ArtifactSource::origin`]
pub const ORIGIN_ANNOTATION: &str = "provider.cluster.x-k8s.io/origin";
/// Number of ConfigMaps holding the components, on the primary
pub const PARTS_ANNOTATION: &str = "provider.cluster.x-k8s.io/parts";

/// Metadata key
pub const METADATA_KEY: &str = "metadata";
/// Components key
pub const COMPONENTS_KEY: &str = "components";
/// Additional manifests key
pub const MANIFESTS_KEY: &str = "manifests";

/// Largest object the API server stores
pub const MAX_CONFIGMAP_BYTES: usize = 1024 * 1024;
/// Payload kept in one ConfigMap, leaving room for metadata
pub const CHUNK_BYTES: usize = 1000 * 1024;

/// Render a label selector in the `key=value,key in (a,b)` string form
pub fn selector_to_string(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        parts.push(match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values),
            "NotIn" => format!("{} notin ({})", expr.key, values),
            "DoesNotExist" => format!("!{}", expr.key),
            _ => expr.key.clone(),
        });
    }
    parts.join(",")
}

/// Selector matching the mirror entries of a provider
pub fn mirror_selector(provider: &ProviderObject) -> String {
    format!(
        "{}={},{}={}",
        NAME_LABEL,
        provider.name(),
        TYPE_LABEL,
        provider.provider_type.slug()
    )
}

/// Name of a provider's mirror entry for a version
pub fn mirror_name(provider: &ProviderObject, version: &str) -> String {
    let raw = format!(
        "{}-{}-{}",
        provider.provider_type.slug(),
        provider.name(),
        version.to_ascii_lowercase()
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::internal_with_context("configmap", format!("gzip failed: {}", e)))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::serialization(format!("corrupt compressed components: {}", e)))?;
    Ok(out)
}

/// Build the mirror ConfigMaps for one release.
///
/// Components stay plain while the whole entry fits; otherwise they are
/// gzipped, and split into parts if the compressed blob still does not fit.
/// The primary shares its budget with the plain `metadata` and `manifests`.
pub fn encode_release(
    provider: &ProviderObject,
    version: &str,
    files: &ArtifactFiles,
    source: SourceKind,
    origin: &str,
) -> Result<Vec<ConfigMap>, Error> {
    let name = mirror_name(provider, version);
    let labels = BTreeMap::from([
        (NAME_LABEL.to_string(), provider.name().to_string()),
        (TYPE_LABEL.to_string(), provider.provider_type.slug().to_string()),
        (VERSION_LABEL.to_string(), version.to_string()),
    ]);
    let mut annotations = BTreeMap::from([
        (SOURCE_ANNOTATION.to_string(), source.as_str().to_string()),
        (ORIGIN_ANNOTATION.to_string(), origin.to_string()),
    ]);
    let meta = |name: String, labels: BTreeMap<String, String>, annotations: BTreeMap<String, String>| ObjectMeta {
        name: Some(name),
        namespace: Some(provider.namespace().to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        owner_references: provider.owner_reference().map(|r| vec![r]),
        ..Default::default()
    };

    let metadata = String::from_utf8(files.metadata.clone())
        .map_err(|_| Error::serialization("metadata.yaml is not UTF-8"))?;
    let mut data = BTreeMap::from([(METADATA_KEY.to_string(), metadata)]);
    if let Some(manifests) = &files.manifests {
        data.insert(
            MANIFESTS_KEY.to_string(),
            String::from_utf8_lossy(manifests).into_owned(),
        );
    }

    let data_size: usize = data.values().map(String::len).sum();
    let plain_components = std::str::from_utf8(&files.components).ok();
    if let (true, Some(components)) = (data_size + files.components.len() < CHUNK_BYTES, plain_components) {
        data.insert(COMPONENTS_KEY.to_string(), components.to_string());
        return Ok(vec![ConfigMap {
            metadata: meta(name, labels, annotations),
            data: Some(data),
            ..Default::default()
        }]);
    }

    let compressed = gzip(&files.components)?;
    let chunks = split_chunks(&compressed, CHUNK_BYTES.saturating_sub(data_size)).ok_or_else(|| {
        Error::serialization_for_kind(
            "ConfigMap",
            format!(
                "metadata and additional manifests of {} take {} bytes, more than one ConfigMap holds",
                name, data_size
            ),
        )
    })?;
    annotations.insert(COMPRESSED_ANNOTATION.to_string(), "true".to_string());
    if chunks.len() > 1 {
        annotations.insert(PARTS_ANNOTATION.to_string(), chunks.len().to_string());
    }

    let mut configmaps = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let binary = BTreeMap::from([(COMPONENTS_KEY.to_string(), ByteString(chunk.to_vec()))]);
        if index == 0 {
            configmaps.push(ConfigMap {
                metadata: meta(name.clone(), labels.clone(), annotations.clone()),
                data: Some(data.clone()),
                binary_data: Some(binary),
                ..Default::default()
            });
        } else {
            let mut part_labels = labels.clone();
            part_labels.insert(PART_LABEL.to_string(), index.to_string());
            configmaps.push(ConfigMap {
                metadata: meta(
                    format!("{}-part-{}", name, index),
                    part_labels,
                    BTreeMap::from([
                        (COMPRESSED_ANNOTATION.to_string(), "true".to_string()),
                        (ORIGIN_ANNOTATION.to_string(), origin.to_string()),
                    ]),
                ),
                binary_data: Some(binary),
                ..Default::default()
            });
        }
    }
    Ok(configmaps)
}

/// Chunks of `blob`: the first at most `first` bytes, the rest at most [`CHUNK_BYTES`].
///
/// `None` when the first chunk has no room at all.
fn split_chunks(blob: &[u8], first: usize) -> Option<Vec<&[u8]>> {
    if first == 0 {
        return None;
    }
    let (head, tail) = blob.split_at(first.min(blob.len()));
    Some(std::iter::once(head).chain(tail.chunks(CHUNK_BYTES)).collect())
}

fn label<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.metadata.labels.as_ref()?.get(key).map(String::as_str)
}

fn annotation<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

fn cm_name(cm: &ConfigMap) -> &str {
    cm.metadata.name.as_deref().unwrap_or_default()
}

/// Whether a ConfigMap is a continuation part rather than a version's primary entry
pub fn is_part(cm: &ConfigMap) -> bool {
    label(cm, PART_LABEL).is_some()
}

/// Version carried by a repository ConfigMap
pub fn version_of(cm: &ConfigMap) -> Option<&str> {
    label(cm, VERSION_LABEL).filter(|v| !v.is_empty())
}

/// Reassemble the files of one version from its ConfigMaps
pub fn decode_release(version: &str, configmaps: &[ConfigMap]) -> Result<ArtifactFiles, Error> {
    let same_version: Vec<&ConfigMap> = configmaps
        .iter()
        .filter(|cm| version_of(cm) == Some(version))
        .collect();
    let primary = same_version
        .iter()
        .find(|cm| !is_part(cm))
        .ok_or_else(|| Error::not_found(format!("no ConfigMap holds version {}", version)))?;
    let data = primary.data.clone().unwrap_or_default();

    let metadata = data.get(METADATA_KEY).ok_or_else(|| {
        Error::serialization_for_kind(
            "ConfigMap",
            format!("ConfigMap {} has no {} key", cm_name(primary), METADATA_KEY),
        )
    })?;

    let components = if annotation(primary, COMPRESSED_ANNOTATION) == Some("true") {
        let mut parts: Vec<(usize, &ConfigMap)> = same_version
            .iter()
            .filter(|cm| is_part(cm))
            .filter_map(|cm| {
                label(cm, PART_LABEL)
                    .and_then(|p| p.parse().ok())
                    .map(|p| (p, *cm))
            })
            .collect();
        let expected: usize = annotation(primary, PARTS_ANNOTATION)
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        // parts left over from an earlier, larger entry
        parts.retain(|(index, _)| *index < expected);
        parts.sort_by_key(|(index, _)| *index);
        if parts.len() + 1 != expected {
            return Err(Error::not_found(format!(
                "version {} is split into {} ConfigMaps but {} were found",
                version,
                expected,
                parts.len() + 1
            )));
        }

        let mut blob = Vec::new();
        for cm in std::iter::once(*primary).chain(parts.iter().map(|(_, cm)| *cm)) {
            let chunk = cm
                .binary_data
                .as_ref()
                .and_then(|b| b.get(COMPONENTS_KEY))
                .ok_or_else(|| {
                    Error::serialization_for_kind(
                        "ConfigMap",
                        format!("ConfigMap {} has no binary {} key", cm_name(cm), COMPONENTS_KEY),
                    )
                })?;
            blob.extend_from_slice(&chunk.0);
        }
        gunzip(&blob)?
    } else {
        data.get(COMPONENTS_KEY)
            .ok_or_else(|| {
                Error::serialization_for_kind(
                    "ConfigMap",
                    format!("ConfigMap {} has no {} key", cm_name(primary), COMPONENTS_KEY),
                )
            })?
            .clone()
            .into_bytes()
    };

    Ok(ArtifactFiles {
        metadata: metadata.clone().into_bytes(),
        components,
        manifests: data.get(MANIFESTS_KEY).map(|m| m.clone().into_bytes()),
    })
}

/// Source reading ConfigMaps in the provider's namespace
pub struct ConfigMapSource {
    ops: Arc<dyn ClusterOps>,
    namespace: String,
    selector: String,
    origin: Option<String>,
}

impl ConfigMapSource {
    /// Source over ConfigMaps matching `selector` in `namespace`
    pub fn new(ops: Arc<dyn ClusterOps>, namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            ops,
            namespace: namespace.into(),
            selector: selector.into(),
            origin: None,
        }
    }

    /// The provider's mirror of releases fetched from `origin`.
    ///
    /// Entries mirrored from any other location are invisible.
    pub fn mirror(ops: Arc<dyn ClusterOps>, provider: &ProviderObject, origin: &str) -> Self {
        Self {
            origin: Some(origin.to_string()),
            ..Self::new(ops, provider.namespace(), mirror_selector(provider))
        }
    }

    async fn list(&self, selector: &str) -> Result<Vec<ConfigMap>, Error> {
        let mut configmaps = self.ops.list_configmaps(&self.namespace, selector).await?;
        if let Some(origin) = &self.origin {
            configmaps.retain(|cm| annotation(cm, ORIGIN_ANNOTATION) == Some(origin.as_str()));
        }
        Ok(configmaps)
    }

    fn version_selector(&self, version: &str) -> String {
        if self.selector.is_empty() {
            format!("{}={}", VERSION_LABEL, version)
        } else {
            format!("{},{}={}", self.selector, VERSION_LABEL, version)
        }
    }
}

#[async_trait]
impl ArtifactSource for ConfigMapSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ConfigMap
    }

    fn origin(&self) -> String {
        format!("configmap://{}?{}", self.namespace, self.selector)
    }

    async fn versions(&self) -> Result<Vec<String>, Error> {
        let configmaps = self.list(&self.selector).await?;
        let mut versions: Vec<String> = configmaps
            .iter()
            .filter(|cm| !is_part(cm))
            .filter_map(|cm| version_of(cm).map(str::to_string))
            .collect();
        versions.sort();
        versions.dedup();
        debug!(
            namespace = %self.namespace,
            selector = %self.selector,
            count = versions.len(),
            "listed ConfigMap repository versions"
        );
        Ok(versions)
    }

    async fn fetch(&self, version: &str, skip_components: bool) -> Result<ArtifactFiles, Error> {
        let configmaps = self.list(&self.version_selector(version)).await?;
        let mut files = decode_release(version, &configmaps)?;
        if skip_components {
            files.components.clear();
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterOps;
    use capi_operator_common::crd::{ProviderSpec, ProviderType};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    const GH: &str = "https://github.com/kubernetes-sigs/cluster-api-provider-aws#infrastructure-components.yaml";

    fn aws() -> ProviderObject {
        let mut provider = ProviderObject::new(
            ProviderType::Infrastructure,
            "aws",
            "capa-system",
            ProviderSpec::default(),
        );
        provider.metadata.uid = Some("uid-1".to_string());
        provider
    }

    fn files(components: Vec<u8>) -> ArtifactFiles {
        ArtifactFiles {
            metadata: b"releaseSeries: []".to_vec(),
            components,
            manifests: None,
        }
    }

    /// Deterministic bytes that gzip poorly, to force splitting
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect()
    }

    #[test]
    fn small_release_is_one_plain_configmap() {
        let cms = encode_release(&aws(), "v2.5.0", &files(b"kind: X".to_vec()), SourceKind::GitHub, GH)
            .unwrap();
        assert_eq!(cms.len(), 1);
        let cm = &cms[0];
        assert_eq!(cm.metadata.name.as_deref(), Some("infrastructure-aws-v2.5.0"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("capa-system"));
        assert_eq!(label(cm, TYPE_LABEL), Some("infrastructure"));
        assert_eq!(annotation(cm, SOURCE_ANNOTATION), Some("github"));
        assert_eq!(annotation(cm, COMPRESSED_ANNOTATION), None);
        assert_eq!(
            cm.metadata.owner_references.as_ref().unwrap()[0].kind,
            "InfrastructureProvider"
        );
        assert_eq!(decode_release("v2.5.0", &cms).unwrap(), files(b"kind: X".to_vec()));
    }

    #[test]
    fn large_release_is_compressed() {
        let components = "apiVersion: v1\nkind: ConfigMap\n".repeat(50_000).into_bytes();
        assert!(components.len() > MAX_CONFIGMAP_BYTES);
        let cms = encode_release(&aws(), "v2.5.0", &files(components.clone()), SourceKind::Oci, GH)
            .unwrap();
        assert_eq!(cms.len(), 1);
        assert_eq!(annotation(&cms[0], COMPRESSED_ANNOTATION), Some("true"));
        assert!(cms[0].data.as_ref().unwrap().get(COMPONENTS_KEY).is_none());
        assert_eq!(decode_release("v2.5.0", &cms).unwrap().components, components);
    }

    #[test]
    fn incompressible_release_is_split_and_reassembled() {
        let components = noise(2 * MAX_CONFIGMAP_BYTES + 10);
        let cms = encode_release(&aws(), "v2.5.0", &files(components.clone()), SourceKind::Oci, GH)
            .unwrap();
        assert!(cms.len() >= 3);
        assert_eq!(
            annotation(&cms[0], PARTS_ANNOTATION),
            Some(cms.len().to_string().as_str())
        );
        assert!(cms[1..].iter().all(is_part));
        assert_eq!(
            cms[1].metadata.name.as_deref(),
            Some("infrastructure-aws-v2.5.0-part-1")
        );

        // order of listing does not matter
        let mut shuffled = cms.clone();
        shuffled.reverse();
        assert_eq!(decode_release("v2.5.0", &shuffled).unwrap().components, components);

        // a missing part is reported, not silently truncated
        let incomplete: Vec<_> = cms.iter().take(cms.len() - 1).cloned().collect();
        assert!(decode_release("v2.5.0", &incomplete).is_err());
    }

    fn payload(cm: &ConfigMap) -> usize {
        cm.data.iter().flatten().map(|(_, v)| v.len()).sum::<usize>()
            + cm.binary_data.iter().flatten().map(|(_, v)| v.0.len()).sum::<usize>()
    }

    #[test]
    fn additional_manifests_count_against_the_first_part() {
        let mut release = files(noise(900 * 1024));
        release.manifests = Some("# manifest\n".repeat(60 * 1024).into_bytes());
        let cms = encode_release(&aws(), "v2.5.0", &release, SourceKind::Oci, GH).unwrap();

        assert!(cms.len() >= 2);
        assert!(cms.iter().all(|cm| payload(cm) <= CHUNK_BYTES));
        assert_eq!(decode_release("v2.5.0", &cms).unwrap(), release);
    }

    #[test]
    fn oversized_manifests_are_rejected() {
        let mut release = files(noise(1024));
        release.manifests = Some(vec![b'#'; CHUNK_BYTES]);
        assert!(encode_release(&aws(), "v2.5.0", &release, SourceKind::Oci, GH).is_err());
    }

    #[test]
    fn leftover_parts_of_a_larger_entry_are_ignored() {
        let big = encode_release(&aws(), "v2.5.0", &files(noise(2 * CHUNK_BYTES)), SourceKind::Oci, GH)
            .unwrap();
        let small_components = noise(CHUNK_BYTES + 10);
        let small = encode_release(&aws(), "v2.5.0", &files(small_components.clone()), SourceKind::Oci, GH)
            .unwrap();
        assert!(small.len() < big.len());

        // re-applying by name overwrites the leading entries only
        let mut listed = small.clone();
        listed.extend(big[small.len()..].iter().cloned());
        assert_eq!(decode_release("v2.5.0", &listed).unwrap().components, small_components);
    }

    #[tokio::test]
    async fn mirror_hides_entries_from_another_origin() {
        let cms = encode_release(&aws(), "v2.5.0", &files(noise(2 * CHUNK_BYTES)), SourceKind::GitHub, GH)
            .unwrap();
        assert!(cms
            .iter()
            .all(|cm| annotation(cm, ORIGIN_ANNOTATION) == Some(GH)));

        let listed = cms.clone();
        let mut ops = MockClusterOps::new();
        ops.expect_list_configmaps()
            .returning(move |_, _| Ok(listed.clone()));
        let ops: Arc<dyn ClusterOps> = Arc::new(ops);

        let fork = ConfigMapSource::mirror(ops.clone(), &aws(), "https://github.com/me/capa#infrastructure-components.yaml");
        assert!(fork.versions().await.unwrap().is_empty());
        assert!(fork.fetch("v2.5.0", false).await.unwrap_err().is_not_found());

        let same = ConfigMapSource::mirror(ops, &aws(), GH);
        assert_eq!(same.versions().await.unwrap(), vec!["v2.5.0"]);
        assert!(same.fetch("v2.5.0", false).await.is_ok());
    }

    #[test]
    fn decode_requires_metadata() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("x".to_string()),
                labels: Some(BTreeMap::from([(VERSION_LABEL.to_string(), "v1.0.0".to_string())])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(COMPONENTS_KEY.to_string(), "a: b".to_string())])),
            ..Default::default()
        };
        let err = decode_release("v1.0.0", &[cm.clone()]).unwrap_err();
        assert!(err.message().contains("no metadata key"));
        assert!(decode_release("v2.0.0", &[cm]).unwrap_err().is_not_found());
    }

    #[test]
    fn selectors_render_like_kubectl() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("a".to_string(), "1".to_string())])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "b".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["x".to_string(), "y".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "c".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
                LabelSelectorRequirement {
                    key: "d".to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                },
            ]),
        };
        assert_eq!(selector_to_string(&selector), "a=1,b in (x,y),!c,d");
        assert_eq!(
            mirror_selector(&aws()),
            "provider.cluster.x-k8s.io/name=aws,provider.cluster.x-k8s.io/type=infrastructure"
        );
    }

    #[test]
    fn mirror_names_are_valid_object_names() {
        assert_eq!(mirror_name(&aws(), "v1.0.0+Build"), "infrastructure-aws-v1.0.0-build");
    }

    #[tokio::test]
    async fn source_lists_primaries_and_fetches_by_version() {
        let cms = encode_release(&aws(), "v2.5.0", &files(b"kind: X".to_vec()), SourceKind::GitHub, GH)
            .unwrap();
        let listed = cms.clone();
        let mut ops = MockClusterOps::new();
        ops.expect_list_configmaps().returning(move |ns, selector| {
            assert_eq!(ns, "capa-system");
            assert!(selector.starts_with("provider.cluster.x-k8s.io/name=aws"));
            Ok(listed.clone())
        });
        let source = ConfigMapSource::mirror(Arc::new(ops), &aws(), GH);
        assert_eq!(source.versions().await.unwrap(), vec!["v2.5.0"]);
        let fetched = source.fetch("v2.5.0", true).await.unwrap();
        assert!(fetched.components.is_empty());
        assert_eq!(fetched.metadata, b"releaseSeries: []");
    }
}
