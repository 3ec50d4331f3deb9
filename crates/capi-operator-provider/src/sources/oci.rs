//! OCI artifact source
//!
//! Provider releases pushed as OCI artifacts, one tag per version. Files are
//! looked up by the `org.opencontainers.image.title` layer annotation; an
//! artifact made of a single tar (optionally gzipped) layer is unpacked in
//! memory instead. Registries that answer with a `WWW-Authenticate: Bearer`
//! challenge get the standard token exchange.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use capi_operator_common::kube_utils::sha256_hex;
use capi_operator_common::retry::{retry_with_backoff_if, RetryConfig};
use capi_operator_common::Error;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{ArtifactFiles, ArtifactSource, SourceCredentials, SourceKind};
use crate::http::{HttpFetcher, HttpRequest, HttpResponse};
use crate::metadata::METADATA_FILE;

/// Layer annotation naming the file a layer holds
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Generic components file name accepted in OCI artifacts
pub const GENERIC_COMPONENTS_FILE: &str = "components.yaml";

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// Parsed `registry/repository[:tag]` reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OciReference {
    /// Registry host (with port, if any)
    pub registry: String,
    /// Repository path
    pub repository: String,
    /// Tag, if pinned
    pub tag: Option<String>,
}

impl OciReference {
    /// Parse a reference; an `oci://` prefix is accepted
    pub fn parse(reference: &str) -> Result<Self, Error> {
        let invalid = |why: &str| {
            Error::validation_for_field(
                "oci",
                "spec.fetchConfig.oci",
                format!("invalid OCI reference {:?}: {}", reference, why),
            )
        };
        let trimmed = reference.strip_prefix("oci://").unwrap_or(reference);
        if trimmed.contains('@') {
            return Err(invalid("digest references are not supported, use a tag"));
        }
        let (without_tag, tag) = match trimmed.rsplit_once(':') {
            Some((head, tag)) if !tag.contains('/') => (head, Some(tag)),
            _ => (trimmed, None),
        };
        let (registry, repository) = without_tag
            .split_once('/')
            .ok_or_else(|| invalid("expected registry/repository"))?;
        let looks_like_host =
            registry.contains('.') || registry.contains(':') || registry == "localhost";
        if !looks_like_host || repository.is_empty() {
            return Err(invalid("expected registry/repository"));
        }
        if tag.is_some_and(str::is_empty) {
            return Err(invalid("empty tag"));
        }
        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}/v2/{}/{}", self.registry, self.repository, path)
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OciManifest {
    #[serde(default)]
    layers: Vec<OciDescriptor>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl OciDescriptor {
    fn title(&self) -> Option<&str> {
        self.annotations.get(TITLE_ANNOTATION).map(String::as_str)
    }

    fn is_archive(&self) -> bool {
        let title = self.title().unwrap_or_default();
        self.media_type.contains("tar")
            || title.ends_with(".tar")
            || title.ends_with(".tar.gz")
            || title.ends_with(".tgz")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parse the parameters of a `WWW-Authenticate` challenge.
///
/// Returns the scheme and the `key="value"` pairs; quoted values may contain commas.
fn parse_challenge(header: &str) -> (String, BTreeMap<String, String>) {
    let (scheme, rest) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    let mut params = BTreeMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let value: String = if chars.peek() == Some(&'"') {
            chars.next();
            chars.by_ref().take_while(|c| *c != '"').collect()
        } else {
            chars.by_ref().take_while(|c| *c != ',').collect()
        };
        params.insert(key.trim().to_ascii_lowercase(), value);
    }
    (scheme.to_ascii_lowercase(), params)
}

fn query_escape(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Extract regular files of a tar or tar+gzip blob, keyed by base name
fn unpack_archive(blob: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let reader: Box<dyn Read + '_> = if blob.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(blob))
    } else {
        Box::new(blob)
    };
    let archive_error = |e: std::io::Error| Error::fetch("oci", format!("invalid artifact archive: {}", e));

    let mut archive = tar::Archive::new(reader);
    let mut files = BTreeMap::new();
    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(archive_error)?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let Some(name) = name else { continue };
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(archive_error)?;
        files.insert(name, data);
    }
    Ok(files)
}

/// Source reading OCI artifacts
pub struct OciSource {
    http: Arc<dyn HttpFetcher>,
    reference: OciReference,
    components_file: String,
    credentials: SourceCredentials,
    retry: RetryConfig,
    token: Mutex<Option<String>>,
}

impl OciSource {
    /// Create a source for a reference
    pub fn new(
        http: Arc<dyn HttpFetcher>,
        reference: &str,
        components_file: &str,
        credentials: SourceCredentials,
        retry: RetryConfig,
    ) -> Result<Self, Error> {
        let token = credentials.oci_access_token.clone();
        Ok(Self {
            http,
            reference: OciReference::parse(reference)?,
            components_file: components_file.to_string(),
            credentials,
            retry,
            token: Mutex::new(token),
        })
    }

    fn cached_token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn basic_auth(&self) -> Option<String> {
        match (&self.credentials.oci_username, &self.credentials.oci_password) {
            (Some(user), Some(password)) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", user, password))
            )),
            _ => None,
        }
    }

    async fn exchange_token(&self, params: &BTreeMap<String, String>) -> Result<String, Error> {
        let realm = params
            .get("realm")
            .ok_or_else(|| Error::fetch("oci", "bearer challenge without realm"))?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.reference.repository));
        let mut url = format!("{}?scope={}", realm, query_escape(&scope));
        if let Some(service) = params.get("service") {
            url.push_str(&format!("&service={}", query_escape(service)));
        }
        let mut request = HttpRequest::get(url);
        if let Some(basic) = self.basic_auth() {
            request = request.header("Authorization", basic);
        }
        let response = self.http.get(request).await?;
        if !response.is_success() {
            return Err(Error::fetch_status(
                "oci",
                response.status,
                format!(
                    "token exchange with {} for {} failed: {}",
                    realm, self.reference.registry, response.status
                ),
            ));
        }
        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Error::fetch("oci", format!("invalid token response: {}", e)))?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::fetch("oci", "token response carried no token"))
    }

    async fn get_once(&self, url: &str, accept: Option<&str>) -> Result<HttpResponse, Error> {
        let build = |auth: Option<String>| {
            let mut request = HttpRequest::get(url);
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            if let Some(auth) = auth {
                request = request.header("Authorization", auth);
            }
            request
        };

        let bearer = self.cached_token().map(|t| format!("Bearer {}", t));
        let mut response = self.http.get(build(bearer)).await?;

        if response.status == 401 {
            let challenge = response.header("www-authenticate").unwrap_or_default().to_string();
            let (scheme, params) = parse_challenge(&challenge);
            let auth = match scheme.as_str() {
                "bearer" => {
                    let token = self.exchange_token(&params).await?;
                    if let Ok(mut cached) = self.token.lock() {
                        *cached = Some(token.clone());
                    }
                    Some(format!("Bearer {}", token))
                }
                "basic" => self.basic_auth(),
                _ => None,
            };
            if auth.is_some() {
                trace!(registry = %self.reference.registry, scheme = %scheme, "retrying with credentials");
                response = self.http.get(build(auth)).await?;
            }
        }

        if response.is_success() {
            return Ok(response);
        }
        if response.status == 404 {
            return Err(Error::not_found(format!("{} returned 404", url)));
        }
        Err(Error::fetch_status(
            "oci",
            response.status,
            format!("GET {} returned {}: {}", url, response.status, response.body_snippet()),
        ))
    }

    async fn get(&self, url: &str, accept: Option<&str>) -> Result<HttpResponse, Error> {
        retry_with_backoff_if(
            &self.retry,
            "oci",
            || self.get_once(url, accept),
            |e: &Error| e.is_retryable() && !e.is_not_found(),
        )
        .await
    }

    async fn manifest(&self, tag: &str) -> Result<OciManifest, Error> {
        let url = self.reference.url(&format!("manifests/{}", tag));
        let response = self.get(&url, Some(MANIFEST_ACCEPT)).await.map_err(|e| {
            if e.is_not_found() {
                Error::not_found(format!(
                    "tag {} not found in {}/{}",
                    tag, self.reference.registry, self.reference.repository
                ))
            } else {
                e
            }
        })?;
        serde_json::from_slice(&response.body)
            .map_err(|e| Error::fetch("oci", format!("invalid manifest for {}: {}", tag, e)))
    }

    async fn blob(&self, layer: &OciDescriptor) -> Result<Vec<u8>, Error> {
        let url = self.reference.url(&format!("blobs/{}", layer.digest));
        let body = self.get(&url, None).await?.body;
        let expected = layer
            .digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::fetch("oci", format!("unsupported digest {}", layer.digest)))?;
        let actual = sha256_hex(&body);
        if actual != expected {
            return Err(Error::fetch(
                "oci",
                format!("digest mismatch for {}: got sha256:{}", layer.digest, actual),
            ));
        }
        Ok(body)
    }

    /// Read the first of `candidates` present in the artifact
    async fn read_file(
        &self,
        manifest: &OciManifest,
        candidates: &[&str],
        archive: &mut Option<BTreeMap<String, Vec<u8>>>,
    ) -> Result<Vec<u8>, Error> {
        for name in candidates {
            if let Some(layer) = manifest.layers.iter().find(|l| l.title() == Some(name)) {
                return self.blob(layer).await;
            }
        }

        if archive.is_none() {
            if let [layer] = manifest.layers.as_slice() {
                if layer.is_archive() {
                    *archive = Some(unpack_archive(&self.blob(layer).await?)?);
                }
            }
        }
        archive
            .as_ref()
            .and_then(|files| candidates.iter().find_map(|name| files.get(*name)))
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "file {} not found in {}/{}",
                    candidates.join(" or "),
                    self.reference.registry,
                    self.reference.repository
                ))
            })
    }
}

#[async_trait]
impl ArtifactSource for OciSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Oci
    }

    fn origin(&self) -> String {
        format!(
            "oci://{}/{}#{}",
            self.reference.registry, self.reference.repository, self.components_file
        )
    }

    async fn versions(&self) -> Result<Vec<String>, Error> {
        if let Some(tag) = &self.reference.tag {
            return Ok(vec![tag.clone()]);
        }
        let response = self.get(&self.reference.url("tags/list"), None).await?;
        let list: TagList = serde_json::from_slice(&response.body)
            .map_err(|e| Error::fetch("oci", format!("invalid tag list: {}", e)))?;
        let tags = list.tags.unwrap_or_default();
        debug!(
            registry = %self.reference.registry,
            repository = %self.reference.repository,
            count = tags.len(),
            "listed OCI tags"
        );
        Ok(tags)
    }

    async fn fetch(&self, version: &str, skip_components: bool) -> Result<ArtifactFiles, Error> {
        let manifest = self.manifest(version).await?;
        let mut archive = None;
        let metadata = self
            .read_file(&manifest, &[METADATA_FILE], &mut archive)
            .await?;
        let components = if skip_components {
            Vec::new()
        } else {
            self.read_file(
                &manifest,
                &[self.components_file.as_str(), GENERIC_COMPONENTS_FILE],
                &mut archive,
            )
            .await?
        };
        Ok(ArtifactFiles {
            metadata,
            components,
            manifests: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpFetcher;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    fn layer(title: &str, body: &[u8]) -> serde_json::Value {
        serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": format!("sha256:{}", sha256_hex(body)),
            "size": body.len(),
            "annotations": {TITLE_ANNOTATION: title}
        })
    }

    #[test]
    fn parses_references() {
        let r = OciReference::parse("ghcr.io/org/providers/aws:v2.5.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/providers/aws");
        assert_eq!(r.tag.as_deref(), Some("v2.5.0"));

        let r = OciReference::parse("oci://localhost:5000/aws").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.tag, None);

        assert!(OciReference::parse("org/aws:v1").is_err());
        assert!(OciReference::parse("ghcr.io/aws@sha256:abc").is_err());
        assert!(OciReference::parse("ghcr.io").is_err());
    }

    #[test]
    fn challenge_parameters_keep_quoted_commas() {
        let (scheme, params) = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/aws:pull,push""#,
        );
        assert_eq!(scheme, "bearer");
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["service"], "ghcr.io");
        assert_eq!(params["scope"], "repository:org/aws:pull,push");
    }

    #[tokio::test]
    async fn fetches_titled_layers_and_verifies_digests() {
        let metadata = b"releaseSeries:\n- major: 1\n  minor: 0\n  contract: v1beta1\n".to_vec();
        let components = b"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: x\n".to_vec();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "layers": [layer("metadata.yaml", &metadata), layer("components.yaml", &components)]
        });
        let (m, c) = (metadata.clone(), components.clone());
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(move |req| {
            let url = req.url.as_str();
            if url == "https://ghcr.io/v2/org/aws/manifests/v1.0.0" {
                Ok(HttpResponse::ok(serde_json::to_vec(&manifest).unwrap()))
            } else if url.ends_with(&sha256_hex(&m)) {
                Ok(HttpResponse::ok(m.clone()))
            } else if url.ends_with(&sha256_hex(&c)) {
                Ok(HttpResponse::ok(c.clone()))
            } else {
                Ok(HttpResponse::status(404))
            }
        });
        let source = OciSource::new(
            Arc::new(http),
            "ghcr.io/org/aws",
            "infrastructure-components.yaml",
            SourceCredentials::default(),
            fast_retry(),
        )
        .unwrap();
        let files = source.fetch("v1.0.0", false).await.unwrap();
        assert_eq!(files.metadata, metadata);
        assert_eq!(files.components, components);
    }

    #[tokio::test]
    async fn tampered_blob_is_rejected() {
        let manifest = serde_json::json!({"layers": [layer("metadata.yaml", b"good")]});
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(move |req| {
            if req.url.contains("/manifests/") {
                Ok(HttpResponse::ok(serde_json::to_vec(&manifest).unwrap()))
            } else {
                Ok(HttpResponse::ok("evil"))
            }
        });
        let source = OciSource::new(
            Arc::new(http),
            "ghcr.io/org/aws:v1.0.0",
            "infrastructure-components.yaml",
            SourceCredentials::default(),
            fast_retry(),
        )
        .unwrap();
        let err = source.fetch("v1.0.0", true).await.unwrap_err();
        assert!(err.message().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn single_tarball_layer_is_unpacked() {
        let mut tarball = Vec::new();
        {
            let encoder = GzEncoder::new(&mut tarball, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for (name, body) in [
                ("release/metadata.yaml", &b"releaseSeries: []"[..]),
                ("release/infrastructure-components.yaml", &b"kind: X"[..]),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, body).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        let manifest = serde_json::json!({"layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": format!("sha256:{}", sha256_hex(&tarball)),
        }]});
        let blob = tarball.clone();
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(move |req| {
            if req.url.contains("/manifests/") {
                Ok(HttpResponse::ok(serde_json::to_vec(&manifest).unwrap()))
            } else {
                Ok(HttpResponse::ok(blob.clone()))
            }
        });
        let source = OciSource::new(
            Arc::new(http),
            "registry.local/aws",
            "infrastructure-components.yaml",
            SourceCredentials::default(),
            fast_retry(),
        )
        .unwrap();
        let files = source.fetch("v1.0.0", false).await.unwrap();
        assert_eq!(files.metadata, b"releaseSeries: []");
        assert_eq!(files.components, b"kind: X");
    }

    #[tokio::test]
    async fn bearer_challenge_triggers_token_exchange() {
        let mut http = MockHttpFetcher::new();
        http.expect_get().returning(|req| {
            let auth = req
                .headers
                .iter()
                .find(|(k, _)| k == "Authorization")
                .map(|(_, v)| v.clone());
            if req.url.starts_with("https://auth.io/token") {
                assert!(req.url.contains("scope=repository:org/aws:pull"));
                assert!(req.url.contains("service=ghcr.io"));
                assert_eq!(auth.as_deref(), Some("Basic Ym90OnB3"));
                return Ok(HttpResponse::ok(r#"{"token":"abc"}"#));
            }
            if auth.as_deref() == Some("Bearer abc") {
                return Ok(HttpResponse::ok(r#"{"name":"org/aws","tags":["v1.0.0","v1.1.0"]}"#));
            }
            let mut challenge = HttpResponse::status(401);
            challenge.headers.insert(
                "www-authenticate".to_string(),
                r#"Bearer realm="https://auth.io/token",service="ghcr.io",scope="repository:org/aws:pull""#.to_string(),
            );
            Ok(challenge)
        });
        let credentials = SourceCredentials {
            oci_username: Some("bot".to_string()),
            oci_password: Some("pw".to_string()),
            ..Default::default()
        };
        let source = OciSource::new(
            Arc::new(http),
            "ghcr.io/org/aws",
            "infrastructure-components.yaml",
            credentials,
            fast_retry(),
        )
        .unwrap();
        assert_eq!(source.versions().await.unwrap(), vec!["v1.0.0", "v1.1.0"]);
        assert_eq!(source.cached_token().as_deref(), Some("abc"));
    }
}
