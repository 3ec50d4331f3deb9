//! GitHub release source
//!
//! Accepts clusterctl-style URLs:
//! `https://github.com/{owner}/{repo}/releases/{latest|<tag>}/{file}` or the
//! bare `https://github.com/{owner}/{repo}/releases`. Versions come from the
//! releases API; files are downloaded from the release assets.

use std::sync::Arc;

use async_trait::async_trait;
use capi_operator_common::retry::RetryConfig;
use capi_operator_common::Error;
use serde::Deserialize;
use tracing::debug;

use super::{ArtifactFiles, ArtifactSource, SourceKind};
use crate::http::{get_success, HttpFetcher, HttpRequest};
use crate::metadata::METADATA_FILE;

const GITHUB_HOST: &str = "github.com";
const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 20;
const LATEST: &str = "latest";
const API_ACCEPT: &str = "application/vnd.github+json";

/// Parsed release URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitHubRelease {
    /// Host, `github.com` or an enterprise host
    pub host: String,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Pinned tag; `None` for `latest` or a bare releases URL
    pub tag: Option<String>,
    /// Components file named by the URL
    pub file: Option<String>,
}

impl GitHubRelease {
    /// Parse a release URL
    pub fn parse(url: &str) -> Result<Self, Error> {
        let invalid = |why: &str| {
            Error::validation_for_field(
                "github",
                "spec.fetchConfig.url",
                format!("invalid GitHub release URL {:?}: {}", url, why),
            )
        };
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| invalid("scheme must be https"))?;
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

        let (host, owner, repo, releases) = match segments.as_slice() {
            [host, owner, repo, releases, ..] => (*host, *owner, *repo, *releases),
            _ => return Err(invalid("expected {host}/{owner}/{repo}/releases")),
        };
        if releases != "releases" || owner.is_empty() || repo.is_empty() {
            return Err(invalid("expected {host}/{owner}/{repo}/releases"));
        }

        let (tag, file) = match &segments[4..] {
            [] => (None, None),
            ["download", tag, file] => (Some(*tag), Some(*file)),
            [tag, file] if *tag != "download" => (Some(*tag), Some(*file)),
            [tag] if *tag != "download" => (Some(*tag), None),
            _ => return Err(invalid("unexpected path after /releases")),
        };

        Ok(Self {
            host: host.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            tag: tag
                .filter(|t| *t != LATEST && !t.is_empty())
                .map(str::to_string),
            file: file.filter(|f| !f.is_empty()).map(str::to_string),
        })
    }

    /// REST API base for the host
    pub fn api_base(&self) -> String {
        api_base(&self.host)
    }

    /// Asset download URL
    pub fn download_url(&self, tag: &str, file: &str) -> String {
        format!(
            "https://{}/{}/{}/releases/download/{}/{}",
            self.host, self.owner, self.repo, tag, file
        )
    }
}

fn api_base(host: &str) -> String {
    if host == GITHUB_HOST {
        "https://api.github.com".to_string()
    } else {
        format!("https://{}/api/v3", host)
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    draft: bool,
}

/// Source reading GitHub release assets
pub struct GitHubSource {
    http: Arc<dyn HttpFetcher>,
    release: GitHubRelease,
    components_file: String,
    token: Option<String>,
    retry: RetryConfig,
}

impl GitHubSource {
    /// Create a source. `default_components_file` is used when the URL names no file.
    pub fn new(
        http: Arc<dyn HttpFetcher>,
        url: &str,
        default_components_file: &str,
        token: Option<String>,
        retry: RetryConfig,
    ) -> Result<Self, Error> {
        let release = GitHubRelease::parse(url)?;
        let components_file = release
            .file
            .clone()
            .unwrap_or_else(|| default_components_file.to_string());
        Ok(Self {
            http,
            release,
            components_file,
            token,
            retry,
        })
    }

    /// The parsed URL
    pub fn release(&self) -> &GitHubRelease {
        &self.release
    }

    async fn download(&self, tag: &str, file: &str) -> Result<Vec<u8>, Error> {
        let request =
            HttpRequest::get(self.release.download_url(tag, file)).bearer(self.token.as_deref());
        match get_success(self.http.as_ref(), &request, SourceKind::GitHub.as_str(), &self.retry)
            .await
        {
            Ok(response) => Ok(response.body),
            Err(e) if e.is_not_found() => Err(Error::not_found(format!(
                "file {} not found in release {} of {}/{}",
                file, tag, self.release.owner, self.release.repo
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ArtifactSource for GitHubSource {
    fn kind(&self) -> SourceKind {
        SourceKind::GitHub
    }

    fn origin(&self) -> String {
        format!(
            "https://{}/{}/{}#{}",
            self.release.host, self.release.owner, self.release.repo, self.components_file
        )
    }

    async fn versions(&self) -> Result<Vec<String>, Error> {
        if let Some(tag) = &self.release.tag {
            return Ok(vec![tag.clone()]);
        }

        let mut tags = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/repos/{}/{}/releases?per_page={}&page={}",
                self.release.api_base(),
                self.release.owner,
                self.release.repo,
                PER_PAGE,
                page
            );
            let request = HttpRequest::get(url)
                .header("Accept", API_ACCEPT)
                .bearer(self.token.as_deref());
            let response =
                get_success(self.http.as_ref(), &request, SourceKind::GitHub.as_str(), &self.retry)
                    .await?;
            let releases: Vec<Release> = serde_json::from_slice(&response.body).map_err(|e| {
                Error::fetch("github", format!("invalid releases response: {}", e))
            })?;
            let count = releases.len();
            tags.extend(
                releases
                    .into_iter()
                    .filter(|r| !r.draft)
                    .map(|r| r.tag_name),
            );
            if count < PER_PAGE {
                break;
            }
        }
        debug!(
            owner = %self.release.owner,
            repo = %self.release.repo,
            count = tags.len(),
            "listed GitHub releases"
        );
        Ok(tags)
    }

    async fn fetch(&self, version: &str, skip_components: bool) -> Result<ArtifactFiles, Error> {
        let metadata = self.download(version, METADATA_FILE).await?;
        let components = if skip_components {
            Vec::new()
        } else {
            self.download(version, &self.components_file).await?
        };
        Ok(ArtifactFiles {
            metadata,
            components,
            manifests: None,
        })
    }
}

/// Check a token with a call every valid token may make.
///
/// 401 and 403 come back as non-retryable fetch errors carrying the status.
pub async fn verify_token(
    http: &dyn HttpFetcher,
    host: &str,
    token: &str,
    retry: &RetryConfig,
) -> Result<(), Error> {
    let request = HttpRequest::get(format!("{}/rate_limit", api_base(host)))
        .header("Accept", API_ACCEPT)
        .bearer(Some(token));
    get_success(http, &request, SourceKind::GitHub.as_str(), retry)
        .await
        .map(|_| ())
}
