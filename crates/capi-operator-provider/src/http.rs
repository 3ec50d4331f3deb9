//! HTTP access for remote artifact sources
//!
//! Sources talk to GitHub and OCI registries through [`HttpFetcher`] so the
//! whole pipeline can run against canned responses in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use capi_operator_common::retry::{retry_with_backoff_if, RetryConfig};
use capi_operator_common::Error;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

/// User agent sent on every request
pub const USER_AGENT: &str = concat!("capi-operator/", env!("CARGO_PKG_VERSION"));

/// Default request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A GET request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute URL
    pub url: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Request for a URL with no extra headers
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add `Authorization: Bearer <token>` when a token is given
    pub fn bearer(self, token: Option<&str>) -> Self {
        match token {
            Some(token) => self.header("Authorization", format!("Bearer {}", token)),
            None => self,
        }
    }
}

/// A response with the body fully read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers, names lowercased
    pub headers: BTreeMap<String, String>,
    /// Body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 200 response with the given body
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Response with a status and empty body
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value by lowercase name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body as lossy UTF-8, truncated for error messages
    pub fn body_snippet(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(200).collect()
    }
}

/// Trait abstracting HTTP GETs so sources can be tested without a network
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Perform a GET and return the response whatever its status.
    ///
    /// Only transport failures (DNS, TLS, connection reset) are errors.
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, Error>;
}

/// Production fetcher backed by reqwest with rustls
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Build a fetcher with the default timeout and user agent
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::internal_with_context("http", format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::fetch("http", format!("GET {} failed: {}", request.url, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                Error::fetch("http", format!("reading body of {} failed: {}", request.url, e))
            })?
            .to_vec();

        trace!(url = %request.url, status, bytes = body.len(), "HTTP GET");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// GET that requires a 2xx, retrying transport errors and retryable statuses.
///
/// 404 becomes [`Error::NotFound`]; other failures become fetch errors
/// tagged with `source_kind`.
pub async fn get_success(
    http: &dyn HttpFetcher,
    request: &HttpRequest,
    source_kind: &str,
    retry: &RetryConfig,
) -> Result<HttpResponse, Error> {
    retry_with_backoff_if(
        retry,
        source_kind,
        || async move {
            let response = http.get(request.clone()).await?;
            if response.is_success() {
                return Ok(response);
            }
            if response.status == 404 {
                return Err(Error::not_found(format!("{} returned 404", request.url)));
            }
            Err(Error::fetch_status(
                source_kind,
                response.status,
                format!(
                    "GET {} returned {}: {}",
                    request.url,
                    response.status,
                    response.body_snippet()
                ),
            ))
        },
        |e: &Error| e.is_retryable() && !e.is_not_found(),
    )
    .await
}
