//! Shared Kubernetes utilities using kube-rs
//!
//! Server-side apply of arbitrary objects through API discovery, readiness
//! polling and the small parsing helpers the installer relies on.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, Config};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Deployment condition signalling enough replicas are serving
pub const CONDITION_AVAILABLE: &str = "Available";

/// Well-known kinds that never live in a namespace.
///
/// Only consulted for kinds that [`ResourceScopes`] has not seen, i.e. kinds
/// the cluster does not serve yet and no CRD in the same install defines.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "ValidatingAdmissionPolicy",
    "ValidatingAdmissionPolicyBinding",
    "APIService",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
    "Node",
    "ClusterIssuer",
    "CSIDriver",
    "RuntimeClass",
    "IngressClass",
];

/// Whether a kind is cluster-scoped
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Whether each kind is cluster-scoped, keyed by API group and kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceScopes {
    cluster_scoped: BTreeMap<(String, String), bool>,
}

impl ResourceScopes {
    /// Scopes of every kind the cluster serves
    pub fn from_discovery(discovery: &Discovery) -> Self {
        let mut scopes = Self::default();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                scopes.insert(&resource.group, &resource.kind, caps.scope == Scope::Cluster);
            }
        }
        scopes
    }

    /// Record the scope of one kind
    pub fn insert(&mut self, group: &str, kind: &str, cluster_scoped: bool) {
        self.cluster_scoped
            .insert((group.to_string(), kind.to_string()), cluster_scoped);
    }

    /// Record the kinds defined by the CustomResourceDefinitions among `objects`.
    ///
    /// These win over discovery: they are what is about to be applied.
    pub fn learn_from_crds<'a>(&mut self, objects: impl IntoIterator<Item = &'a serde_json::Value>) {
        for crd in objects
            .into_iter()
            .filter(|o| object_kind(o) == "CustomResourceDefinition")
        {
            let spec = &crd["spec"];
            let (Some(group), Some(kind), Some(scope)) = (
                spec["group"].as_str(),
                spec["names"]["kind"].as_str(),
                spec["scope"].as_str(),
            ) else {
                continue;
            };
            self.insert(group, kind, scope == "Cluster");
        }
    }

    /// Whether objects of this kind are cluster-scoped
    pub fn is_cluster_scoped(&self, api_version: &str, kind: &str) -> bool {
        let (group, _) = parse_api_version(api_version);
        self.cluster_scoped
            .get(&(group, kind.to_string()))
            .copied()
            .unwrap_or_else(|| is_cluster_scoped_kind(kind))
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use capi_operator_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build a GroupVersionKind from apiVersion and kind strings
pub fn gvk_from(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = parse_api_version(api_version);
    GroupVersionKind::gvk(&group, &version, kind)
}

/// Build an ApiResource from an apiVersion and kind without discovery.
///
/// The plural is guessed; only use this for kinds whose plural is regular.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let gvk = gvk_from(api_version, kind);
    ApiResource::from_gvk_with_plural(&gvk, &pluralize_kind(kind))
}

/// Lowercase plural of a kind using English rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
///
/// CRDs go before namespaces so that a namespace-scoped custom resource in a
/// brand-new namespace can be resolved after a single re-discovery.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "CustomResourceDefinition" => 0,
        "Namespace" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Issuer" | "Certificate" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 9,
        _ => 10,
    }
}

/// Whether a deployment has rolled out: Available, fully updated and observed.
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let generation = deployment.metadata.generation.unwrap_or_default();
    if status.observed_generation.unwrap_or_default() < generation {
        return false;
    }
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if status.updated_replicas.unwrap_or_default() < desired {
        return false;
    }
    status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|c| c.type_ == CONDITION_AVAILABLE && c.status == "True")
    })
}

/// Poll until a condition is met, backing off exponentially between checks.
///
/// The check returns `Ok(true)` when done, `Ok(false)` to keep waiting. Errors
/// from the check are logged and retried; only the deadline ends the wait.
pub async fn poll_with_backoff<F, Fut>(
    timeout: Duration,
    backoff: &RetryConfig,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(attempt, "Polling condition not yet met"),
            Err(e) => trace!(attempt, error = %e, "Polling check returned error (retrying)"),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::timeout(timeout_msg));
        }
        let delay = backoff.delay_for_attempt(attempt).min(timeout - elapsed);
        tokio::time::sleep(delay).await;
    }
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Run API discovery with retry.
///
/// Aggregated APIs registered by freshly installed providers can make
/// discovery fail for a few seconds, so a handful of spaced retries are made.
pub async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    };
    retry_with_backoff(&config, "api-discovery", || {
        let client = client.clone();
        async move {
            Discovery::new(client)
                .run()
                .await
                .map_err(|e| Error::internal_with_context("api-discovery", e.to_string()))
        }
    })
    .await
}

/// Resolve a GVK through discovery, returning the resource and whether it is namespaced
pub fn resolve_resource(
    discovery: &Discovery,
    api_version: &str,
    kind: &str,
) -> Option<(ApiResource, bool)> {
    let gvk = gvk_from(api_version, kind);
    discovery
        .resolve_gvk(&gvk)
        .map(|(ar, caps)| (ar, caps.scope == Scope::Namespaced))
}

/// Dynamic API handle for an object, honoring its scope
pub fn dynamic_api(
    client: &Client,
    resource: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, resource),
        (true, None) => Api::default_namespaced_with(client.clone(), resource),
        (false, _) => Api::all_with(client.clone(), resource),
    }
}

/// Options for applying objects
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Field owner recorded in managedFields
    pub field_manager: String,
    /// Skip objects whose kind is not served by the cluster
    pub skip_missing_crds: bool,
}

impl ApplyOptions {
    /// Options with the given field owner
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            skip_missing_crds: false,
        }
    }
}

/// Apply one object with server-side apply using API discovery
pub async fn apply_object_with_discovery(
    client: &Client,
    discovery: &Discovery,
    obj: &serde_json::Value,
    options: &ApplyOptions,
) -> Result<(), Error> {
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let name = obj
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization_for_kind(kind, "object is missing metadata.name"))?;
    let namespace = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());

    let Some((resource, namespaced)) = resolve_resource(discovery, api_version, kind) else {
        if options.skip_missing_crds {
            trace!(kind = %kind, name = %name, "skipping object - kind not served");
            return Ok(());
        }
        return Err(Error::install(format!(
            "unknown resource type: {}/{}",
            api_version, kind
        )));
    };

    let params = PatchParams::apply(&options.field_manager).force();
    let api = dynamic_api(client, &resource, namespaced, namespace);
    api.patch(name, &params, &Patch::Apply(obj))
        .await
        .map_err(|e| Error::install(format!("failed to apply {}/{}: {}", kind, name, e)))?;

    trace!(kind = %kind, name = %name, namespace = ?namespace, "applied object");
    Ok(())
}

fn object_kind(obj: &serde_json::Value) -> &str {
    obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default()
}

/// Order objects for apply: by kind priority, then grouped by apiVersion/kind,
/// keeping manifest order within a group.
pub fn apply_order(objects: &[serde_json::Value]) -> Vec<&serde_json::Value> {
    let mut ordered: Vec<&serde_json::Value> = objects.iter().collect();
    ordered.sort_by_key(|o| {
        let api_version = o.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        (kind_priority(object_kind(o)), format!("{}/{}", api_version, object_kind(o)))
    });
    ordered
}

/// Apply objects with proper ordering and discovery.
///
/// 1. CRDs, then Namespaces, fail-fast.
/// 2. Re-run discovery if CRDs were applied.
/// 3. Everything else best-effort, returning the first error after trying all.
pub async fn apply_objects_with_discovery(
    client: &Client,
    objects: &[serde_json::Value],
    options: &ApplyOptions,
) -> Result<(), Error> {
    if objects.is_empty() {
        return Ok(());
    }

    let ordered = apply_order(objects);
    let (foundational, rest): (Vec<&serde_json::Value>, Vec<&serde_json::Value>) = ordered
        .into_iter()
        .partition(|o| matches!(object_kind(o), "CustomResourceDefinition" | "Namespace"));
    let has_crds = foundational
        .iter()
        .any(|o| object_kind(o) == "CustomResourceDefinition");

    let mut discovery = run_discovery(client).await?;
    for obj in &foundational {
        apply_object_with_discovery(client, &discovery, obj, options).await?;
    }
    if has_crds && !rest.is_empty() {
        discovery = run_discovery(client).await?;
    }

    let mut first_error: Option<Error> = None;
    let mut failed = 0usize;
    for obj in &rest {
        if let Err(e) = apply_object_with_discovery(client, &discovery, obj, options).await {
            failed += 1;
            warn!(
                error = %e,
                kind = %object_kind(obj),
                "object apply failed, continuing with remaining objects"
            );
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => {
            warn!(failed, total = objects.len(), "some objects failed to apply");
            Err(e)
        }
        None => {
            debug!(total = objects.len(), "applied all objects");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn deployment(generation: i64, observed: i64, replicas: i32, updated: i32, available: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("capi-controller-manager".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(updated),
                conditions: Some(vec![DeploymentCondition {
                    type_: CONDITION_AVAILABLE.to_string(),
                    status: available.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn deployment_readiness_requires_rollout_and_availability() {
        assert!(is_deployment_ready(&deployment(2, 2, 1, 1, "True")));
        assert!(!is_deployment_ready(&deployment(3, 2, 1, 1, "True")));
        assert!(!is_deployment_ready(&deployment(2, 2, 2, 1, "True")));
        assert!(!is_deployment_ready(&deployment(2, 2, 1, 1, "False")));
        assert!(!is_deployment_ready(&Deployment::default()));
    }

    #[test]
    fn apply_order_puts_crds_then_namespaces_first() {
        let objects = vec![
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}}),
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}}),
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}}),
            json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": "c"}}),
            json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "sa"}}),
        ];
        let kinds: Vec<&str> = apply_order(&objects).into_iter().map(object_kind).collect();
        assert_eq!(
            kinds,
            vec!["CustomResourceDefinition", "Namespace", "ServiceAccount", "Service", "Deployment"]
        );
    }

    #[test]
    fn apply_order_groups_by_gvk_and_is_stable() {
        let objects = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}}),
            json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "x"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}),
        ];
        let names: Vec<&str> = apply_order(&objects)
            .into_iter()
            .map(|o| o["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["b", "a", "x"]);
    }

    #[test]
    fn cluster_scoped_kinds() {
        assert!(is_cluster_scoped_kind("CustomResourceDefinition"));
        assert!(is_cluster_scoped_kind("ClusterRoleBinding"));
        assert!(!is_cluster_scoped_kind("Deployment"));
        assert!(!is_cluster_scoped_kind("Role"));
    }

    #[test]
    fn scopes_prefer_crds_then_discovery_then_known_kinds() {
        let mut scopes = ResourceScopes::default();
        // discovery says a kind the static list calls cluster-scoped is namespaced
        scopes.insert("example.io", "Node", false);
        scopes.insert("infrastructure.cluster.x-k8s.io", "AWSClusterStaticIdentity", true);
        scopes.learn_from_crds(&[serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "awsclusterstaticidentities.infrastructure.cluster.x-k8s.io"},
            "spec": {
                "group": "infrastructure.cluster.x-k8s.io",
                "names": {"kind": "AWSClusterStaticIdentity", "plural": "awsclusterstaticidentities"},
                "scope": "Namespaced"
            }
        })]);

        assert!(!scopes.is_cluster_scoped("example.io/v1", "Node"));
        assert!(!scopes.is_cluster_scoped(
            "infrastructure.cluster.x-k8s.io/v1beta2",
            "AWSClusterStaticIdentity"
        ));
        // unseen kinds fall back to the known list
        assert!(scopes.is_cluster_scoped("v1", "Node"));
        assert!(!scopes.is_cluster_scoped("apps/v1", "Deployment"));
    }

    #[test]
    fn pluralization() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_with_backoff_times_out() {
        let backoff = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        let err = poll_with_backoff(Duration::from_secs(3), &backoff, "never ready", || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("never ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_with_backoff_retries_check_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        poll_with_backoff(Duration::from_secs(60), &RetryConfig::default(), "x", || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::internal("api hiccup")),
                    1 => Ok(false),
                    _ => Ok(true),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
