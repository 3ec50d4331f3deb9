//! Deployment customization from `spec.deployment`, `spec.manager` and
//! `spec.additionalDeployments`

use capi_operator_common::crd::{ContainerSpec, DeploymentSpec, ManagerSpec, ProviderSpec};
use capi_operator_common::Error;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use tracing::debug;

use super::images::ImageRef;
use super::Stage;
use crate::components::ManifestObject;

/// Container receiving manager flags
pub const MANAGER_CONTAINER: &str = "manager";

const MANAGER_SUFFIX: &str = "-controller-manager";

/// The provider's own manager Deployment.
///
/// The Deployment named `*-controller-manager`, or the only Deployment.
pub fn default_deployment_name(objects: &[ManifestObject]) -> Option<String> {
    let deployments: Vec<&ManifestObject> =
        objects.iter().filter(|o| o.kind() == "Deployment").collect();
    deployments
        .iter()
        .find(|d| d.name().ends_with(MANAGER_SUFFIX))
        .or_else(|| match deployments.as_slice() {
            [only] => Some(only),
            _ => None,
        })
        .map(|d| d.name().to_string())
}

/// Normalize a flag key to `--key`
fn flag(key: &str) -> String {
    format!("--{}", key.trim_start_matches('-'))
}

/// Merge `--key=value` flags: existing flags with the same key are replaced
/// in place, new ones are appended in order.
pub fn merge_args<I, K, V>(args: &mut Vec<String>, overrides: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    for (key, value) in overrides {
        let flag = flag(key.as_ref());
        let rendered = format!("{}={}", flag, value.as_ref());
        let prefix = format!("{}=", flag);
        match args
            .iter_mut()
            .find(|arg| **arg == flag || arg.starts_with(&prefix))
        {
            Some(existing) => *existing = rendered,
            None => args.push(rendered),
        }
    }
}

/// Manager settings as flag pairs
pub fn manager_flags(manager: &ManagerSpec) -> Vec<(String, String)> {
    let mut flags = Vec::new();
    if !manager.feature_gates.is_empty() {
        let gates: Vec<String> = manager
            .feature_gates
            .iter()
            .map(|(gate, enabled)| format!("{}={}", gate, enabled))
            .collect();
        flags.push(("feature-gates".to_string(), gates.join(",")));
    }
    let mut push = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            flags.push((key.to_string(), value));
        }
    };
    push("v", manager.verbosity.map(|v| v.to_string()));
    push("sync-period", manager.sync_period.clone());
    push(
        "concurrency",
        manager.max_concurrent_reconciles.map(|c| c.to_string()),
    );
    push("profiler-address", manager.profiler_address.clone());
    push("health-addr", manager.health_addr.clone());
    push("metrics-bind-addr", manager.metrics_bind_addr.clone());
    push("leader-elect", manager.leader_elect.map(|l| l.to_string()));
    flags
}

fn customize_container(container: &mut Container, spec: &ContainerSpec) -> Result<(), Error> {
    if let Some(image_url) = spec.image_url.as_deref().filter(|u| !u.is_empty()) {
        let image = match image_url.strip_prefix(':') {
            Some(tag) => {
                let current = container.image.as_deref().ok_or_else(|| {
                    Error::transform(
                        Stage::Deployment.as_str(),
                        format!("container {} has no image to retag", container.name),
                    )
                })?;
                ImageRef::parse(current)
                    .map_err(|e| Error::transform(Stage::Deployment.as_str(), e.message()))?
                    .with_tag(tag)
                    .to_string()
            }
            None => image_url.to_string(),
        };
        container.image = Some(image);
    }

    if !spec.env.is_empty() {
        let env = container.env.get_or_insert_with(Vec::new);
        for var in &spec.env {
            match env.iter_mut().find(|e| e.name == var.name) {
                Some(existing) => *existing = var.clone(),
                None => env.push(var.clone()),
            }
        }
    }
    if let Some(resources) = &spec.resources {
        container.resources = Some(resources.clone());
    }
    if !spec.command.is_empty() {
        container.command = Some(spec.command.clone());
    }
    if !spec.args.is_empty() {
        merge_args(container.args.get_or_insert_with(Vec::new), &spec.args);
    }
    Ok(())
}

fn customize_pod(pod: &mut PodSpec, spec: &DeploymentSpec) {
    if !spec.node_selector.is_empty() {
        pod.node_selector = Some(spec.node_selector.clone());
    }
    if !spec.tolerations.is_empty() {
        pod.tolerations = Some(spec.tolerations.clone());
    }
    if let Some(affinity) = &spec.affinity {
        pod.affinity = Some(affinity.clone());
    }
    if let Some(account) = &spec.service_account_name {
        pod.service_account_name = Some(account.clone());
    }
    if !spec.image_pull_secrets.is_empty() {
        pod.image_pull_secrets = Some(spec.image_pull_secrets.clone());
    }
}

/// Apply overrides to one typed Deployment
pub fn customize_deployment(
    deployment: &mut Deployment,
    overrides: Option<&DeploymentSpec>,
    manager: Option<&ManagerSpec>,
) -> Result<(), Error> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let Some(spec) = deployment.spec.as_mut() else {
        return Err(Error::transform(
            Stage::Deployment.as_str(),
            format!("deployment {} has no spec", name),
        ));
    };
    let pod = spec.template.spec.get_or_insert_with(PodSpec::default);

    if let Some(manager) = manager {
        let flags = manager_flags(manager);
        let target = match pod.containers.iter().position(|c| c.name == MANAGER_CONTAINER) {
            Some(index) => Some(index),
            None if pod.containers.len() == 1 => Some(0),
            None => None,
        };
        match target {
            Some(index) => merge_args(pod.containers[index].args.get_or_insert_with(Vec::new), flags),
            None => debug!(deployment = %name, "no manager container, manager flags ignored"),
        }
    }

    if let Some(overrides) = overrides {
        if let Some(replicas) = overrides.replicas {
            spec.replicas = Some(replicas);
        }
        customize_pod(pod, overrides);
        for container_spec in &overrides.containers {
            match pod.containers.iter_mut().find(|c| c.name == container_spec.name) {
                Some(container) => customize_container(container, container_spec)?,
                None => debug!(
                    deployment = %name,
                    container = %container_spec.name,
                    "container not found, override ignored"
                ),
            }
        }
    }
    Ok(())
}

/// Customize the manager Deployment and any named additional Deployments
pub fn customize_deployments(objects: &mut [ManifestObject], spec: &ProviderSpec) -> Result<(), Error> {
    let default_name = default_deployment_name(objects);

    for object in objects.iter_mut().filter(|o| o.kind() == "Deployment") {
        let name = object.name().to_string();
        let (overrides, manager) = if default_name.as_deref() == Some(name.as_str()) {
            (spec.deployment.as_ref(), spec.manager.as_ref())
        } else if let Some(extra) = spec.additional_deployments.get(&name) {
            (extra.deployment.as_ref(), extra.manager.as_ref())
        } else {
            continue;
        };
        if overrides.is_none() && manager.is_none() {
            continue;
        }

        let failed = |e: String| {
            Error::transform(Stage::Deployment.as_str(), format!("deployment {}: {}", name, e))
        };
        let mut deployment: Deployment = serde_json::from_value(object.value().clone())
            .map_err(|e| failed(format!("malformed: {}", e)))?;
        let before = serde_json::to_value(&deployment).map_err(|e| failed(e.to_string()))?;
        customize_deployment(&mut deployment, overrides, manager)?;
        let after = serde_json::to_value(&deployment).map_err(|e| failed(e.to_string()))?;

        // replay only the changes onto the manifest; fields the typed model
        // does not know survive untouched
        let changes = json_patch::diff(&before, &after);
        let mut value = object.value().clone();
        json_patch::patch(&mut value, &changes.0).map_err(|e| failed(e.to_string()))?;
        *object = ManifestObject::from_value(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capi_operator_common::crd::AdditionalDeployment;
    use k8s_openapi::api::core::v1::EnvVar;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn deployment(name: &str) -> ManifestObject {
        ManifestObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "capi-system"},
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{
                        "name": "manager",
                        "image": "registry.k8s.io/cluster-api/cluster-api-controller:v1.4.3",
                        "args": ["--leader-elect", "--v=2", "--metrics-bind-addr=:8080"],
                        "env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]
                    }]}
                }
            }
        }))
        .unwrap()
    }

    fn container<'a>(object: &'a ManifestObject) -> &'a serde_json::Value {
        &object.value()["spec"]["template"]["spec"]["containers"][0]
    }

    #[test]
    fn args_replace_in_place_and_append_new() {
        let mut args = vec!["--v=2".to_string(), "--leader-elect".to_string(), "other".to_string()];
        merge_args(&mut args, [("v", "5"), ("--leader-elect", "false"), ("new-flag", "x")]);
        assert_eq!(args, vec!["--v=5", "--leader-elect=false", "other", "--new-flag=x"]);
    }

    #[test]
    fn default_deployment_is_the_controller_manager() {
        let objects = vec![deployment("webhook"), deployment("capi-controller-manager")];
        assert_eq!(
            default_deployment_name(&objects).as_deref(),
            Some("capi-controller-manager")
        );
        assert_eq!(default_deployment_name(&[deployment("only")]).as_deref(), Some("only"));
        assert_eq!(default_deployment_name(&[deployment("a"), deployment("b")]), None);
    }

    #[test]
    fn container_overrides_are_applied() {
        let mut objects = vec![deployment("capi-controller-manager")];
        let spec = ProviderSpec {
            deployment: Some(DeploymentSpec {
                replicas: Some(3),
                node_selector: BTreeMap::from([("role".to_string(), "infra".to_string())]),
                service_account_name: Some("custom".to_string()),
                containers: vec![ContainerSpec {
                    name: "manager".to_string(),
                    image_url: Some(":v1.4.4".to_string()),
                    args: BTreeMap::from([("v".to_string(), "4".to_string())]),
                    env: vec![
                        EnvVar { name: "B".to_string(), value: Some("two".to_string()), ..Default::default() },
                        EnvVar { name: "C".to_string(), value: Some("3".to_string()), ..Default::default() },
                    ],
                    command: vec!["/manager".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        customize_deployments(&mut objects, &spec).unwrap();

        let value = objects[0].value();
        assert_eq!(value["spec"]["replicas"], 3);
        assert_eq!(value["spec"]["template"]["spec"]["nodeSelector"]["role"], "infra");
        assert_eq!(value["spec"]["template"]["spec"]["serviceAccountName"], "custom");
        let c = container(&objects[0]);
        assert_eq!(c["image"], "registry.k8s.io/cluster-api/cluster-api-controller:v1.4.4");
        assert_eq!(c["args"], json!(["--leader-elect", "--v=4", "--metrics-bind-addr=:8080"]));
        assert_eq!(c["env"][1]["value"], "two");
        assert_eq!(c["env"][2]["name"], "C");
        assert_eq!(c["command"], json!(["/manager"]));
    }

    #[test]
    fn full_image_url_replaces_the_image() {
        let mut objects = vec![deployment("capi-controller-manager")];
        let spec = ProviderSpec {
            deployment: Some(DeploymentSpec {
                containers: vec![ContainerSpec {
                    name: "manager".to_string(),
                    image_url: Some("quay.io/me/capi:dev".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        customize_deployments(&mut objects, &spec).unwrap();
        assert_eq!(container(&objects[0])["image"], "quay.io/me/capi:dev");
    }

    #[test]
    fn manager_flags_render_on_the_manager_container() {
        let mut objects = vec![deployment("capi-controller-manager"), deployment("capi-webhook")];
        let manager = ManagerSpec {
            feature_gates: BTreeMap::from([
                ("MachinePool".to_string(), true),
                ("ClusterTopology".to_string(), false),
            ]),
            verbosity: Some(5),
            leader_elect: Some(false),
            ..Default::default()
        };
        let spec = ProviderSpec {
            manager: Some(manager),
            additional_deployments: BTreeMap::from([(
                "capi-webhook".to_string(),
                AdditionalDeployment {
                    deployment: Some(DeploymentSpec {
                        replicas: Some(2),
                        ..Default::default()
                    }),
                    manager: None,
                },
            )]),
            ..Default::default()
        };
        customize_deployments(&mut objects, &spec).unwrap();

        assert_eq!(
            container(&objects[0])["args"],
            json!([
                "--leader-elect=false",
                "--v=5",
                "--metrics-bind-addr=:8080",
                "--feature-gates=ClusterTopology=false,MachinePool=true"
            ])
        );
        assert_eq!(objects[1].value()["spec"]["replicas"], 2);
        assert_eq!(
            container(&objects[1])["args"],
            json!(["--leader-elect", "--v=2", "--metrics-bind-addr=:8080"])
        );
    }

    #[test]
    fn fields_unknown_to_the_typed_model_survive() {
        let mut object = deployment("capa-controller-manager");
        let mut value = object.value().clone();
        value["spec"]["template"]["spec"]["containers"][0]["resizePolicy2"] = json!("keep");
        value["spec"]["futureField"] = json!({"enabled": true});
        object = ManifestObject::from_value(value).unwrap();
        let mut objects = vec![object];
        let spec = ProviderSpec {
            manager: Some(ManagerSpec {
                verbosity: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        customize_deployments(&mut objects, &spec).unwrap();

        let value = objects[0].value();
        assert_eq!(value["spec"]["futureField"]["enabled"], true);
        let manager = container(&objects[0]);
        assert_eq!(manager["resizePolicy2"], "keep");
        assert!(manager["args"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "--v=5"));
    }

    #[test]
    fn untouched_deployments_are_left_alone() {
        let mut objects = vec![deployment("a"), deployment("b")];
        let before = objects.clone();
        customize_deployments(&mut objects, &ProviderSpec::default()).unwrap();
        assert_eq!(objects, before);
    }
}
