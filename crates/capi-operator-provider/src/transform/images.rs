//! Image references and override rules

use capi_operator_common::Error;
use serde_json::Value;

use super::Stage;
use crate::components::ManifestObject;
use crate::config::ImageOverride;

/// Kinds whose pod templates get image overrides
const WORKLOAD_KINDS: &[&str] = &["Deployment", "DaemonSet"];

/// A container image split at the final path segment.
///
/// `registry.k8s.io/cluster-api/cluster-api-controller:v1.4.3` has repository
/// `registry.k8s.io/cluster-api`, name `cluster-api-controller` and tag
/// `v1.4.3`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Everything before the final `/`, empty for bare names
    pub repository: String,
    /// Final path segment without tag or digest
    pub name: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest (`sha256:...`), if any
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference
    pub fn parse(image: &str) -> Result<Self, Error> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::transform(Stage::Images.as_str(), "empty image reference"));
        }
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };
        let (repository, last) = match rest.rsplit_once('/') {
            Some((repository, last)) => (repository.to_string(), last),
            None => (String::new(), rest),
        };
        let (name, tag) = match last.split_once(':') {
            Some((name, tag)) => (name.to_string(), Some(tag.to_string())),
            None => (last.to_string(), None),
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(Error::transform(
                Stage::Images.as_str(),
                format!("invalid image reference {:?}", image),
            ));
        }
        Ok(Self {
            repository,
            name,
            tag,
            digest,
        })
    }

    /// Replace the tag, dropping any digest
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self.digest = None;
        self
    }

    /// Apply an override rule
    pub fn overridden(mut self, rule: &ImageOverride) -> Self {
        if let Some(repository) = &rule.repository {
            self.repository = repository.trim_end_matches('/').to_string();
        }
        match &rule.tag {
            Some(tag) => self.with_tag(tag),
            None => self,
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.repository.is_empty() {
            write!(f, "{}/", self.repository)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Rewrite every container and init container image of Deployments and DaemonSets
pub fn apply_image_overrides(
    objects: &mut [ManifestObject],
    rule: &ImageOverride,
) -> Result<(), Error> {
    if rule.is_empty() {
        return Ok(());
    }
    for object in objects
        .iter_mut()
        .filter(|o| WORKLOAD_KINDS.contains(&o.kind()))
    {
        let Some(pod_spec) = object.value_mut().pointer_mut("/spec/template/spec") else {
            continue;
        };
        for field in ["containers", "initContainers"] {
            let Some(containers) = pod_spec.get_mut(field).and_then(Value::as_array_mut) else {
                continue;
            };
            for container in containers {
                let Some(image) = container.get("image").and_then(Value::as_str) else {
                    continue;
                };
                let rewritten = ImageRef::parse(image)?.overridden(rule).to_string();
                container["image"] = Value::String(rewritten);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(repository: Option<&str>, tag: Option<&str>) -> ImageOverride {
        ImageOverride {
            repository: repository.map(str::to_string),
            tag: tag.map(str::to_string),
        }
    }

    #[test]
    fn parses_registry_ports_tags_and_digests() {
        let image = ImageRef::parse("localhost:5000/capi/manager:v1.0.0").unwrap();
        assert_eq!(image.repository, "localhost:5000/capi");
        assert_eq!(image.name, "manager");
        assert_eq!(image.tag.as_deref(), Some("v1.0.0"));

        let pinned = ImageRef::parse("gcr.io/x/y@sha256:abc").unwrap();
        assert_eq!(pinned.tag, None);
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(pinned.to_string(), "gcr.io/x/y@sha256:abc");

        assert_eq!(ImageRef::parse("busybox").unwrap().to_string(), "busybox");
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("x/y:").is_err());
    }

    #[test]
    fn override_replaces_repository_and_tag() {
        let image = ImageRef::parse("registry.k8s.io/cluster-api/cluster-api-controller@sha256:abc")
            .unwrap()
            .overridden(&rule(Some("mirror.local/capi/"), Some("v1.5.0")));
        assert_eq!(image.to_string(), "mirror.local/capi/cluster-api-controller:v1.5.0");

        let repo_only = ImageRef::parse("gcr.io/a/b:v1")
            .unwrap()
            .overridden(&rule(Some("quay.io/me"), None));
        assert_eq!(repo_only.to_string(), "quay.io/me/b:v1");
    }

    #[test]
    fn rewrites_containers_and_init_containers_once() {
        let workload = |kind: &str| {
            ManifestObject::from_value(json!({
                "apiVersion": "apps/v1",
                "kind": kind,
                "metadata": {"name": "m"},
                "spec": {"template": {"spec": {
                    "initContainers": [{"name": "init", "image": "gcr.io/a/init:v1"}],
                    "containers": [{"name": "manager", "image": "gcr.io/a/manager:v1"}]
                }}}
            }))
            .unwrap()
        };
        let mut objects = vec![workload("Deployment"), workload("DaemonSet"), workload("StatefulSet")];
        apply_image_overrides(&mut objects, &rule(Some("mirror.local/a"), None)).unwrap();

        for object in &objects[..2] {
            let spec = &object.value()["spec"]["template"]["spec"];
            assert_eq!(spec["containers"][0]["image"], "mirror.local/a/manager:v1");
            assert_eq!(spec["initContainers"][0]["image"], "mirror.local/a/init:v1");
        }
        assert_eq!(
            objects[2].value()["spec"]["template"]["spec"]["containers"][0]["image"],
            "gcr.io/a/manager:v1"
        );
    }
}
