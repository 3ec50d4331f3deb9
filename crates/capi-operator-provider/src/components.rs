//! Rendered provider components
//!
//! A components file is a multi-document YAML stream with `${VAR}`
//! placeholders. It is rendered against the provider's config secret, parsed
//! into [`ManifestObject`]s in stream order, and labeled so installed objects
//! can be found again for upgrades and deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use capi_operator_common::{yaml, Error, CLUSTERCTL_LABEL, MANAGED_BY_LABEL, PROVIDER_LABEL};
use serde_json::{Map, Value};

/// Secret keys holding credentials rather than template variables
pub const RESERVED_SECRET_KEYS: &[&str] = &[
    "github-token",
    "oci-username",
    "oci-password",
    "oci-access-token",
];

/// Identity of an object in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// apiVersion, e.g. `apps/v1`
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Group part of the apiVersion (empty for the core group)
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default()
    }

    /// Same object ignoring the API version.
    ///
    /// Upgrades may move a kind to a newer version; that is still the same object.
    pub fn same_object(&self, other: &ObjectKey) -> bool {
        self.group() == other.group()
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// One object of a manifest set
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestObject {
    value: Value,
}

impl ManifestObject {
    /// Wrap a parsed document, requiring apiVersion, kind and metadata.name
    pub fn from_value(value: Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::serialization("manifest document is not a mapping"));
        }
        let object = Self { value };
        if object.api_version().is_empty() || object.kind().is_empty() {
            return Err(Error::serialization(
                "manifest document is missing apiVersion or kind",
            ));
        }
        if object.name().is_empty() {
            return Err(Error::serialization_for_kind(
                object.kind(),
                "manifest document is missing metadata.name",
            ));
        }
        Ok(object)
    }

    fn str_at(&self, pointer: &str) -> &str {
        self.value
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// apiVersion
    pub fn api_version(&self) -> &str {
        self.str_at("/apiVersion")
    }

    /// Kind
    pub fn kind(&self) -> &str {
        self.str_at("/kind")
    }

    /// metadata.name
    pub fn name(&self) -> &str {
        self.str_at("/metadata/name")
    }

    /// metadata.namespace, if set and non-empty
    pub fn namespace(&self) -> Option<&str> {
        Some(self.str_at("/metadata/namespace")).filter(|ns| !ns.is_empty())
    }

    /// Identity of the object
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    fn metadata_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let metadata = self
            .value
            .as_object_mut()?
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        metadata.as_object_mut()
    }

    /// Set metadata.namespace
    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
    }

    /// Set a label
    pub fn set_label(&mut self, key: &str, value: &str) {
        let Some(metadata) = self.metadata_mut() else {
            return;
        };
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if !labels.is_object() {
            *labels = Value::Object(Map::new());
        }
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    /// Label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.value
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }

    /// Raw body
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Raw body, mutable
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Unwrap into the raw body
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Template variables offered by a config secret (credential keys removed)
pub fn template_variables(secret_data: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    secret_data
        .iter()
        .filter(|(key, _)| !RESERVED_SECRET_KEYS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Replace `${VAR}` and `${VAR:=default}` references.
///
/// All missing variables are reported in one error, sorted by name.
/// `${VAR:-default}` is accepted as a synonym of `:=`.
pub fn substitute_variables(
    input: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String, Error> {
    let mut output = String::with_capacity(input.len());
    let mut missing = BTreeSet::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            output.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let expr = &after[..end];
        let (name, default) = match expr.find(":=").or_else(|| expr.find(":-")) {
            Some(idx) => (&expr[..idx], Some(&expr[idx + 2..])),
            None => (expr, None),
        };

        if !is_variable_name(name) {
            // not a reference we understand (e.g. shell snippets in scripts)
            output.push_str(&rest[start..start + 2 + end + 1]);
        } else {
            match (variables.get(name), default) {
                (Some(value), _) => output.push_str(value),
                (None, Some(default)) => output.push_str(default),
                (None, None) => {
                    missing.insert(name.to_string());
                }
            }
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);

    if missing.is_empty() {
        Ok(output)
    } else {
        let names: Vec<_> = missing.into_iter().collect();
        Err(Error::validation_for_field(
            "components",
            "spec.configSecret",
            format!("value for variables [{}] is not set", names.join(", ")),
        ))
    }
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render and parse a components file
pub fn parse_components(
    raw: &[u8],
    variables: &BTreeMap<String, String>,
) -> Result<Vec<ManifestObject>, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::serialization(format!("components are not UTF-8: {}", e)))?;
    let rendered = substitute_variables(text, variables)?;
    parse_manifests(&rendered)
}

/// Parse a multi-document YAML stream without variable substitution.
///
/// `kind: List` documents are expanded into their items.
pub fn parse_manifests(text: &str) -> Result<Vec<ManifestObject>, Error> {
    let mut objects = Vec::new();
    for doc in yaml::parse_yaml_multi(text)? {
        if doc.get("kind").and_then(Value::as_str) == Some("List") {
            let items = doc
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                objects.push(ManifestObject::from_value(item)?);
            }
        } else {
            objects.push(ManifestObject::from_value(doc)?);
        }
    }
    Ok(objects)
}

/// Labels every installed object carries
pub fn managed_labels(component_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "true".to_string()),
        (PROVIDER_LABEL.to_string(), component_name.to_string()),
        (CLUSTERCTL_LABEL.to_string(), String::new()),
    ])
}

/// Label selector matching the objects installed for a component
pub fn managed_selector(component_name: &str) -> String {
    format!(
        "{}=true,{}={}",
        MANAGED_BY_LABEL, PROVIDER_LABEL, component_name
    )
}

/// Apply [`managed_labels`] to every object
pub fn add_managed_labels(objects: &mut [ManifestObject], component_name: &str) {
    let labels = managed_labels(component_name);
    for object in objects {
        for (key, value) in &labels {
            object.set_label(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const COMPONENTS: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: capa-system
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: capa-controller-manager
  namespace: capa-system
spec:
  template:
    spec:
      containers:
      - name: manager
        image: registry.k8s.io/cluster-api-aws/cluster-api-aws-controller:v2.5.0
        env:
        - name: AWS_B64ENCODED_CREDENTIALS
          value: ${AWS_B64ENCODED_CREDENTIALS}
        - name: EXP
          value: "${EXP_MACHINE_POOL:=false}"
---
# comment-only document
"#;

    #[test]
    fn renders_and_parses_in_order() {
        let objects =
            parse_components(COMPONENTS.as_bytes(), &vars(&[("AWS_B64ENCODED_CREDENTIALS", "Zm9v")]))
                .unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind(), "Namespace");
        assert_eq!(objects[0].namespace(), None);
        assert_eq!(objects[1].namespace(), Some("capa-system"));
        let env = objects[1]
            .value()
            .pointer("/spec/template/spec/containers/0/env")
            .unwrap();
        assert_eq!(env[0]["value"], "Zm9v");
        assert_eq!(env[1]["value"], "false");
    }

    #[test]
    fn missing_variables_are_all_named() {
        let err = substitute_variables("a: ${B}\nc: ${A}\nd: ${A}", &BTreeMap::new()).unwrap_err();
        assert!(err.message().contains("[A, B]"), "{}", err);
        assert!(!err.is_retryable());
    }

    #[test]
    fn secret_values_win_over_defaults() {
        let out = substitute_variables("x: ${V:=1} y: ${W:-2}", &vars(&[("V", "9")])).unwrap();
        assert_eq!(out, "x: 9 y: 2");
    }

    #[test]
    fn unrelated_dollar_braces_are_left_alone() {
        let out = substitute_variables("cmd: echo ${1} ${a-b} $HOME ${", &BTreeMap::new()).unwrap();
        assert_eq!(out, "cmd: echo ${1} ${a-b} $HOME ${");
    }

    #[test]
    fn credential_keys_are_not_variables() {
        let data = vars(&[("github-token", "t"), ("AWS_REGION", "eu-west-1")]);
        let variables = template_variables(&data);
        assert_eq!(variables.len(), 1);
        assert!(variables.contains_key("AWS_REGION"));
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(parse_manifests("kind: ConfigMap\nmetadata:\n  name: x").is_err());
        assert!(parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata: {}").is_err());
        assert!(parse_manifests("- just\n- a list").is_err());
        assert!(parse_manifests("a: [unclosed").is_err());
    }

    #[test]
    fn list_documents_are_expanded() {
        let objects = parse_manifests(
            "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: a\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: b\n",
        )
        .unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn managed_labels_are_added_to_everything() {
        let mut objects = parse_manifests(COMPONENTS).unwrap();
        assert_eq!(objects.len(), 2);
        add_managed_labels(&mut objects, "infrastructure-aws");
        for object in &objects {
            assert_eq!(object.label(MANAGED_BY_LABEL), Some("true"));
            assert_eq!(object.label(PROVIDER_LABEL), Some("infrastructure-aws"));
            assert_eq!(object.label(CLUSTERCTL_LABEL), Some(""));
        }
        assert_eq!(
            managed_selector("cluster-api"),
            "managed-by.operator.cluster.x-k8s.io=true,cluster.x-k8s.io/provider=cluster-api"
        );
    }

    #[test]
    fn keys_match_across_api_versions() {
        let old = ObjectKey {
            api_version: "cert-manager.io/v1alpha2".to_string(),
            kind: "Certificate".to_string(),
            namespace: Some("capi-system".to_string()),
            name: "serving-cert".to_string(),
        };
        let new = ObjectKey {
            api_version: "cert-manager.io/v1".to_string(),
            ..old.clone()
        };
        assert!(old.same_object(&new));
        assert_eq!(
            new.to_string(),
            "cert-manager.io/v1/Certificate capi-system/serving-cert"
        );
    }
}
