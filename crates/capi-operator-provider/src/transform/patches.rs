//! RFC 7396 merge patches from `spec.manifestPatches`

use capi_operator_common::{yaml, Error};
use serde_json::Value;

use super::Stage;
use crate::components::ManifestObject;

/// A parsed patch and the objects it targets
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestPatch {
    body: Value,
    api_version: Option<String>,
    kind: Option<String>,
    name: Option<String>,
}

impl ManifestPatch {
    /// Parse a patch document (YAML or JSON)
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let body = yaml::parse_yaml(raw).map_err(|e| {
            Error::transform(Stage::Patches.as_str(), format!("failed to parse patch: {}", e))
        })?;
        if !body.is_object() {
            return Err(Error::transform(
                Stage::Patches.as_str(),
                "patch must be a mapping",
            ));
        }
        let field = |pointer: &str| body.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            api_version: field("/apiVersion"),
            kind: field("/kind"),
            name: field("/metadata/name"),
            body,
        })
    }

    /// Whether the patch applies to an object.
    ///
    /// A patch naming a kind targets that kind only, narrowed further by
    /// apiVersion and name when those are set. A patch without a kind
    /// applies to everything.
    pub fn matches(&self, object: &ManifestObject) -> bool {
        let Some(kind) = &self.kind else {
            return true;
        };
        kind == object.kind()
            && self.api_version.as_deref().is_none_or(|v| v == object.api_version())
            && self.name.as_deref().is_none_or(|n| n == object.name())
    }

    /// Merge into an object
    pub fn apply(&self, object: &mut ManifestObject) -> Result<(), Error> {
        let mut patched = object.value().clone();
        json_patch::merge(&mut patched, &self.body);
        *object = ManifestObject::from_value(patched).map_err(|e| {
            Error::transform(
                Stage::Patches.as_str(),
                format!("patch leaves {} {} invalid: {}", object.kind(), object.name(), e.message()),
            )
        })?;
        Ok(())
    }
}

/// Apply patches in list order; later patches win on the same field
pub fn apply_patches(objects: &mut [ManifestObject], patches: &[String]) -> Result<(), Error> {
    let parsed = patches
        .iter()
        .map(|raw| ManifestPatch::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    for patch in &parsed {
        for object in objects.iter_mut().filter(|o| patch.matches(o)) {
            patch.apply(object)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn objects() -> Vec<ManifestObject> {
        vec![
            ManifestObject::from_value(json!({
                "apiVersion": "apps/v1", "kind": "Deployment",
                "metadata": {"name": "manager", "labels": {"a": "1"}},
                "spec": {"replicas": 1}
            }))
            .unwrap(),
            ManifestObject::from_value(json!({
                "apiVersion": "v1", "kind": "Service",
                "metadata": {"name": "webhook"}
            }))
            .unwrap(),
        ]
    }

    #[test]
    fn later_patches_win() {
        let mut objects = objects();
        let patches = vec![
            "kind: Deployment\nspec:\n  replicas: 2\n".to_string(),
            r#"{"kind": "Deployment", "spec": {"replicas": 3}}"#.to_string(),
        ];
        apply_patches(&mut objects, &patches).unwrap();
        assert_eq!(objects[0].value()["spec"]["replicas"], 3);
    }

    #[test]
    fn kind_less_patch_applies_everywhere_and_null_deletes() {
        let mut objects = objects();
        let patches = vec!["metadata:\n  labels:\n    a: null\n    team: capi\n".to_string()];
        apply_patches(&mut objects, &patches).unwrap();
        for object in &objects {
            assert_eq!(object.label("team"), Some("capi"));
            assert_eq!(object.label("a"), None);
        }
    }

    #[test]
    fn targeting_by_api_version_and_name() {
        let mut objects = objects();
        let patches = vec![
            "apiVersion: apps/v1beta1\nkind: Deployment\nspec:\n  replicas: 9\n".to_string(),
            "kind: Deployment\nmetadata:\n  name: other\nspec:\n  replicas: 9\n".to_string(),
        ];
        apply_patches(&mut objects, &patches).unwrap();
        assert_eq!(objects[0].value()["spec"]["replicas"], 1);
    }

    #[test]
    fn unparsable_patch_is_fatal() {
        let mut objects = objects();
        let err = apply_patches(&mut objects, &["kind: [unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Transform { ref stage, .. } if stage == "patch"));
        assert!(apply_patches(&mut objects, &["- a\n- b\n".to_string()]).is_err());
    }

    #[test]
    fn patch_that_removes_the_name_is_rejected() {
        let mut objects = objects();
        let err = apply_patches(&mut objects, &["kind: Service\nmetadata:\n  name: null\n".to_string()]);
        assert!(err.is_err());
    }
}
