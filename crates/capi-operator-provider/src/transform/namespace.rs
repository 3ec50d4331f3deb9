//! Namespace pinning

use capi_operator_common::kube_utils::ResourceScopes;
use capi_operator_common::Error;
use serde_json::Value;

use super::Stage;
use crate::components::ManifestObject;

const BINDING_KINDS: &[&str] = &["RoleBinding", "ClusterRoleBinding"];

fn unpinned(namespace: Option<&str>) -> bool {
    matches!(namespace, None | Some("") | Some("default"))
}

/// Move namespaced objects without an explicit namespace into `namespace`.
///
/// Objects that name a namespace other than `default` keep it. ServiceAccount
/// subjects of role bindings follow the same rule so bindings keep pointing
/// at the pinned accounts. Whether a kind is namespaced comes from `scopes`.
pub fn pin_namespace(
    objects: &mut [ManifestObject],
    namespace: &str,
    scopes: &ResourceScopes,
) -> Result<(), Error> {
    if namespace.is_empty() {
        return Err(Error::transform(
            Stage::Namespace.as_str(),
            "provider has no namespace to install into",
        ));
    }

    for object in objects.iter_mut() {
        let namespaced = !scopes.is_cluster_scoped(object.api_version(), object.kind());
        if namespaced && unpinned(object.namespace()) {
            object.set_namespace(namespace);
        }

        if BINDING_KINDS.contains(&object.kind()) {
            let Some(subjects) = object
                .value_mut()
                .get_mut("subjects")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            for subject in subjects {
                let is_account = subject.get("kind").and_then(Value::as_str) == Some("ServiceAccount");
                if is_account && unpinned(subject.get("namespace").and_then(Value::as_str)) {
                    subject["namespace"] = Value::String(namespace.to_string());
                }
            }
        }
    }
    Ok(())
}
