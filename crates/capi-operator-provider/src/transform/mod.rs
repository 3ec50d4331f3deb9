//! Component transformer pipeline
//!
//! Stages run in a fixed order over the parsed object list: namespace
//! pinning, deployment customization, merge patches, image overrides. Each
//! stage only touches the kinds it cares about and preserves list order.
//! Nothing is written to the cluster until the whole pipeline succeeds.

pub mod deployment;
pub mod images;
pub mod namespace;
pub mod patches;

use capi_operator_common::crd::{reasons, ProviderObject};
use capi_operator_common::kube_utils::ResourceScopes;
use capi_operator_common::Error;
use tracing::debug;

use crate::components::ManifestObject;
use crate::config::ImageOverride;

pub use deployment::customize_deployments;
pub use images::{apply_image_overrides, ImageRef};
pub use namespace::pin_namespace;
pub use patches::{apply_patches, ManifestPatch};

/// Pipeline stage, carried by [`Error::Transform`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Namespace pinning
    Namespace,
    /// Deployment customization
    Deployment,
    /// Manifest patches
    Patches,
    /// Image overrides
    Images,
}

impl Stage {
    /// Stage name used in errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Deployment => "deployment",
            Self::Patches => "patch",
            Self::Images => "image",
        }
    }

    /// Stage of a transform error
    pub fn of(error: &Error) -> Option<Self> {
        let Error::Transform { stage, .. } = error else {
            return None;
        };
        [Self::Namespace, Self::Deployment, Self::Patches, Self::Images]
            .into_iter()
            .find(|s| s.as_str() == stage)
    }

    /// Condition reason reported when the stage fails
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Namespace | Self::Deployment => reasons::COMPONENTS_CUSTOMIZATION_ERROR,
            Self::Patches => reasons::COMPONENTS_PATCH_ERROR,
            Self::Images => reasons::COMPONENTS_IMAGE_OVERRIDE_ERROR,
        }
    }
}

/// Run every stage over the provider's components
pub fn transform_components(
    objects: &mut [ManifestObject],
    provider: &ProviderObject,
    scopes: &ResourceScopes,
    image_override: Option<&ImageOverride>,
) -> Result<(), Error> {
    pin_namespace(objects, provider.namespace(), scopes)?;
    customize_deployments(objects, &provider.spec)?;
    apply_patches(objects, &provider.spec.manifest_patches)?;
    if let Some(rule) = image_override {
        apply_image_overrides(objects, rule)?;
    }
    debug!(
        provider = %provider.key(),
        objects = objects.len(),
        "components transformed"
    );
    Ok(())
}
