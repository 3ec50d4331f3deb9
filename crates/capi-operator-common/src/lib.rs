//! Common types for the Cluster API provider operator: CRDs, errors and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field owner for every server-side apply the operator performs
pub const FIELD_MANAGER: &str = "capi-operator";

/// Finalizer placed on provider custom resources
pub const PROVIDER_FINALIZER: &str = "provider.cluster.x-k8s.io";

/// Label marking objects installed by the operator
pub const MANAGED_BY_LABEL: &str = "managed-by.operator.cluster.x-k8s.io";

/// clusterctl component label, e.g. `cluster.x-k8s.io/provider: infrastructure-aws`
pub const PROVIDER_LABEL: &str = "cluster.x-k8s.io/provider";

/// clusterctl inventory label carried by all provider objects
pub const CLUSTERCTL_LABEL: &str = "clusterctl.cluster.x-k8s.io";

/// Annotation written by the secret propagator with the config secret's data hash
pub const OBSERVED_SECRET_HASH_ANNOTATION: &str = "operator.cluster.x-k8s.io/observed-secret-hash";

/// Annotation recording the spec hash of the last successful install
pub const APPLIED_SPEC_HASH_ANNOTATION: &str = "operator.cluster.x-k8s.io/applied-spec-hash";
