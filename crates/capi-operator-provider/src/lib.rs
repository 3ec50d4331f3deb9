//! Reconciliation pipeline for Cluster API providers
//!
//! A provider custom resource flows through preflight checks, an artifact
//! source (GitHub release, OCI artifact or in-cluster ConfigMaps), the
//! repository cache, the component transformer pipeline and the installer.
//! The dispatcher in [`controller`] drives the phases and reports conditions.
//!
//! Related crates:
//! - `capi-operator-common`: CRDs, errors and Kubernetes helpers
//! - `capi-operator`: the operator binary wiring controllers together

#![deny(missing_docs)]

pub mod catalog;
pub mod client;
pub mod components;
pub mod config;
pub mod controller;
pub mod http;
pub mod installer;
pub mod metadata;
pub mod phases;
pub mod preflight;
pub mod registry;
pub mod repository;
pub mod sources;
pub mod transform;
pub mod version;

// Re-export controller types
pub use controller::{error_policy, reconcile, Context, ContextBuilder};

pub use client::{ClusterOps, KubeClusterOps};
pub use config::OperatorConfig;
pub use http::{HttpFetcher, ReqwestFetcher};
pub use registry::{init_registry, registry, ProviderRegistry};

// Re-export common error types
pub use capi_operator_common::{Error, Result};
