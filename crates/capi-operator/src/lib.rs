//! Kubernetes operator that installs and upgrades Cluster API providers

#![deny(missing_docs)]

/// One controller per provider kind
pub mod controller_runner;
/// Cleanup of provider CRs when the operator itself is removed
pub mod deployment_finalizer;
/// Config secret change propagation
pub mod secret_watch;
/// Startup utilities (CRD install and rendering)
pub mod startup;
/// Kind-erased provider access for the side controllers
pub mod store;
