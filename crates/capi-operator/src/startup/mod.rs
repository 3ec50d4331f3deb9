//! Startup utilities for the operator

mod crds;

pub use crds::{ensure_crds_installed, render_crds};
