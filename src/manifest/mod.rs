//! Kubernetes Manifests
//!
//! Data mapping from resolved volumes to PV/PVC descriptors.

pub mod builder;

pub use builder::*;
