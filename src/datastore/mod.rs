//! Datastore adapters
//!
//! Implementations of the domain ports: reflector-backed mirrors and
//! API-server clients for a live cluster, and an in-memory mirror.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;
