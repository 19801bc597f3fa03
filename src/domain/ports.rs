//! Domain Ports - Core trait definitions for the failover operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! the cluster. Adapters in [`crate::datastore`] implement them against a
//! live API server or in memory.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Object Keys
// =============================================================================

/// Identity of a cached object: namespace (for namespaced kinds) and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object; an empty namespace means cluster scope
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` or `name` work-queue key
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] => Ok(Self::cluster(*name)),
            [namespace, name] => Ok(Self::namespaced(*namespace, *name)),
            _ => Err(Error::MalformedKey {
                key: key.to_string(),
            }),
        }
    }

    /// Namespace, or the empty string for cluster-scoped objects
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Object Mirror Port
// =============================================================================

/// Read-only, eventually-consistent local copy of one kind of cluster object
pub trait ObjectMirror<K>: Send + Sync {
    /// Look up an object by key. `Ok(None)` means the object is not cached.
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>>;

    /// Whether the initial list has been fully loaded
    fn has_synced(&self) -> bool;
}

// =============================================================================
// Pod Deleter Port
// =============================================================================

/// Port for the pod-management API
#[async_trait]
pub trait PodDeleter: Send + Sync {
    /// Delete a pod with a zero grace period. A pod that is already gone is
    /// not an error.
    async fn force_delete(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Settings Store Port
// =============================================================================

/// Port for cluster-wide operator settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read the current raw value of a setting, `None` if it is unset
    async fn get_setting(&self, name: &str) -> Result<Option<String>>;
}

// =============================================================================
// Node Health Port
// =============================================================================

/// Port for node liveness decisions
#[async_trait]
pub trait NodeHealthOracle: Send + Sync {
    /// Whether the node is unreachable or no longer part of the cluster
    async fn is_node_down_or_deleted(&self, node_name: &str) -> Result<bool>;
}

// =============================================================================
// Error Sink Port
// =============================================================================

/// One-way notification channel for errors nobody will retry
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, err: &Error);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectMirrorRef<K> = Arc<dyn ObjectMirror<K>>;
pub type PodDeleterRef = Arc<dyn PodDeleter>;
pub type SettingsStoreRef = Arc<dyn SettingsStore>;
pub type NodeHealthOracleRef = Arc<dyn NodeHealthOracle>;
pub type ErrorSinkRef = Arc<dyn ErrorSink>;
