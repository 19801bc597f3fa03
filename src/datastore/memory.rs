//! In-memory object mirror
//!
//! A `DashMap`-backed mirror for embedding the controller without a live
//! API server, and for tests. Objects are keyed by namespace and name.

use crate::domain::ports::{ObjectKey, ObjectMirror};
use crate::error::Result;
use dashmap::DashMap;
use kube::{Resource, ResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mirror populated by the caller
#[derive(Debug)]
pub struct MemoryMirror<K> {
    objects: DashMap<ObjectKey, Arc<K>>,
    synced: AtomicBool,
}

impl<K: Resource> MemoryMirror<K> {
    /// Empty mirror that has not finished its initial load
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }

    /// Empty mirror that reports itself as synced
    pub fn synced() -> Self {
        let mirror = Self::new();
        mirror.mark_synced();
        mirror
    }

    /// Insert or replace an object
    pub fn apply(&self, object: K) -> Arc<K> {
        let object = Arc::new(object);
        self.objects.insert(key_of(object.as_ref()), object.clone());
        object
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects.remove(key).map(|(_, object)| object)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<K: Resource> Default for MemoryMirror<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource + Send + Sync> ObjectMirror<K> for MemoryMirror<K> {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>> {
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Mirror key of an object
pub fn key_of<K: Resource>(object: &K) -> ObjectKey {
    match object.namespace() {
        Some(namespace) => ObjectKey::namespaced(namespace, object.name_any()),
        None => ObjectKey::cluster(object.name_any()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_get_remove() {
        let mirror: MemoryMirror<Pod> = MemoryMirror::new();
        assert!(!mirror.has_synced());

        mirror.apply(pod("default", "web-0"));
        mirror.apply(pod("other", "web-0"));
        assert_eq!(mirror.len(), 2);

        let key = ObjectKey::namespaced("default", "web-0");
        let found = mirror.get(&key).unwrap().unwrap();
        assert_eq!(found.namespace().as_deref(), Some("default"));

        assert!(mirror.remove(&key).is_some());
        assert!(mirror.get(&key).unwrap().is_none());
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_cluster_scoped_keys() {
        let mirror: MemoryMirror<PersistentVolume> = MemoryMirror::synced();
        assert!(mirror.has_synced());

        mirror.apply(PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(mirror.get(&ObjectKey::cluster("pv-1")).unwrap().is_some());
        assert!(mirror.get(&ObjectKey::parse("pv-1").unwrap()).unwrap().is_some());
    }
}
