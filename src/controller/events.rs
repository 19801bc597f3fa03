//! Pod Change Events
//!
//! Typed notifications pushed by the pod mirror to the controller.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;

/// A pod lifecycle change observed by the pod mirror
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// A pod appeared (including the initial list)
    Added(Arc<Pod>),
    /// A known pod changed
    Updated(Arc<Pod>),
    /// A pod was removed; carries its last known state
    Deleted(Arc<Pod>),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Updated(pod) | PodEvent::Deleted(pod) => pod,
        }
    }

    /// `namespace/name` work-queue key of the pod
    pub fn key(&self) -> String {
        pod_key(self.pod())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PodEvent::Added(_) => "added",
            PodEvent::Updated(_) => "updated",
            PodEvent::Deleted(_) => "deleted",
        }
    }
}

/// `namespace/name` key for a pod (just `name` if it has no namespace)
pub fn pod_key(pod: &Pod) -> String {
    match pod.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, pod.name_any()),
        _ => pod.name_any(),
    }
}
