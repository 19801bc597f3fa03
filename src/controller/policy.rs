//! Node-Down Pod Deletion Policy
//!
//! Kubernetes never force-deletes pods on a node that stopped reporting;
//! they stay `Terminating` forever and keep their volumes attached. The
//! cluster-wide policy below lets an operator opt workloads into forced
//! deletion so their replacements can take the volume over.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Name of the setting holding the policy
pub const SETTING_NODE_DOWN_POD_DELETION_POLICY: &str = "node-down-pod-deletion-policy";

pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";

/// Which pods may be force-deleted when their node is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeDownPodDeletionPolicy {
    #[default]
    DoNothing,
    DeleteStatefulsetPod,
    DeleteDeploymentPod,
    DeleteBothStatefulsetAndDeploymentPod,
}

impl NodeDownPodDeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeDownPodDeletionPolicy::DoNothing => "do-nothing",
            NodeDownPodDeletionPolicy::DeleteStatefulsetPod => "delete-statefulset-pod",
            NodeDownPodDeletionPolicy::DeleteDeploymentPod => "delete-deployment-pod",
            NodeDownPodDeletionPolicy::DeleteBothStatefulsetAndDeploymentPod => {
                "delete-both-statefulset-and-deployment-pod"
            }
        }
    }

    /// Whether this policy lets the controller force-delete `pod`
    pub fn permits(&self, pod: &Pod) -> bool {
        match self {
            NodeDownPodDeletionPolicy::DoNothing => false,
            NodeDownPodDeletionPolicy::DeleteStatefulsetPod => is_owned_by_stateful_set(pod),
            NodeDownPodDeletionPolicy::DeleteDeploymentPod => is_owned_by_deployment(pod),
            NodeDownPodDeletionPolicy::DeleteBothStatefulsetAndDeploymentPod => {
                is_owned_by_stateful_set(pod) || is_owned_by_deployment(pod)
            }
        }
    }
}

impl std::fmt::Display for NodeDownPodDeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeDownPodDeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "do-nothing" => Ok(NodeDownPodDeletionPolicy::DoNothing),
            "delete-statefulset-pod" => Ok(NodeDownPodDeletionPolicy::DeleteStatefulsetPod),
            "delete-deployment-pod" => Ok(NodeDownPodDeletionPolicy::DeleteDeploymentPod),
            "delete-both-statefulset-and-deployment-pod" => {
                Ok(NodeDownPodDeletionPolicy::DeleteBothStatefulsetAndDeploymentPod)
            }
            other => Err(format!("unknown node down pod deletion policy: {}", other)),
        }
    }
}

/// The owner reference marked as managing controller, if any
pub fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

pub fn is_owned_by_stateful_set(pod: &Pod) -> bool {
    controller_of(pod).is_some_and(|r| r.kind == KIND_STATEFUL_SET)
}

/// Deployment pods are controlled by the ReplicaSet the Deployment manages
pub fn is_owned_by_deployment(pod: &Pod) -> bool {
    controller_of(pod).is_some_and(|r| r.kind == KIND_REPLICA_SET)
}
