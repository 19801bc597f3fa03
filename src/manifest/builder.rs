//! PersistentVolume / PersistentVolumeClaim Builder
//!
//! Renders a resolved volume into the descriptors Kubernetes consumes. The
//! CSI volume-attribute bag produced here is the interoperability contract
//! with the node plugin, so key names and encodings must not change.

use crate::csi::{AccessMode, Volume};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

// =============================================================================
// Attribute Keys
// =============================================================================

pub const ATTR_DISK_SELECTOR: &str = "diskSelector";
pub const ATTR_NODE_SELECTOR: &str = "nodeSelector";
pub const ATTR_NUMBER_OF_REPLICAS: &str = "numberOfReplicas";
pub const ATTR_STALE_REPLICA_TIMEOUT: &str = "staleReplicaTimeout";
pub const ATTR_ENCRYPTED: &str = "encrypted";
pub const ATTR_MIGRATABLE: &str = "migratable";

const RESOURCE_STORAGE: &str = "storage";
const RECLAIM_POLICY_RETAIN: &str = "Retain";
const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";

// =============================================================================
// Manifest Builder
// =============================================================================

/// Builds PV/PVC descriptors for volumes served by one CSI driver
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    driver_name: String,
}

impl ManifestBuilder {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Claim bound to `pv_name`, requesting the whole volume
    pub fn build_claim_descriptor(
        &self,
        volume: &Volume,
        pv_name: &str,
        namespace: &str,
        pvc_name: &str,
        storage_class_name: &str,
    ) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(access_modes(volume.access_mode())),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(storage_quantity(volume.size_bytes)),
                    ..Default::default()
                }),
                storage_class_name: Some(storage_class_name.to_string()),
                volume_name: Some(pv_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// CSI-backed persistent volume whose handle is the volume name
    pub fn build_volume_descriptor(
        &self,
        volume: &Volume,
        pv_name: &str,
        storage_class_name: &str,
        fs_type: &str,
    ) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(pv_name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(storage_quantity(volume.size_bytes)),
                volume_mode: Some(VOLUME_MODE_FILESYSTEM.to_string()),
                access_modes: Some(access_modes(volume.access_mode())),
                persistent_volume_reclaim_policy: Some(RECLAIM_POLICY_RETAIN.to_string()),
                storage_class_name: Some(storage_class_name.to_string()),
                csi: Some(CSIPersistentVolumeSource {
                    driver: self.driver_name.clone(),
                    fs_type: Some(fs_type.to_string()),
                    volume_handle: volume.name.clone(),
                    volume_attributes: Some(volume_attributes(volume)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// CSI attribute bag for a volume. Absent keys mean false/unset; no key is
/// ever written with an empty or `"false"` value.
pub fn volume_attributes(volume: &Volume) -> BTreeMap<String, String> {
    let spec = &volume.spec;
    let mut attrs = BTreeMap::new();

    if !spec.disk_selector.is_empty() {
        attrs.insert(ATTR_DISK_SELECTOR.to_string(), spec.disk_selector.join(","));
    }
    if !spec.node_selector.is_empty() {
        attrs.insert(ATTR_NODE_SELECTOR.to_string(), spec.node_selector.join(","));
    }
    attrs.insert(
        ATTR_NUMBER_OF_REPLICAS.to_string(),
        spec.number_of_replicas.to_string(),
    );
    attrs.insert(
        ATTR_STALE_REPLICA_TIMEOUT.to_string(),
        spec.stale_replica_timeout.to_string(),
    );
    if spec.encrypted {
        attrs.insert(ATTR_ENCRYPTED.to_string(), "true".to_string());
    }
    // Migration attaches from two nodes at once, which an RWOP volume forbids
    if spec.migratable && spec.access_mode != AccessMode::ReadWriteOncePod {
        attrs.insert(ATTR_MIGRATABLE.to_string(), "true".to_string());
    }

    attrs
}

fn access_modes(mode: AccessMode) -> Vec<String> {
    vec![mode.kubernetes_mode().to_string()]
}

fn storage_quantity(size_bytes: u64) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert(RESOURCE_STORAGE.to_string(), format_binary_quantity(size_bytes));
    map
}

/// Render a byte count the way Kubernetes canonicalises binary-SI quantities
pub fn format_binary_quantity(bytes: u64) -> Quantity {
    const SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

    if bytes == 0 {
        return Quantity("0".to_string());
    }

    let mut value = bytes;
    let mut suffix = "";
    for s in SUFFIXES {
        if value % 1024 != 0 {
            break;
        }
        value /= 1024;
        suffix = s;
    }
    Quantity(format!("{}{}", value, suffix))
}
