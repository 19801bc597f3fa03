//! Volume Creation Options
//!
//! Resolves the string parameters a client supplies at provisioning time
//! into an immutable [`ResolvedVolumeSpec`], and decides whether a publish
//! request must be treated as single-attacher.

use crate::csi::access_mode::{AccessMode, CapabilityMode, DataEngine, VolumeCapability};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Option Keys and Defaults
// =============================================================================

pub const OPTION_NUMBER_OF_REPLICAS: &str = "numberOfReplicas";
pub const OPTION_STALE_REPLICA_TIMEOUT: &str = "staleReplicaTimeout";
pub const OPTION_EXCLUSIVE: &str = "exclusive";
pub const OPTION_SHARE: &str = "share";
pub const OPTION_DISK_SELECTOR: &str = "diskSelector";
pub const OPTION_NODE_SELECTOR: &str = "nodeSelector";
pub const OPTION_ENCRYPTED: &str = "encrypted";
pub const OPTION_MIGRATABLE: &str = "migratable";

/// Replica count used when the option is absent
pub const DEFAULT_NUMBER_OF_REPLICAS: u32 = 3;

/// Minutes before a failed replica is considered stale (48h)
pub const DEFAULT_STALE_REPLICA_TIMEOUT: u32 = 2880;

/// Provisioning-time parameters, as received from the CSI request
pub type VolumeCreationOptions = BTreeMap<String, String>;

// =============================================================================
// Resolved Spec
// =============================================================================

/// Validated volume parameters produced once per provisioning call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVolumeSpec {
    pub number_of_replicas: u32,
    pub stale_replica_timeout: u32,
    pub access_mode: AccessMode,
    pub data_engine: DataEngine,
    pub revision_counter_disabled: bool,
    #[serde(default)]
    pub disk_selector: Vec<String>,
    #[serde(default)]
    pub node_selector: Vec<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub migratable: bool,
}

impl Default for ResolvedVolumeSpec {
    fn default() -> Self {
        Self {
            number_of_replicas: DEFAULT_NUMBER_OF_REPLICAS,
            stale_replica_timeout: DEFAULT_STALE_REPLICA_TIMEOUT,
            access_mode: AccessMode::ReadWriteOnce,
            data_engine: DataEngine::V1,
            revision_counter_disabled: true,
            disk_selector: Vec::new(),
            node_selector: Vec::new(),
            encrypted: false,
            migratable: false,
        }
    }
}

/// A named, sized volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub size_bytes: u64,
    pub spec: ResolvedVolumeSpec,
}

impl Volume {
    pub fn new(name: impl Into<String>, size_bytes: u64, spec: ResolvedVolumeSpec) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            spec,
        }
    }

    pub fn access_mode(&self) -> AccessMode {
        self.spec.access_mode
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve creation options into a volume spec.
///
/// The only failure is asking for an exclusive and a shared volume at once.
/// Values that do not parse are treated as absent.
pub fn resolve_volume_options(
    volume_id: &str,
    options: &VolumeCreationOptions,
) -> Result<ResolvedVolumeSpec> {
    let exclusive = bool_option(options, OPTION_EXCLUSIVE);
    let share = bool_option(options, OPTION_SHARE);

    let access_mode = match (exclusive, share) {
        (true, true) => {
            return Err(Error::ConflictingAccessMode {
                volume_id: volume_id.to_string(),
            })
        }
        (true, false) => AccessMode::ReadWriteOncePod,
        (false, true) => AccessMode::ReadWriteMany,
        (false, false) => AccessMode::ReadWriteOnce,
    };

    let spec = ResolvedVolumeSpec {
        number_of_replicas: u32_option(options, OPTION_NUMBER_OF_REPLICAS)
            .unwrap_or(DEFAULT_NUMBER_OF_REPLICAS),
        stale_replica_timeout: u32_option(options, OPTION_STALE_REPLICA_TIMEOUT)
            .unwrap_or(DEFAULT_STALE_REPLICA_TIMEOUT),
        access_mode,
        data_engine: DataEngine::V1,
        revision_counter_disabled: true,
        disk_selector: list_option(options, OPTION_DISK_SELECTOR),
        node_selector: list_option(options, OPTION_NODE_SELECTOR),
        encrypted: bool_option(options, OPTION_ENCRYPTED),
        migratable: bool_option(options, OPTION_MIGRATABLE),
    };

    debug!(
        volume = volume_id,
        access_mode = %spec.access_mode,
        replicas = spec.number_of_replicas,
        "Resolved volume options"
    );

    Ok(spec)
}

/// Whether publishing the volume with this capability must be limited to a
/// single attacher.
pub fn require_exclusive_access(volume: &Volume, capability: &VolumeCapability) -> bool {
    if volume.access_mode() == AccessMode::ReadWriteOncePod {
        return true;
    }
    capability.access_mode == Some(CapabilityMode::SingleNodeSingleWriter)
}

fn u32_option(options: &VolumeCreationOptions, key: &str) -> Option<u32> {
    options.get(key).and_then(|v| v.trim().parse().ok())
}

fn bool_option(options: &VolumeCreationOptions, key: &str) -> bool {
    options.get(key).and_then(|v| parse_bool(v)).unwrap_or(false)
}

fn list_option(options: &VolumeCreationOptions, key: &str) -> Vec<String> {
    options
        .get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Accepts the spellings storage classes commonly use for booleans
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
