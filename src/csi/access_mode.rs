//! Volume Access Modes
//!
//! The exclusivity classes a volume can be created with, and the CSI
//! capability modes a caller may request when publishing it.

use serde::{Deserialize, Serialize};

// =============================================================================
// Access Mode
// =============================================================================

/// Exclusivity class of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessMode {
    /// Single node, any number of sequential attachers
    #[default]
    #[serde(rename = "rwo")]
    ReadWriteOnce,
    /// Shared across nodes
    #[serde(rename = "rwx")]
    ReadWriteMany,
    /// Exclusive to one pod cluster-wide
    #[serde(rename = "rwop")]
    ReadWriteOncePod,
}

impl AccessMode {
    /// The matching Kubernetes `PersistentVolumeAccessMode` string
    pub fn kubernetes_mode(&self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadWriteMany => "ReadWriteMany",
            AccessMode::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "rwo"),
            AccessMode::ReadWriteMany => write!(f, "rwx"),
            AccessMode::ReadWriteOncePod => write!(f, "rwop"),
        }
    }
}

// =============================================================================
// Data Engine
// =============================================================================

/// Storage engine generation serving the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEngine {
    #[default]
    V1,
    V2,
}

impl std::fmt::Display for DataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataEngine::V1 => write!(f, "v1"),
            DataEngine::V2 => write!(f, "v2"),
        }
    }
}

// =============================================================================
// CSI Capability
// =============================================================================

/// CSI `VolumeCapability.AccessMode.Mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// Access pattern a caller declares for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: Option<CapabilityMode>,
}

impl VolumeCapability {
    pub fn new(mode: CapabilityMode) -> Self {
        Self {
            access_mode: Some(mode),
        }
    }
}
