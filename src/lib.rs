//! Volume Failover Operator
//!
//! Companion pieces of a replicated block-storage CSI driver:
//!
//! - access-mode resolution of volume creation options,
//! - rendering of PersistentVolume / PersistentVolumeClaim descriptors for
//!   existing volumes,
//! - a controller that force-deletes pods stuck terminating on downed
//!   nodes so their volumes can fail over to a replacement pod.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                      Node-Failure Pod Eviction                         │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌───────────────┐   ┌─────────────────────────┐  │
//! │  │ Pod / PV / PVC│──►│  Enqueue      │──►│  Rate-limited           │  │
//! │  │ mirrors       │   │  filter       │   │  WorkQueue              │  │
//! │  └───────────────┘   └───────────────┘   └───────────┬─────────────┘  │
//! │                                                      │                │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────┴─────────────┐  │
//! │  │ Settings      │──►│ Deletion      │◄──│  Workers / sync_handler │  │
//! │  │ Node health   │   │ policy        │   └─────────────────────────┘  │
//! │  └───────────────┘   └───────┬───────┘                                │
//! │                              ▼                                        │
//! │                      force delete (grace 0)                           │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  CSI helpers: access-mode resolver · PV/PVC manifest builder          │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`csi`]: Creation options and access-mode resolution
//! - [`manifest`]: PersistentVolume and PersistentVolumeClaim descriptors
//! - [`controller`]: Pod eviction controller, work queue and rate limiters
//! - [`datastore`]: Kubernetes and in-memory adapters for the domain ports
//! - [`domain`]: Core traits (ports)
//! - [`config`]: Operator configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod csi;
pub mod datastore;
pub mod domain;
pub mod error;
pub mod manifest;

// Re-export commonly used types
pub use config::{OperatorConfig, ServerConfig, SettingsConfig};

pub use controller::{
    ControllerConfig, ControllerMetrics, KubernetesPodController, LoggingErrorSink,
    NodeDownPodDeletionPolicy, PodControllerDeps, PodEvent, RateLimiterConfig, WorkQueue,
};

pub use csi::{
    require_exclusive_access, resolve_volume_options, AccessMode, CapabilityMode,
    ResolvedVolumeSpec, Volume, VolumeCapability, VolumeCreationOptions,
};

pub use datastore::{
    ConfigMapSettingsStore, KubeNodeHealth, KubePodDeleter, MemoryMirror, ReflectorMirror,
};

pub use domain::ports::{
    ErrorSink, NodeHealthOracle, ObjectKey, ObjectMirror, PodDeleter, SettingsStore,
};

pub use error::{Error, ErrorAction, Result};

pub use manifest::ManifestBuilder;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
