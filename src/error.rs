//! Error types for the Volume Failover Operator
//!
//! Provides structured error types for volume option resolution, the
//! node-failure pod eviction controller and its Kubernetes adapters.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Volume Option Errors
    // =========================================================================
    #[error("conflicting access mode options for volume {volume_id}: exclusive and share cannot both be set")]
    ConflictingAccessMode { volume_id: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to get {kind} {key} from local cache: {reason}")]
    MirrorLookup {
        kind: String,
        key: String,
        reason: String,
    },

    #[error("Failed to forcefully delete pod {namespace}/{name} on downed node {node}: {source}")]
    PodDeletion {
        namespace: String,
        name: String,
        node: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Controller Errors
    // =========================================================================
    #[error("unexpected key format: {key:?}")]
    MalformedKey { key: String },

    #[error("failed to evaluate node {node:?} for pod {pod}: {source}")]
    NodeHealth {
        node: String,
        pod: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to read setting {name}: {reason}")]
    Settings { name: String, reason: String },

    #[error("{controller}: fail to sync {key}: {source}")]
    Sync {
        controller: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{controller}: dropping {key} out of the queue after {failures} failed attempts: {source}")]
    RetriesExhausted {
        controller: &'static str,
        key: String,
        failures: u32,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Wrappers classify as whatever they wrap
            Error::Sync { source, .. }
            | Error::PodDeletion { source, .. }
            | Error::NodeHealth { source, .. } => source.action(),

            // Transient errors - retry with backoff
            Error::Kube(_) | Error::MirrorLookup { .. } | Error::Settings { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Validation and local state errors - don't retry automatically
            Error::ConflictingAccessMode { .. }
            | Error::MalformedKey { .. }
            | Error::Configuration(_)
            | Error::RetriesExhausted { .. }
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sync { source, .. } | Error::PodDeletion { source, .. } => source.is_transient(),
            Error::Kube(_) | Error::MirrorLookup { .. } | Error::NodeHealth { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            Error::Sync { source, .. }
            | Error::PodDeletion { source, .. }
            | Error::NodeHealth { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
