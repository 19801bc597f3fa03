//! Node-Failure Pod Eviction Controller
//!
//! Watches pods that use volumes of our CSI driver and force-deletes those
//! stuck terminating on downed nodes, as allowed by the cluster-wide
//! node-down pod deletion policy.
//!
//! # Architecture
//!
//! ```text
//!  pod watch ──► enqueue filter ──► WorkQueue ──► workers ──► sync_handler
//!                (PVC -> PV ->       (dedup,        (N tasks)     │
//!                 CSI driver)        rate limit)                  ▼
//!                                        ▲            policy + node health
//!                                        └── handle_err ◄──── force delete
//! ```

pub mod events;
pub mod metrics;
pub mod pod_controller;
pub mod policy;
pub mod queue;
pub mod rate_limiter;
pub mod sink;

pub use events::*;
pub use metrics::*;
pub use pod_controller::*;
pub use policy::*;
pub use queue::*;
pub use rate_limiter::*;
pub use sink::*;
