//! Controller Metrics
//!
//! Prometheus instruments for the pod eviction controller. Created
//! unregistered so tests can build as many controllers as they like; the
//! binary registers them into the default registry.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

const NAMESPACE: &str = "volume_failover";

/// Counters and gauges updated by the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciliation attempts by result (`success`, `error`)
    pub reconciliations: IntCounterVec,
    /// Pods force-deleted from downed nodes
    pub forced_deletions: IntCounter,
    /// Items dropped from the queue without further retries
    pub dropped_items: IntCounter,
    /// Errors handed to the error sink
    pub reported_errors: IntCounter,
    /// Items ready for a worker
    pub queue_depth: IntGauge,
}

impl ControllerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            reconciliations: IntCounterVec::new(
                Opts::new("reconciliations_total", "Pod reconciliation attempts by result")
                    .namespace(NAMESPACE),
                &["result"],
            )?,
            forced_deletions: IntCounter::with_opts(
                Opts::new(
                    "forced_pod_deletions_total",
                    "Pods forcefully deleted from downed nodes",
                )
                .namespace(NAMESPACE),
            )?,
            dropped_items: IntCounter::with_opts(
                Opts::new(
                    "dropped_items_total",
                    "Work items dropped after exhausting retries or failing permanently",
                )
                .namespace(NAMESPACE),
            )?,
            reported_errors: IntCounter::with_opts(
                Opts::new("reported_errors_total", "Errors reported to the error sink")
                    .namespace(NAMESPACE),
            )?,
            queue_depth: IntGauge::with_opts(
                Opts::new("work_queue_depth", "Pod keys waiting for a worker").namespace(NAMESPACE),
            )?,
        })
    }

    /// Register every instrument into `registry`
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.forced_deletions.clone()))?;
        registry.register(Box::new(self.dropped_items.clone()))?;
        registry.register(Box::new(self.reported_errors.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        Ok(())
    }

    pub fn record_result(&self, ok: bool) {
        let label = if ok { "success" } else { "error" };
        self.reconciliations.with_label_values(&[label]).inc();
    }
}
