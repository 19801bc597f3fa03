//! Kubernetes Pod Controller
//!
//! Watches pods that mount volumes served by our CSI driver. When such a pod
//! is stuck terminating on a node that is down or gone, and the cluster-wide
//! deletion policy covers the pod's owner, the pod is force-deleted so its
//! workload controller can start a replacement that takes the volume over.

use crate::controller::events::{pod_key, PodEvent};
use crate::controller::metrics::ControllerMetrics;
use crate::controller::policy::{NodeDownPodDeletionPolicy, SETTING_NODE_DOWN_POD_DELETION_POLICY};
use crate::controller::queue::WorkQueue;
use crate::controller::rate_limiter::{default_controller_rate_limiter, RateLimiterConfig};
use crate::domain::ports::{
    ErrorSinkRef, NodeHealthOracleRef, ObjectKey, ObjectMirror, ObjectMirrorRef, PodDeleterRef,
    SettingsStoreRef,
};
use crate::error::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Name used in logs and sync errors
pub const CONTROLLER_NAME: &str = "kubernetes pod controller";

/// Failed attempts after which an item is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_DRIVER_NAME: &str = "driver.longhorn.io";

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the pod controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// CSI driver whose volumes this controller looks after
    pub driver_name: String,
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Failed attempts per key after which it is dropped
    pub max_retries: u32,
    /// Requeue delay policy
    pub rate_limiter: RateLimiterConfig,
    /// How often to check whether the mirrors finished their initial list
    pub cache_sync_poll_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            workers: 5,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limiter: RateLimiterConfig::default(),
            cache_sync_poll_ms: 100,
        }
    }
}

/// Collaborators the controller reads from and acts through
#[derive(Clone)]
pub struct PodControllerDeps {
    pub pods: ObjectMirrorRef<Pod>,
    pub pvs: ObjectMirrorRef<PersistentVolume>,
    pub pvcs: ObjectMirrorRef<PersistentVolumeClaim>,
    pub deleter: PodDeleterRef,
    pub settings: SettingsStoreRef,
    pub node_health: NodeHealthOracleRef,
    pub error_sink: ErrorSinkRef,
}

// =============================================================================
// Enqueue Filter
// =============================================================================

/// Work-queue key for a pod change, if the pod mounts at least one volume
/// provisioned by `driver_name`.
///
/// Claims that are missing, unbound or bound to a missing volume are skipped.
/// Any other lookup failure aborts the scan and is returned to the caller.
pub fn pod_change_key(
    pod: &Pod,
    pvcs: &dyn ObjectMirror<PersistentVolumeClaim>,
    pvs: &dyn ObjectMirror<PersistentVolume>,
    driver_name: &str,
) -> Result<Option<String>> {
    let namespace = pod.namespace().unwrap_or_default();
    let Some(volumes) = pod.spec.as_ref().and_then(|spec| spec.volumes.as_ref()) else {
        return Ok(None);
    };

    for volume in volumes {
        let Some(claim) = &volume.persistent_volume_claim else {
            continue;
        };
        let Some(pvc) = pvcs.get(&ObjectKey::namespaced(namespace.as_str(), claim.claim_name.as_str()))?
        else {
            continue;
        };
        let Some(pv) = bound_volume(&pvc, pvs)? else {
            continue;
        };
        if is_provisioned_by(&pv, driver_name) {
            return Ok(Some(pod_key(pod)));
        }
    }
    Ok(None)
}

/// The persistent volume a claim is bound to, if it is bound and cached
pub fn bound_volume(
    pvc: &PersistentVolumeClaim,
    pvs: &dyn ObjectMirror<PersistentVolume>,
) -> Result<Option<Arc<PersistentVolume>>> {
    match pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
    {
        Some(pv_name) => pvs.get(&ObjectKey::cluster(pv_name)),
        None => Ok(None),
    }
}

pub fn is_provisioned_by(pv: &PersistentVolume, driver_name: &str) -> bool {
    pv.spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .is_some_and(|csi| csi.driver == driver_name)
}

// =============================================================================
// Pod Controller
// =============================================================================

/// Force-deletes pods stuck terminating on downed nodes
pub struct KubernetesPodController {
    config: ControllerConfig,
    pods: ObjectMirrorRef<Pod>,
    pvs: ObjectMirrorRef<PersistentVolume>,
    pvcs: ObjectMirrorRef<PersistentVolumeClaim>,
    deleter: PodDeleterRef,
    settings: SettingsStoreRef,
    node_health: NodeHealthOracleRef,
    error_sink: ErrorSinkRef,
    queue: WorkQueue<String>,
    /// Pod key -> UID of the incarnation already force-deleted
    force_deleted: DashMap<String, String>,
    metrics: ControllerMetrics,
}

impl KubernetesPodController {
    /// Create a new controller
    pub fn new(
        config: ControllerConfig,
        deps: PodControllerDeps,
        metrics: ControllerMetrics,
    ) -> Arc<Self> {
        let rate_limiter = default_controller_rate_limiter(&config.rate_limiter);
        Arc::new(Self {
            queue: WorkQueue::new(CONTROLLER_NAME, Box::new(rate_limiter)),
            config,
            pods: deps.pods,
            pvs: deps.pvs,
            pvcs: deps.pvcs,
            deleter: deps.deleter,
            settings: deps.settings,
            node_health: deps.node_health,
            error_sink: deps.error_sink,
            force_deleted: DashMap::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    // =========================================================================
    // Event Intake
    // =========================================================================

    /// Queue the pod behind `event` if it uses one of our volumes
    pub fn enqueue_pod_change(&self, event: &PodEvent) {
        trace!(kind = event.kind(), key = %event.key(), "Pod event");

        if let PodEvent::Deleted(_) = event {
            self.force_deleted.remove(&event.key());
        }

        match pod_change_key(
            event.pod(),
            self.pvcs.as_ref(),
            self.pvs.as_ref(),
            &self.config.driver_name,
        ) {
            Ok(Some(key)) => {
                self.queue.add(key);
                self.update_queue_depth();
            }
            Ok(None) => {}
            Err(e) => self.report(&e),
        }
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Run the controller until `shutdown` fires.
    ///
    /// Workers only start once every mirror has finished its initial list.
    /// On shutdown the queue is closed and all workers are awaited.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PodEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            "Starting {} with {} workers for driver {}",
            CONTROLLER_NAME, self.config.workers, self.config.driver_name
        );

        if !self.wait_for_cache_sync(&shutdown).await {
            self.queue.shut_down();
            info!("Shut down {} before caches synced", CONTROLLER_NAME);
            return Ok(());
        }

        let intake = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => controller.enqueue_pod_change(&event),
                            None => {
                                debug!("Pod event stream closed");
                                break;
                            }
                        },
                    }
                }
            })
        };

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| tokio::spawn(self.clone().worker()))
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down {}", CONTROLLER_NAME);
        self.queue.shut_down();

        for handle in workers {
            handle
                .await
                .map_err(|e| Error::Internal(format!("worker task failed: {}", e)))?;
        }
        intake
            .await
            .map_err(|e| Error::Internal(format!("event intake task failed: {}", e)))?;

        self.update_queue_depth();
        Ok(())
    }

    async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> bool {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.cache_sync_poll_ms.max(1)));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = ticker.tick() => {}
            }
            if self.pods.has_synced() && self.pvs.has_synced() && self.pvcs.has_synced() {
                debug!("{}: caches synced", CONTROLLER_NAME);
                return true;
            }
        }
    }

    async fn worker(self: Arc<Self>) {
        while self.process_next_work_item().await {}
    }

    /// Take one key off the queue and reconcile it. Returns `false` once the
    /// queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.update_queue_depth();

        let result = self.sync_handler(&key).await;
        self.handle_err(result, &key);
        self.queue.done(&key);
        true
    }

    /// Decide what happens to `key` after a reconciliation attempt
    pub fn handle_err(&self, result: Result<()>, key: &String) {
        self.metrics.record_result(result.is_ok());

        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(key = %key, "Dropping pod out of the queue: {}", err);
            self.queue.forget(key);
            self.metrics.dropped_items.inc();
            self.report(&err);
            return;
        }

        // Failures so far, counting this one
        let failures = self.queue.num_requeues(key) + 1;
        if failures < self.config.max_retries {
            warn!(key = %key, failures, "Error syncing pod: {}", err);
            self.queue.add_rate_limited(key.clone());
            return;
        }

        warn!(key = %key, failures, "Dropping pod out of the queue: {}", err);
        self.queue.forget(key);
        self.metrics.dropped_items.inc();
        self.report(&Error::RetriesExhausted {
            controller: CONTROLLER_NAME,
            key: key.clone(),
            failures,
            source: Box::new(err),
        });
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Reconcile the pod behind `key`
    pub async fn sync_handler(&self, key: &str) -> Result<()> {
        self.sync_pod(key).await.map_err(|e| Error::Sync {
            controller: CONTROLLER_NAME,
            key: key.to_string(),
            source: Box::new(e),
        })
    }

    async fn sync_pod(&self, key: &str) -> Result<()> {
        let object_key = ObjectKey::parse(key)?;

        let Some(pod) = self.pods.get(&object_key)? else {
            // Gone: a later pod under the same name starts with a clean slate
            self.force_deleted.remove(key);
            return Ok(());
        };

        let node_id = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default();

        self.handle_pod_deletion_if_node_down(&pod, key, &node_id, object_key.namespace_or_empty())
            .await
    }

    async fn handle_pod_deletion_if_node_down(
        &self,
        pod: &Pod,
        key: &str,
        node_id: &str,
        namespace: &str,
    ) -> Result<()> {
        let uid = pod.uid().unwrap_or_default();
        if self
            .force_deleted
            .get(key)
            .is_some_and(|deleted| *deleted == uid)
        {
            debug!(key = %key, "Pod already force-deleted, waiting for it to go away");
            return Ok(());
        }

        let policy = self.deletion_policy().await;
        if !policy.permits(pod) {
            return Ok(());
        }

        let down = self
            .node_health
            .is_node_down_or_deleted(node_id)
            .await
            .map_err(|e| Error::NodeHealth {
                node: node_id.to_string(),
                pod: key.to_string(),
                source: Box::new(e),
            })?;
        if !down {
            return Ok(());
        }

        // Only pods someone already asked to terminate, and whose deadline passed
        let Some(deletion_timestamp) = pod.metadata.deletion_timestamp.as_ref() else {
            return Ok(());
        };
        if deletion_timestamp.0 > Utc::now() {
            return Ok(());
        }

        let name = pod.name_any();
        self.deleter
            .force_delete(namespace, &name)
            .await
            .map_err(|e| Error::PodDeletion {
                namespace: namespace.to_string(),
                name: name.clone(),
                node: node_id.to_string(),
                source: Box::new(e),
            })?;

        self.force_deleted.insert(key.to_string(), uid);
        self.metrics.forced_deletions.inc();
        info!(
            "Forcefully deleted pod {} on downed node {} (policy {})",
            key, node_id, policy
        );
        Ok(())
    }

    /// Current deletion policy. Unset, unreadable or unknown values fall back
    /// to doing nothing.
    async fn deletion_policy(&self) -> NodeDownPodDeletionPolicy {
        match self
            .settings
            .get_setting(SETTING_NODE_DOWN_POD_DELETION_POLICY)
            .await
        {
            Ok(Some(value)) => value.parse::<NodeDownPodDeletionPolicy>().unwrap_or_else(|e| {
                warn!("{}, using {}", e, NodeDownPodDeletionPolicy::DoNothing);
                NodeDownPodDeletionPolicy::DoNothing
            }),
            Ok(None) => NodeDownPodDeletionPolicy::DoNothing,
            Err(e) => {
                warn!(
                    "Failed to read {}, using {}: {}",
                    SETTING_NODE_DOWN_POD_DELETION_POLICY,
                    NodeDownPodDeletionPolicy::DoNothing,
                    e
                );
                NodeDownPodDeletionPolicy::DoNothing
            }
        }
    }

    fn report(&self, err: &Error) {
        self.metrics.reported_errors.inc();
        self.error_sink.handle_error(err);
    }

    fn update_queue_depth(&self) {
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }
}

impl std::fmt::Debug for KubernetesPodController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesPodController")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryMirror;
    use crate::domain::ports::{ErrorSink, NodeHealthOracle, PodDeleter, SettingsStore};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use parking_lot::Mutex;

    const DRIVER: &str = "driver.longhorn.io";

    // =========================================================================
    // Fakes
    // =========================================================================

    #[derive(Default)]
    struct FakeDeleter {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl PodDeleter for FakeDeleter {
        async fn force_delete(&self, namespace: &str, name: &str) -> Result<()> {
            self.calls
                .lock()
                .push((namespace.to_string(), name.to_string()));
            if self.fail {
                return Err(Error::Internal("apiserver unavailable".into()));
            }
            Ok(())
        }
    }

    struct FakeSettings(Option<String>);

    #[async_trait]
    impl SettingsStore for FakeSettings {
        async fn get_setting(&self, name: &str) -> Result<Option<String>> {
            assert_eq!(name, SETTING_NODE_DOWN_POD_DELETION_POLICY);
            Ok(self.0.clone())
        }
    }

    struct FakeNodeHealth {
        down: bool,
    }

    #[async_trait]
    impl NodeHealthOracle for FakeNodeHealth {
        async fn is_node_down_or_deleted(&self, _node_name: &str) -> Result<bool> {
            Ok(self.down)
        }
    }

    struct UnreadableSettings;

    #[async_trait]
    impl SettingsStore for UnreadableSettings {
        async fn get_setting(&self, name: &str) -> Result<Option<String>> {
            Err(Error::Settings {
                name: name.to_string(),
                reason: "configmaps is forbidden".into(),
            })
        }
    }

    struct UnreachableNodeHealth;

    #[async_trait]
    impl NodeHealthOracle for UnreachableNodeHealth {
        async fn is_node_down_or_deleted(&self, _node_name: &str) -> Result<bool> {
            Err(Error::Internal("node lookup timed out".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<String>>,
    }

    impl ErrorSink for RecordingSink {
        fn handle_error(&self, err: &Error) {
            self.errors.lock().push(err.to_string());
        }
    }

    struct FailingMirror;

    impl<K> ObjectMirror<K> for FailingMirror {
        fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>> {
            Err(Error::MirrorLookup {
                kind: "PersistentVolumeClaim".into(),
                key: key.to_string(),
                reason: "index corrupted".into(),
            })
        }

        fn has_synced(&self) -> bool {
            true
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn owned_pod(name: &str, owner_kind: &str, deletion: Option<Time>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(format!("uid-{}", name)),
                deletion_timestamp: deletion,
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: owner_kind.into(),
                    name: "web".into(),
                    uid: "owner-uid".into(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                volumes: Some(vec![claim_volume("data", "data-claim")]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim_volume(name: &str, claim: &str) -> Volume {
        Volume {
            name: name.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.into(),
                read_only: None,
            }),
            ..Default::default()
        }
    }

    fn claim(name: &str, volume_name: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: volume_name.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn csi_volume(name: &str, driver: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: driver.into(),
                    volume_handle: name.into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn past() -> Option<Time> {
        Some(Time(Utc::now() - chrono::Duration::seconds(30)))
    }

    struct Harness {
        controller: Arc<KubernetesPodController>,
        pods: Arc<MemoryMirror<Pod>>,
        deleter: Arc<FakeDeleter>,
        sink: Arc<RecordingSink>,
    }

    fn harness_with(
        policy: Option<&str>,
        node_down: bool,
        deleter: FakeDeleter,
        pvcs: ObjectMirrorRef<PersistentVolumeClaim>,
    ) -> Harness {
        harness_from(
            Arc::new(FakeSettings(policy.map(String::from))),
            Arc::new(FakeNodeHealth { down: node_down }),
            deleter,
            pvcs,
        )
    }

    fn harness_from(
        settings: SettingsStoreRef,
        node_health: NodeHealthOracleRef,
        deleter: FakeDeleter,
        pvcs: ObjectMirrorRef<PersistentVolumeClaim>,
    ) -> Harness {
        let pods: Arc<MemoryMirror<Pod>> = Arc::new(MemoryMirror::synced());
        let pvs: Arc<MemoryMirror<PersistentVolume>> = Arc::new(MemoryMirror::synced());
        pvs.apply(csi_volume("pv-1", DRIVER));
        let deleter = Arc::new(deleter);
        let sink = Arc::new(RecordingSink::default());

        let deps = PodControllerDeps {
            pods: pods.clone(),
            pvs,
            pvcs,
            deleter: deleter.clone(),
            settings,
            node_health,
            error_sink: sink.clone(),
        };
        let config = ControllerConfig {
            workers: 2,
            cache_sync_poll_ms: 5,
            ..Default::default()
        };
        let controller =
            KubernetesPodController::new(config, deps, ControllerMetrics::new().unwrap());

        Harness {
            controller,
            pods,
            deleter,
            sink,
        }
    }

    fn claims() -> Arc<MemoryMirror<PersistentVolumeClaim>> {
        let pvcs: Arc<MemoryMirror<PersistentVolumeClaim>> = Arc::new(MemoryMirror::synced());
        pvcs.apply(claim("data-claim", Some("pv-1")));
        pvcs
    }

    fn harness(policy: Option<&str>, node_down: bool) -> Harness {
        harness_with(policy, node_down, FakeDeleter::default(), claims())
    }

    // =========================================================================
    // Enqueue Filter
    // =========================================================================

    #[test]
    fn test_pod_change_key_filters_by_driver() {
        let pvcs = MemoryMirror::synced();
        pvcs.apply(claim("ours", Some("pv-ours")));
        pvcs.apply(claim("theirs", Some("pv-theirs")));
        pvcs.apply(claim("pending", None));
        let pvs = MemoryMirror::synced();
        pvs.apply(csi_volume("pv-ours", DRIVER));
        pvs.apply(csi_volume("pv-theirs", "ebs.csi.aws.com"));

        let mut pod = owned_pod("web-0", "StatefulSet", None);
        let spec = pod.spec.as_mut().unwrap();

        spec.volumes = Some(vec![claim_volume("data", "theirs")]);
        assert_eq!(pod_change_key(&pod, &pvcs, &pvs, DRIVER).unwrap(), None);

        // Missing and unbound claims are skipped, the scan continues
        pod.spec.as_mut().unwrap().volumes = Some(vec![
            claim_volume("a", "missing"),
            claim_volume("b", "pending"),
            claim_volume("c", "ours"),
        ]);
        assert_eq!(
            pod_change_key(&pod, &pvcs, &pvs, DRIVER).unwrap(),
            Some("default/web-0".to_string())
        );

        pod.spec.as_mut().unwrap().volumes = None;
        assert_eq!(pod_change_key(&pod, &pvcs, &pvs, DRIVER).unwrap(), None);
    }

    #[test]
    fn test_pod_change_key_lookup_error_aborts() {
        let pvs: MemoryMirror<PersistentVolume> = MemoryMirror::synced();
        let pod = owned_pod("web-0", "StatefulSet", None);
        assert_matches!(
            pod_change_key(&pod, &FailingMirror, &pvs, DRIVER),
            Err(Error::MirrorLookup { .. })
        );
    }

    #[test]
    fn test_enqueue_reports_lookup_errors() {
        let h = harness_with(
            Some("delete-statefulset-pod"),
            true,
            FakeDeleter::default(),
            Arc::new(FailingMirror),
        );
        let pod = Arc::new(owned_pod("web-0", "StatefulSet", past()));
        h.controller.enqueue_pod_change(&PodEvent::Updated(pod));

        assert!(h.controller.queue().is_empty());
        assert_eq!(h.sink.errors.lock().len(), 1);
        assert_eq!(h.controller.metrics().reported_errors.get(), 1);
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let h = harness(None, false);
        let pod = Arc::new(owned_pod("web-0", "StatefulSet", None));
        h.controller
            .enqueue_pod_change(&PodEvent::Added(pod.clone()));
        h.controller.enqueue_pod_change(&PodEvent::Updated(pod));
        assert_eq!(h.controller.queue().len(), 1);
        assert_eq!(h.controller.metrics().queue_depth.get(), 1);
    }

    #[tokio::test]
    async fn test_deleted_event_clears_force_deletion_record() {
        let h = harness(Some("delete-statefulset-pod"), true);
        let pod = owned_pod("web-0", "StatefulSet", past());
        h.pods.apply(pod.clone());
        h.controller.sync_handler("default/web-0").await.unwrap();
        assert_eq!(h.deleter.calls.lock().len(), 1);

        // The deletion arrives without the claim volume, so nothing is queued
        let mut gone = pod.clone();
        gone.spec.as_mut().unwrap().volumes = None;
        h.controller
            .enqueue_pod_change(&PodEvent::Deleted(Arc::new(gone)));
        assert!(h.controller.queue().is_empty());

        // Same name and UID seen again is judged afresh
        h.controller.sync_handler("default/web-0").await.unwrap();
        assert_eq!(h.deleter.calls.lock().len(), 2);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[tokio::test]
    async fn test_force_deletes_statefulset_pod_on_down_node() {
        let h = harness(Some("delete-statefulset-pod"), true);
        h.pods.apply(owned_pod("web-0", "StatefulSet", past()));

        h.controller.sync_handler("default/web-0").await.unwrap();

        assert_eq!(
            *h.deleter.calls.lock(),
            vec![("default".to_string(), "web-0".to_string())]
        );
        assert_eq!(h.controller.metrics().forced_deletions.get(), 1);
    }

    #[tokio::test]
    async fn test_resync_does_not_delete_twice() {
        let h = harness(Some("delete-statefulset-pod"), true);
        h.pods.apply(owned_pod("web-0", "StatefulSet", past()));

        h.controller.sync_handler("default/web-0").await.unwrap();
        h.controller.sync_handler("default/web-0").await.unwrap();
        assert_eq!(h.deleter.calls.lock().len(), 1);

        // A replacement with a new UID is judged on its own
        let mut replacement = owned_pod("web-0", "StatefulSet", past());
        replacement.metadata.uid = Some("uid-replacement".into());
        h.pods.apply(replacement);
        h.controller.sync_handler("default/web-0").await.unwrap();
        assert_eq!(h.deleter.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_policy_gates_deletion() {
        for policy in [None, Some("do-nothing"), Some("delete-deployment-pod"), Some("bogus")] {
            let h = harness(policy, true);
            h.pods.apply(owned_pod("web-0", "StatefulSet", past()));
            h.controller.sync_handler("default/web-0").await.unwrap();
            assert!(h.deleter.calls.lock().is_empty(), "policy {:?}", policy);
        }

        let h = harness(Some("delete-both-statefulset-and-deployment-pod"), true);
        h.pods.apply(owned_pod("api-7d9-x2", "ReplicaSet", past()));
        h.controller.sync_handler("default/api-7d9-x2").await.unwrap();
        assert_eq!(h.deleter.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_action_unless_node_down_and_terminating() {
        let h = harness(Some("delete-statefulset-pod"), false);
        h.pods.apply(owned_pod("web-0", "StatefulSet", past()));
        h.controller.sync_handler("default/web-0").await.unwrap();
        assert!(h.deleter.calls.lock().is_empty());

        let h = harness(Some("delete-statefulset-pod"), true);
        h.pods.apply(owned_pod("web-0", "StatefulSet", None));
        let future = Some(Time(Utc::now() + chrono::Duration::minutes(5)));
        h.pods.apply(owned_pod("web-1", "StatefulSet", future));
        h.controller.sync_handler("default/web-0").await.unwrap();
        h.controller.sync_handler("default/web-1").await.unwrap();
        assert!(h.deleter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pod_is_success() {
        let h = harness(Some("delete-statefulset-pod"), true);
        h.controller.sync_handler("default/gone").await.unwrap();
        assert!(h.deleter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let h = harness(None, false);
        let key = "a/b/c".to_string();
        let result = h.controller.sync_handler(&key).await;
        assert_matches!(&result, Err(Error::Sync { .. }));

        h.controller.handle_err(result, &key);
        assert_eq!(h.controller.queue().num_requeues(&key), 0);
        assert!(h.controller.queue().is_empty());
        assert_eq!(h.sink.errors.lock().len(), 1);
        assert_eq!(h.controller.metrics().dropped_items.get(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_settings_fall_back_to_do_nothing() {
        let h = harness_from(
            Arc::new(UnreadableSettings),
            Arc::new(FakeNodeHealth { down: true }),
            FakeDeleter::default(),
            claims(),
        );
        h.pods.apply(owned_pod("web-0", "StatefulSet", past()));

        h.controller.sync_handler("default/web-0").await.unwrap();
        assert!(h.deleter.calls.lock().is_empty());
        assert!(h.sink.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_health_error_is_requeued() {
        let h = harness_from(
            Arc::new(FakeSettings(Some("delete-statefulset-pod".into()))),
            Arc::new(UnreachableNodeHealth),
            FakeDeleter::default(),
            claims(),
        );
        h.pods.apply(owned_pod("web-0", "StatefulSet", past()));
        let key = "default/web-0".to_string();

        let result = h.controller.sync_handler(&key).await;
        assert_matches!(&result, Err(Error::Sync { source, .. }) => {
            assert_matches!(&**source, Error::NodeHealth { node, .. } if node == "node-1");
        });
        assert!(result.as_ref().unwrap_err().is_retryable());

        h.controller.handle_err(result, &key);
        assert_eq!(h.controller.queue().num_requeues(&key), 1);
        assert!(h.sink.errors.lock().is_empty());
        assert!(h.deleter.calls.lock().is_empty());

        let next = tokio::time::timeout(Duration::from_secs(1), h.controller.queue().get()).await;
        assert_eq!(next.unwrap(), Some(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_key_dropped_after_max_retries() {
        let h = harness_with(
            Some("delete-statefulset-pod"),
            true,
            FakeDeleter {
                fail: true,
                ..Default::default()
            },
            claims(),
        );
        let pod = owned_pod("web-0", "StatefulSet", past());
        h.pods.apply(pod.clone());

        h.controller
            .enqueue_pod_change(&PodEvent::Updated(Arc::new(pod)));
        for _ in 0..DEFAULT_MAX_RETRIES {
            assert!(h.controller.process_next_work_item().await);
        }
        assert_eq!(h.deleter.calls.lock().len(), DEFAULT_MAX_RETRIES as usize);

        let errors = h.sink.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("dropping default/web-0 out of the queue after 3 failed attempts"));
        assert_eq!(h.controller.metrics().dropped_items.get(), 1);
        assert_eq!(h.controller.queue().num_requeues(&"default/web-0".to_string()), 0);

        // Nothing left to process
        let next = tokio::time::timeout(Duration::from_secs(3600), h.controller.queue().get()).await;
        assert!(next.is_err());
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    #[tokio::test]
    async fn test_run_processes_events_until_shutdown() {
        let h = harness(Some("delete-statefulset-pod"), true);
        let pod = owned_pod("web-0", "StatefulSet", past());
        h.pods.apply(pod.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(h.controller.clone().run(rx, shutdown.clone()));

        tx.send(PodEvent::Updated(Arc::new(pod))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.deleter.calls.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(h.controller.queue().is_shutting_down());
        assert_eq!(h.deleter.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_run_waits_for_cache_sync() {
        let pods: Arc<MemoryMirror<Pod>> = Arc::new(MemoryMirror::new());
        let pvs: Arc<MemoryMirror<PersistentVolume>> = Arc::new(MemoryMirror::synced());
        let pvcs: Arc<MemoryMirror<PersistentVolumeClaim>> = Arc::new(MemoryMirror::synced());
        let deps = PodControllerDeps {
            pods: pods.clone(),
            pvs,
            pvcs,
            deleter: Arc::new(FakeDeleter::default()),
            settings: Arc::new(FakeSettings(None)),
            node_health: Arc::new(FakeNodeHealth { down: true }),
            error_sink: Arc::new(RecordingSink::default()),
        };
        let controller = KubernetesPodController::new(
            ControllerConfig {
                cache_sync_poll_ms: 5,
                ..Default::default()
            },
            deps,
            ControllerMetrics::new().unwrap(),
        );

        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.clone().run(rx, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!run.is_finished());
        assert!(!controller.queue().is_shutting_down());
        pods.mark_synced();

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(controller.queue().is_shutting_down());
    }
}
