//! Kubernetes adapters
//!
//! Reflector-backed mirrors fed by list+watch streams, plus the API-server
//! implementations of the pod deleter, settings store and node health ports.

use crate::controller::events::{pod_key, PodEvent};
use crate::domain::ports::{NodeHealthOracle, ObjectKey, ObjectMirror, PodDeleter, SettingsStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Reflector Mirror
// =============================================================================

/// Mirror over a kube reflector store. Reports synced once the watcher has
/// delivered its first full list.
pub struct ReflectorMirror<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: &'static str,
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> ReflectorMirror<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> ObjectMirror<K> for ReflectorMirror<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>> {
        let object_ref = match &key.namespace {
            Some(namespace) => ObjectRef::<K>::new(&key.name).within(namespace),
            None => ObjectRef::<K>::new(&key.name),
        };
        Ok(self.store.get(&object_ref))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

fn watch_backoff() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(800))
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(None)
        .build()
}

/// Start mirroring every object of `api`'s kind. `on_event` sees each watch
/// event after the store has applied it.
pub fn spawn_mirror<K, F>(
    api: Api<K>,
    kind: &'static str,
    shutdown: CancellationToken,
    on_event: F,
) -> (Arc<ReflectorMirror<K>>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
    F: FnMut(Event<K>) + Send + 'static,
{
    let writer = Writer::<K>::default();
    let store = writer.as_reader();
    let synced = Arc::new(AtomicBool::new(false));

    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default()).backoff(watch_backoff()),
    );
    let handle = tokio::spawn(drive(kind, stream, synced.clone(), shutdown, on_event));

    let mirror = Arc::new(ReflectorMirror {
        kind,
        store,
        synced,
    });
    (mirror, handle)
}

/// Mirror all pods and forward their changes as [`PodEvent`]s
pub fn spawn_pod_mirror(
    client: Client,
    shutdown: CancellationToken,
) -> (
    Arc<ReflectorMirror<Pod>>,
    mpsc::UnboundedReceiver<PodEvent>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut translator = PodEventTranslator::default();
    let (mirror, handle) = spawn_mirror(Api::<Pod>::all(client), "Pod", shutdown, move |event| {
        for pod_event in translator.translate(event) {
            // Receiver gone means the controller stopped
            let _ = tx.send(pod_event);
        }
    });
    (mirror, rx, handle)
}

async fn drive<K, S, F>(
    kind: &'static str,
    stream: S,
    synced: Arc<AtomicBool>,
    shutdown: CancellationToken,
    mut on_event: F,
) where
    S: Stream<Item = watcher::Result<Event<K>>>,
    F: FnMut(Event<K>),
{
    futures::pin_mut!(stream);
    info!(kind, "watcher started");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if let Event::Restarted(objects) = &event {
                    debug!(kind, count = objects.len(), "watch restart");
                    if !synced.swap(true, Ordering::AcqRel) {
                        info!(kind, "initial list loaded");
                    }
                }
                on_event(event);
            }
            Some(Err(e)) => warn!(kind, "watch error: {}", e),
            None => {
                warn!(kind, "watcher stream ended");
                break;
            }
        }
    }
}

/// Turns raw watch events into add/update/delete notifications by tracking
/// which pods have been seen.
#[derive(Debug, Default)]
pub struct PodEventTranslator {
    known: HashSet<String>,
}

impl PodEventTranslator {
    pub fn translate(&mut self, event: Event<Pod>) -> Vec<PodEvent> {
        match event {
            Event::Applied(pod) => vec![self.observe(pod)],
            Event::Deleted(pod) => {
                self.known.remove(&pod_key(&pod));
                vec![PodEvent::Deleted(Arc::new(pod))]
            }
            Event::Restarted(pods) => {
                let previous = std::mem::take(&mut self.known);
                pods.into_iter()
                    .map(|pod| {
                        let key = pod_key(&pod);
                        let pod = Arc::new(pod);
                        let event = if previous.contains(&key) {
                            PodEvent::Updated(pod)
                        } else {
                            PodEvent::Added(pod)
                        };
                        self.known.insert(key);
                        event
                    })
                    .collect()
            }
        }
    }

    fn observe(&mut self, pod: Pod) -> PodEvent {
        let pod = Arc::new(pod);
        if self.known.insert(pod_key(&pod)) {
            PodEvent::Added(pod)
        } else {
            PodEvent::Updated(pod)
        }
    }
}

// =============================================================================
// Pod Deleter
// =============================================================================

/// Deletes pods through the API server with a zero grace period
#[derive(Clone)]
pub struct KubePodDeleter {
    client: Client,
}

impl KubePodDeleter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDeleter for KubePodDeleter {
    async fn force_delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match api.delete(name, &params).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Pod {}/{} already gone", namespace, name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Settings Store
// =============================================================================

/// Settings kept as keys of a single ConfigMap
#[derive(Clone)]
pub struct ConfigMapSettingsStore {
    api: Api<ConfigMap>,
    config_map: String,
}

impl ConfigMapSettingsStore {
    pub fn new(client: Client, namespace: &str, config_map: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            config_map: config_map.into(),
        }
    }
}

#[async_trait]
impl SettingsStore for ConfigMapSettingsStore {
    async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        let config_map = self
            .api
            .get_opt(&self.config_map)
            .await
            .map_err(|e| Error::Settings {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(config_map.as_ref().and_then(|cm| setting_value(cm, name)))
    }
}

/// Trimmed value of `name` in the ConfigMap, empty values count as unset
pub fn setting_value(config_map: &ConfigMap, name: &str) -> Option<String> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(name))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// =============================================================================
// Node Health
// =============================================================================

/// Node liveness from the API server's view of the node
#[derive(Clone)]
pub struct KubeNodeHealth {
    api: Api<Node>,
}

impl KubeNodeHealth {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeHealthOracle for KubeNodeHealth {
    async fn is_node_down_or_deleted(&self, node_name: &str) -> Result<bool> {
        if node_name.is_empty() {
            return Err(Error::Internal("pod is not scheduled to a node".into()));
        }
        match self.api.get_opt(node_name).await? {
            Some(node) => Ok(node_is_down(&node)),
            None => Ok(true),
        }
    }
}

/// A node is down when its `Ready` condition is reported and is not `True`
pub fn node_is_down(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|ready| ready.status != "True")
}
