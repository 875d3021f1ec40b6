//! In-Memory Cluster
//!
//! A single-process stand-in for the API server implementing every port.
//! It keeps resource versions and rejects stale writes the way the real
//! store does, erases deleting objects once their finalizers are gone, and
//! counts writes per tracker so tests can assert on what was persisted.

use crate::crd::{PodTracker, PodTrackerSpec, POD_TRACKER_KIND};
use crate::domain::ports::{
    EventPublisher, HostState, NodeInventory, ObservedPod, PodInventory, PodKey, TrackerStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// A status write applied by some other party right before the next write
type InterleavedWrite = Box<dyn FnOnce(&mut PodTracker) + Send>;

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Default)]
struct ClusterState {
    trackers: BTreeMap<String, PodTracker>,
    pods: BTreeMap<PodKey, ObservedPod>,
    nodes: BTreeMap<String, HostState>,
    last_version: u64,
    status_writes: HashMap<String, u32>,
    metadata_writes: HashMap<String, u32>,
    interleaved: HashMap<String, VecDeque<InterleavedWrite>>,
    published: Vec<(String, usize)>,
    unavailable: bool,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::Transient("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// In-memory implementation of the store and inventory ports
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a tracker with the given namespace filter (empty = all)
    pub fn create_tracker(&self, name: &str, namespace: &str) -> PodTracker {
        let mut state = self.state.lock();
        let tracker = PodTracker {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(state.bump()),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: PodTrackerSpec {
                namespace: namespace.to_string(),
            },
            status: None,
        };
        state.trackers.insert(name.to_string(), tracker.clone());
        tracker
    }

    /// Snapshot of a stored tracker, bypassing availability and counters
    pub fn tracker(&self, name: &str) -> Option<PodTracker> {
        self.state.lock().trackers.get(name).cloned()
    }

    /// Request deletion; objects without finalizers are erased at once
    pub fn mark_for_deletion(&self, name: &str) {
        let mut state = self.state.lock();
        let version = state.bump();
        let erase = match state.trackers.get_mut(name) {
            Some(tracker) => {
                if tracker.metadata.deletion_timestamp.is_none() {
                    tracker.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                tracker.metadata.resource_version = Some(version);
                tracker.finalizers().is_empty()
            }
            None => false,
        };
        if erase {
            state.trackers.remove(name);
        }
    }

    /// Add or replace a pod
    pub fn upsert_pod(&self, pod: ObservedPod) {
        self.state.lock().pods.insert(pod.key(), pod);
    }

    /// Remove a pod
    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<ObservedPod> {
        self.state.lock().pods.remove(&PodKey::new(namespace, name))
    }

    /// Add or replace a node
    pub fn set_node(&self, node: HostState) {
        self.state.lock().nodes.insert(node.name.clone(), node);
    }

    /// Make every port call fail with a transient error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Apply `write` to `name` as a concurrent status write just before the
    /// next status update of that tracker, so the update sees a stale version
    pub fn interleave_status_write<F>(&self, name: &str, write: F)
    where
        F: FnOnce(&mut PodTracker) + Send + 'static,
    {
        self.state
            .lock()
            .interleaved
            .entry(name.to_string())
            .or_default()
            .push_back(Box::new(write));
    }

    /// Number of persisted status writes for a tracker
    pub fn status_writes(&self, name: &str) -> u32 {
        self.state.lock().status_writes.get(name).copied().unwrap_or(0)
    }

    /// Number of persisted metadata writes for a tracker
    pub fn metadata_writes(&self, name: &str) -> u32 {
        self.state.lock().metadata_writes.get(name).copied().unwrap_or(0)
    }

    /// Events published so far as (tracker, pod count)
    pub fn published_events(&self) -> Vec<(String, usize)> {
        self.state.lock().published.clone()
    }
}

// =============================================================================
// Port Implementations
// =============================================================================

#[async_trait]
impl TrackerStore for InMemoryCluster {
    async fn get_tracker(&self, name: &str) -> Result<Option<PodTracker>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.trackers.get(name).cloned())
    }

    async fn list_trackers(&self) -> Result<Vec<PodTracker>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.trackers.values().cloned().collect())
    }

    async fn update_tracker(&self, tracker: &PodTracker) -> Result<PodTracker> {
        let name = tracker.name_any();
        let mut state = self.state.lock();
        state.check_available()?;

        let stored_version = match state.trackers.get(&name) {
            Some(stored) => stored.version().to_string(),
            None => return Err(Error::not_found(POD_TRACKER_KIND, &name)),
        };
        if stored_version != tracker.version() {
            return Err(Error::conflict(POD_TRACKER_KIND, &name));
        }

        let version = state.bump();
        *state.metadata_writes.entry(name.clone()).or_default() += 1;

        let stored = match state.trackers.get_mut(&name) {
            Some(stored) => stored,
            None => return Err(Error::not_found(POD_TRACKER_KIND, &name)),
        };
        // Deletion timestamp and status are not writable through this path
        let deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        stored.metadata = tracker.metadata.clone();
        stored.metadata.deletion_timestamp = deletion_timestamp;
        stored.metadata.resource_version = Some(version);
        stored.spec = tracker.spec.clone();

        let updated = stored.clone();
        if updated.is_deleting() && updated.finalizers().is_empty() {
            state.trackers.remove(&name);
        }
        Ok(updated)
    }

    async fn update_tracker_status(&self, tracker: &PodTracker) -> Result<PodTracker> {
        let name = tracker.name_any();
        let mut state = self.state.lock();
        state.check_available()?;

        if !state.trackers.contains_key(&name) {
            return Err(Error::not_found(POD_TRACKER_KIND, &name));
        }

        let interleaved = state
            .interleaved
            .get_mut(&name)
            .and_then(|queue| queue.pop_front());
        if let Some(write) = interleaved {
            let version = state.bump();
            if let Some(stored) = state.trackers.get_mut(&name) {
                write(stored);
                stored.metadata.resource_version = Some(version);
            }
        }

        let version = state.bump();
        let stored = match state.trackers.get_mut(&name) {
            Some(stored) => stored,
            None => return Err(Error::not_found(POD_TRACKER_KIND, &name)),
        };
        if stored.version() != tracker.version() {
            return Err(Error::conflict(POD_TRACKER_KIND, &name));
        }
        stored.status = tracker.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        *state.status_writes.entry(name).or_default() += 1;
        Ok(updated)
    }
}

#[async_trait]
impl PodInventory for InMemoryCluster {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<ObservedPod>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .pods
            .values()
            .filter(|p| namespace.map(|ns| p.namespace == ns).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<ObservedPod>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .pods
            .values()
            .filter(|p| p.node_name.as_deref() == Some(node_name))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeInventory for InMemoryCluster {
    async fn get_node(&self, name: &str) -> Result<HostState> {
        let state = self.state.lock();
        state.check_available()?;
        state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Node", name))
    }
}

#[async_trait]
impl EventPublisher for InMemoryCluster {
    async fn status_updated(&self, tracker: &PodTracker, pod_count: usize) -> Result<()> {
        self.state
            .lock()
            .published
            .push((tracker.name_any(), pod_count));
        Ok(())
    }
}
