//! Domain Ports - Core trait definitions for the pod tracker
//!
//! These traits define the boundaries between the reconciliation logic and
//! the cluster store. The kube adapter implements them against the API
//! server, the in-memory cluster implements them for tests.

use crate::crd::{NodeResources, PodInfo, PodTracker};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Observed Types
// =============================================================================

/// A pod as seen through the watched inventory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPod {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Assigned pod IP; empty until the pod has been given an address
    pub ip: String,
    /// Node the scheduler assigned the pod to
    pub node_name: Option<String>,
    /// Creation timestamp
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Lifecycle phase (Pending, Running, ...)
    pub phase: Option<String>,
}

impl ObservedPod {
    /// Whether the pod has an address and should be tracked
    pub fn has_address(&self) -> bool {
        !self.ip.is_empty()
    }

    /// Map to the tracked record, `None` for pods without an address
    pub fn to_pod_info(&self) -> Option<PodInfo> {
        if !self.has_address() {
            return None;
        }
        Some(PodInfo {
            pod_name: self.name.clone(),
            namespace: self.namespace.clone(),
            ip: self.ip.clone(),
            node_name: self.node_name.clone().unwrap_or_default(),
            creation_timestamp: self.creation_timestamp,
            phase: self.phase.clone().unwrap_or_default(),
        })
    }

    /// Index key
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }
}

/// Namespace-qualified pod identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Live state of a node as read by its agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// Node name
    pub name: String,
    /// First InternalIP address of the node
    pub internal_ip: Option<String>,
    /// Capacity and allocatable resources
    pub resources: NodeResources,
}

/// A change delivered by a watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object carried by the event
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Short verb for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

/// Anything that can cause a PodTracker to be reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// A pod changed; fanned out to every matching tracker
    Pod(WatchEvent<ObservedPod>),
    /// A tracker itself changed; reconciled by name
    Tracker(WatchEvent<String>),
}

// =============================================================================
// Tracker Store Port
// =============================================================================

/// Port for PodTracker storage with optimistic concurrency
///
/// Writes carry the resource version that was read; a stale version is
/// rejected with [`crate::Error::Conflict`].
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Get a tracker by name, `None` if it does not exist
    async fn get_tracker(&self, name: &str) -> Result<Option<PodTracker>>;

    /// List all trackers
    async fn list_trackers(&self) -> Result<Vec<PodTracker>>;

    /// Replace metadata and spec (used for finalizer changes)
    async fn update_tracker(&self, tracker: &PodTracker) -> Result<PodTracker>;

    /// Replace the status subresource
    async fn update_tracker_status(&self, tracker: &PodTracker) -> Result<PodTracker>;
}

// =============================================================================
// Inventory Ports
// =============================================================================

/// Port for reading the pod inventory
#[async_trait]
pub trait PodInventory: Send + Sync {
    /// List pods, optionally restricted to one namespace
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<ObservedPod>>;

    /// List pods scheduled on a node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<ObservedPod>>;
}

/// Port for reading node state
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Get the current state of a node
    async fn get_node(&self, name: &str) -> Result<HostState>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing cluster events about trackers
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Announce that a tracker's pod list was rewritten
    async fn status_updated(&self, tracker: &PodTracker, pod_count: usize) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type TrackerStoreRef = Arc<dyn TrackerStore>;
pub type PodInventoryRef = Arc<dyn PodInventory>;
pub type NodeInventoryRef = Arc<dyn NodeInventory>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ip: &str) -> ObservedPod {
        ObservedPod {
            name: "web-0".into(),
            namespace: "default".into(),
            ip: ip.into(),
            node_name: Some("node-1".into()),
            creation_timestamp: None,
            phase: Some("Running".into()),
        }
    }

    #[test]
    fn test_pod_without_address_is_not_tracked() {
        assert!(pod("").to_pod_info().is_none());
    }

    #[test]
    fn test_pod_info_mapping() {
        let info = pod("10.0.0.5").to_pod_info().unwrap();
        assert_eq!(info.pod_name, "web-0");
        assert_eq!(info.namespace, "default");
        assert_eq!(info.ip, "10.0.0.5");
        assert_eq!(info.node_name, "node-1");
        assert_eq!(info.phase, "Running");
    }

    #[test]
    fn test_pod_key_display() {
        assert_eq!(pod("").key().to_string(), "default/web-0");
    }

    #[test]
    fn test_watch_event_accessors() {
        let event = WatchEvent::Deleted(pod("10.0.0.5"));
        assert_eq!(event.kind(), "deleted");
        assert_eq!(event.object().name, "web-0");
    }
}
