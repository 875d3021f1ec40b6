//! PodTracker CRD
//!
//! A cluster-scoped aggregate of pod addresses. Its status is written by two
//! independent parties that own disjoint fields:
//!
//! - `podIPs` belongs to the controller and is recomputed wholesale on every
//!   reconcile.
//! - `nodeInfo` belongs to the node agents. Each agent inserts or replaces
//!   only the entry carrying its own node name.
//!
//! `lastUpdateTime` is touched by whichever side wrote last.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer token guarding PodTracker teardown
pub const POD_TRACKER_FINALIZER: &str = "podtracker.networking.learntosolveit.com/finalizer";

/// Kind name used in errors and logs
pub const POD_TRACKER_KIND: &str = "PodTracker";

// =============================================================================
// PodTracker CRD
// =============================================================================

/// PodTracker collects the addresses of pods across the cluster (or within a
/// single namespace) together with per-node capacity reports.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.learntosolveit.com",
    version = "v1",
    kind = "PodTracker",
    plural = "podtrackers",
    status = "PodTrackerStatus",
    printcolumn = r#"{"name": "Namespace", "type": "string", "jsonPath": ".spec.namespace"}"#,
    printcolumn = r#"{"name": "Updated", "type": "date", "jsonPath": ".status.lastUpdateTime"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PodTrackerSpec {
    /// Namespace to track pods in; empty tracks all namespaces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// A single tracked pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    /// Name of the pod
    pub pod_name: String,

    /// Namespace of the pod
    pub namespace: String,

    /// Pod IP address
    pub ip: String,

    /// Node the pod is scheduled on
    #[serde(default)]
    pub node_name: String,

    /// When the pod was created
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Lifecycle phase reported by the kubelet
    #[serde(default)]
    pub phase: String,
}

impl PodInfo {
    /// Identity of the pod within the cluster
    pub fn key(&self) -> (&str, &str) {
        (&self.namespace, &self.pod_name)
    }
}

/// Capacity figures of a node, kept as Kubernetes quantity strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    /// Total CPU capacity
    #[serde(default)]
    pub cpu_capacity: String,

    /// Total memory capacity
    #[serde(default)]
    pub memory_capacity: String,

    /// CPU available for pods
    #[serde(default)]
    pub cpu_allocatable: String,

    /// Memory available for pods
    #[serde(default)]
    pub memory_allocatable: String,
}

/// Report published by the agent running on one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Name of the reporting node
    pub node_name: String,

    /// Internal IP of the node
    #[serde(default, rename = "nodeIP")]
    pub node_ip: String,

    /// Capacity and allocatable resources
    #[serde(default)]
    pub resources: NodeResources,

    /// Pods with an address hosted on this node
    #[serde(default, rename = "podIPs")]
    pub pod_ips: Vec<PodInfo>,

    /// When the agent produced this report
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the PodTracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTrackerStatus {
    /// Tracked pods, sorted by namespace then name (controller-owned)
    #[serde(default, rename = "podIPs", skip_serializing_if = "Vec::is_empty")]
    pub pod_ips: Vec<PodInfo>,

    /// One report per node (agent-owned)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_info: Vec<NodeInfo>,

    /// Last time either writer touched the status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Implementations
// =============================================================================

impl PodTracker {
    /// Namespace filter, `None` when every namespace is tracked
    pub fn namespace_filter(&self) -> Option<&str> {
        if self.spec.namespace.is_empty() {
            None
        } else {
            Some(&self.spec.namespace)
        }
    }

    /// Whether a pod in `namespace` falls under this tracker
    pub fn tracks_namespace(&self, namespace: &str) -> bool {
        self.namespace_filter()
            .map(|filter| filter == namespace)
            .unwrap_or(true)
    }

    /// Check if the teardown finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == POD_TRACKER_FINALIZER)
    }

    /// Check if deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Currently stored pod list
    pub fn pod_ips(&self) -> &[PodInfo] {
        self.status
            .as_ref()
            .map(|s| s.pod_ips.as_slice())
            .unwrap_or_default()
    }

    /// Currently stored node reports
    pub fn node_info(&self) -> &[NodeInfo] {
        self.status
            .as_ref()
            .map(|s| s.node_info.as_slice())
            .unwrap_or_default()
    }

    /// Stored resource version, empty for objects never persisted
    pub fn version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or_default()
    }
}

impl PodTrackerStatus {
    /// Replace the controller-owned pod list, leaving node reports untouched
    pub fn set_pod_ips(&mut self, pod_ips: Vec<PodInfo>, now: DateTime<Utc>) {
        self.pod_ips = pod_ips;
        self.last_update_time = Some(now);
    }

    /// Insert or replace the report for `info.node_name`
    ///
    /// Entries of other nodes keep their content and position.
    pub fn upsert_node_info(&mut self, info: NodeInfo, now: DateTime<Utc>) {
        if let Some(existing) = self
            .node_info
            .iter_mut()
            .find(|n| n.node_name == info.node_name)
        {
            *existing = info;
        } else {
            self.node_info.push(info);
        }
        self.last_update_time = Some(now);
    }

    /// Look up the report of one node
    pub fn node(&self, node_name: &str) -> Option<&NodeInfo> {
        self.node_info.iter().find(|n| n.node_name == node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn tracker(namespace: &str) -> PodTracker {
        PodTracker {
            metadata: ObjectMeta {
                name: Some("tracker".into()),
                ..Default::default()
            },
            spec: PodTrackerSpec {
                namespace: namespace.into(),
            },
            status: None,
        }
    }

    fn node(name: &str, cpu: &str) -> NodeInfo {
        NodeInfo {
            node_name: name.into(),
            node_ip: "192.168.1.10".into(),
            resources: NodeResources {
                cpu_capacity: cpu.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_namespace_filter() {
        let all = tracker("");
        assert_eq!(all.namespace_filter(), None);
        assert!(all.tracks_namespace("default"));
        assert!(all.tracks_namespace("kube-system"));

        let scoped = tracker("ns-a");
        assert_eq!(scoped.namespace_filter(), Some("ns-a"));
        assert!(scoped.tracks_namespace("ns-a"));
        assert!(!scoped.tracks_namespace("ns-b"));
    }

    #[test]
    fn test_upsert_node_info_replaces_in_place() {
        let now = Utc::now();
        let mut status = PodTrackerStatus::default();
        status.upsert_node_info(node("node-1", "4"), now);
        status.upsert_node_info(node("node-2", "8"), now);
        status.upsert_node_info(node("node-1", "16"), now);

        assert_eq!(status.node_info.len(), 2);
        assert_eq!(status.node_info[0].node_name, "node-1");
        assert_eq!(status.node_info[0].resources.cpu_capacity, "16");
        assert_eq!(status.node_info[1].resources.cpu_capacity, "8");
        assert_eq!(status.last_update_time, Some(now));
    }

    #[test]
    fn test_set_pod_ips_keeps_node_info() {
        let now = Utc::now();
        let mut status = PodTrackerStatus::default();
        status.upsert_node_info(node("node-1", "4"), now);
        let reports = status.node_info.clone();

        status.set_pod_ips(
            vec![PodInfo {
                pod_name: "web-0".into(),
                namespace: "default".into(),
                ip: "10.0.0.5".into(),
                ..Default::default()
            }],
            now,
        );

        assert_eq!(status.pod_ips.len(), 1);
        assert_eq!(status.node_info, reports);
    }

    #[test]
    fn test_status_wire_names() {
        let mut status = PodTrackerStatus::default();
        status.upsert_node_info(node("node-1", "4"), Utc::now());
        status.pod_ips.push(PodInfo {
            pod_name: "web-0".into(),
            namespace: "default".into(),
            ip: "10.0.0.5".into(),
            ..Default::default()
        });

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("podIPs").is_some());
        assert_eq!(json["nodeInfo"][0]["nodeIP"], "192.168.1.10");
        assert_eq!(json["nodeInfo"][0]["resources"]["cpuCapacity"], "4");
        assert_eq!(json["podIPs"][0]["podName"], "web-0");
    }

    #[test]
    fn test_finalizer_and_deletion_markers() {
        let mut t = tracker("");
        assert!(!t.has_finalizer());
        assert!(!t.is_deleting());

        t.metadata.finalizers = Some(vec![POD_TRACKER_FINALIZER.to_string()]);
        assert!(t.has_finalizer());
    }
}
