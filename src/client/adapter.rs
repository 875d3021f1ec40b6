//! Kubernetes Adapter
//!
//! Implements the store, inventory and event ports against the API server.
//! Status writes go through the status subresource with the full object so
//! the stored resource version is checked; a stale copy comes back as
//! [`Error::Conflict`].

use crate::crd::{NodeResources, PodTracker, POD_TRACKER_KIND};
use crate::domain::ports::{
    EventPublisher, HostState, NodeInventory, ObservedPod, PodInventory, TrackerStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Controller name used as event reporter
pub const REPORTER_NAME: &str = "pod-tracker-controller";

// =============================================================================
// Client
// =============================================================================

/// Port implementation backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER_NAME.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Connect using the in-cluster or kubeconfig defaults
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// The wrapped client, for watchers
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn trackers(&self) -> Api<PodTracker> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl TrackerStore for KubeClient {
    async fn get_tracker(&self, name: &str) -> Result<Option<PodTracker>> {
        self.trackers()
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, POD_TRACKER_KIND, name))
    }

    async fn list_trackers(&self) -> Result<Vec<PodTracker>> {
        let list = self.trackers().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_tracker(&self, tracker: &PodTracker) -> Result<PodTracker> {
        let name = tracker.name_any();
        self.trackers()
            .replace(&name, &PostParams::default(), tracker)
            .await
            .map_err(|e| Error::from_kube(e, POD_TRACKER_KIND, &name))
    }

    async fn update_tracker_status(&self, tracker: &PodTracker) -> Result<PodTracker> {
        let name = tracker.name_any();
        let body = serde_json::to_vec(tracker)?;
        self.trackers()
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::from_kube(e, POD_TRACKER_KIND, &name))
    }
}

#[async_trait]
impl PodInventory for KubeClient {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<ObservedPod>> {
        let list = self.pods(namespace).list(&ListParams::default()).await?;
        observe_pods(&list.items)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<ObservedPod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let list = self.pods(None).list(&params).await?;
        debug!("Listed {} pods on node {}", list.items.len(), node_name);
        observe_pods(&list.items)
    }
}

#[async_trait]
impl NodeInventory for KubeClient {
    async fn get_node(&self, name: &str) -> Result<HostState> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, "Node", name))?;
        Ok(host_state(&node))
    }
}

#[async_trait]
impl EventPublisher for KubeClient {
    async fn status_updated(&self, tracker: &PodTracker, pod_count: usize) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            tracker.object_ref(&()),
        );
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "StatusUpdated".into(),
                note: Some(format!("Updated status with {} pods", pod_count)),
                action: "Reconcile".into(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl TryFrom<&Pod> for ObservedPod {
    type Error = Error;

    fn try_from(pod: &Pod) -> Result<Self> {
        let name = pod.metadata.name.clone().ok_or_else(|| Error::UnexpectedObject {
            expected: "pod with a name".into(),
            found: "pod without metadata.name".into(),
        })?;
        let status = pod.status.as_ref();
        Ok(ObservedPod {
            name,
            namespace: pod.namespace().unwrap_or_default(),
            ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            creation_timestamp: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            phase: status.and_then(|s| s.phase.clone()),
        })
    }
}

fn observe_pods(pods: &[Pod]) -> Result<Vec<ObservedPod>> {
    pods.iter().map(ObservedPod::try_from).collect()
}

/// Node address and resources; quantities missing from the node read "0"
pub fn host_state(node: &Node) -> HostState {
    let status = node.status.as_ref();
    let internal_ip = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
        });
    let capacity = status.and_then(|s| s.capacity.as_ref());
    let allocatable = status.and_then(|s| s.allocatable.as_ref());

    HostState {
        name: node.name_any(),
        internal_ip,
        resources: NodeResources {
            cpu_capacity: quantity(capacity, "cpu"),
            memory_capacity: quantity(capacity, "memory"),
            cpu_allocatable: quantity(allocatable, "cpu"),
            memory_allocatable: quantity(allocatable, "memory"),
        },
    }
}

fn quantity(values: Option<&BTreeMap<String, Quantity>>, key: &str) -> String {
    values
        .and_then(|v| v.get(key))
        .map(|q| q.0.clone())
        .unwrap_or_else(|| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn k8s_pod(name: Option<&str>, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(String::from),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(String::from),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_conversion() {
        let observed = ObservedPod::try_from(&k8s_pod(Some("web-0"), Some("10.0.0.5"))).unwrap();
        assert_eq!(observed.name, "web-0");
        assert_eq!(observed.namespace, "default");
        assert_eq!(observed.ip, "10.0.0.5");
        assert_eq!(observed.node_name.as_deref(), Some("node-1"));
        assert_eq!(observed.phase.as_deref(), Some("Running"));
    }

    #[test]
    fn test_pod_without_ip_has_empty_address() {
        let observed = ObservedPod::try_from(&k8s_pod(Some("web-0"), None)).unwrap();
        assert!(!observed.has_address());
    }

    #[test]
    fn test_pod_without_name_rejected() {
        let err = ObservedPod::try_from(&k8s_pod(None, Some("10.0.0.5"))).unwrap_err();
        assert_matches!(err, Error::UnexpectedObject { .. });
    }

    #[test]
    fn test_host_state_from_node() {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity("4".into()));
        capacity.insert("memory".to_string(), Quantity("16Gi".into()));
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        address: "node-1.example".into(),
                        type_: "Hostname".into(),
                    },
                    NodeAddress {
                        address: "192.168.1.10".into(),
                        type_: "InternalIP".into(),
                    },
                ]),
                capacity: Some(capacity),
                ..Default::default()
            }),
        };

        let host = host_state(&node);
        assert_eq!(host.name, "node-1");
        assert_eq!(host.internal_ip.as_deref(), Some("192.168.1.10"));
        assert_eq!(host.resources.cpu_capacity, "4");
        assert_eq!(host.resources.memory_capacity, "16Gi");
        assert_eq!(host.resources.cpu_allocatable, "0");
        assert_eq!(host.resources.memory_allocatable, "0");
    }
}
