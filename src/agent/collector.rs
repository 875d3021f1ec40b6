//! Node Report Collector
//!
//! Runs once per node. Every cycle it reads the node's address and
//! resources plus the addressed pods scheduled on it, then writes that
//! report into the `nodeInfo` list of every PodTracker. Only the entry with
//! its own node name is ever touched; `podIPs` and other nodes' entries are
//! carried over from the copy that was just read.

use crate::config::AgentConfig;
use crate::crd::NodeInfo;
use crate::domain::deadline::with_deadline;
use crate::domain::ports::{NodeInventoryRef, PodInventoryRef, TrackerStoreRef};
use crate::error::Result;
use crate::metrics::OperatorMetrics;
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one report cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Trackers that now carry the fresh report
    pub updated: usize,
    /// Trackers whose write failed; retried next cycle
    pub failed: usize,
}

/// Periodic per-node reporter
pub struct NodeReportCollector {
    node_name: String,
    nodes: NodeInventoryRef,
    pods: PodInventoryRef,
    trackers: TrackerStoreRef,
    metrics: Arc<OperatorMetrics>,
    report_interval: Duration,
    call_timeout: Duration,
}

impl NodeReportCollector {
    pub fn new(
        config: &AgentConfig,
        nodes: NodeInventoryRef,
        pods: PodInventoryRef,
        trackers: TrackerStoreRef,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            node_name: config.node_name.clone(),
            nodes,
            pods,
            trackers,
            metrics,
            report_interval: config.report_interval(),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Build this node's report from live state
    pub async fn collect(&self) -> Result<NodeInfo> {
        let node = with_deadline(
            self.call_timeout,
            "get node",
            self.nodes.get_node(&self.node_name),
        )
        .await?;
        let pods = with_deadline(
            self.call_timeout,
            "list node pods",
            self.pods.list_pods_on_node(&self.node_name),
        )
        .await?;

        let mut pod_ips: Vec<_> = pods.iter().filter_map(|p| p.to_pod_info()).collect();
        pod_ips.sort_by(|a, b| a.key().cmp(&b.key()));

        Ok(NodeInfo {
            node_name: node.name,
            node_ip: node.internal_ip.unwrap_or_default(),
            resources: node.resources,
            pod_ips,
            last_update_time: Some(Utc::now()),
        })
    }

    /// Collect once and write the report into every tracker
    ///
    /// A failed collection skips the cycle without touching any tracker. A
    /// failed write only affects its own tracker.
    pub async fn report_cycle(&self) -> Result<CycleReport> {
        let info = self.collect().await?;
        let trackers = with_deadline(
            self.call_timeout,
            "list trackers",
            self.trackers.list_trackers(),
        )
        .await?;

        let mut report = CycleReport::default();
        for tracker in trackers {
            let name = tracker.name_any();
            match self.write_report(&name, info.clone()).await {
                Ok(true) => {
                    report.updated += 1;
                    self.metrics.node_reports.with_label_values(&["updated"]).inc();
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    self.metrics.node_reports.with_label_values(&["failed"]).inc();
                    warn!(
                        "Failed to write node {} report to PodTracker {}: {}",
                        self.node_name, name, e
                    );
                }
            }
        }

        info!(
            "Node {} reported {} pods to {} trackers ({} failed)",
            self.node_name,
            info.pod_ips.len(),
            report.updated,
            report.failed
        );
        Ok(report)
    }

    /// Merge the report into a fresh copy; false when there is nothing to write
    ///
    /// Trackers that are gone or carry a deletion timestamp are skipped. A
    /// deleting tracker only waits for its finalizer to be released, and a
    /// write there would only contend with that metadata update.
    async fn write_report(&self, name: &str, info: NodeInfo) -> Result<bool> {
        let tracker = with_deadline(
            self.call_timeout,
            "get tracker",
            self.trackers.get_tracker(name),
        )
        .await?;
        let mut tracker = match tracker {
            Some(tracker) if !tracker.is_deleting() => tracker,
            _ => {
                debug!("Skipping PodTracker {} which is gone or being deleted", name);
                return Ok(false);
            }
        };

        let mut status = tracker.status.take().unwrap_or_default();
        status.upsert_node_info(info, Utc::now());
        tracker.status = Some(status);
        with_deadline(
            self.call_timeout,
            "update tracker status",
            self.trackers.update_tracker_status(&tracker),
        )
        .await?;
        Ok(true)
    }

    /// Report on every interval tick until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting node report collector for {} every {:?}",
            self.node_name, self.report_interval
        );
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.report_cycle().await {
                        error!("Node {} report cycle failed: {}", self.node_name, e);
                    }
                }
            }
        }
        info!("Node report collector for {} stopped", self.node_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::{derive_pod_infos, Reconciler};
    use crate::crd::NodeResources;
    use crate::domain::ports::{HostState, ObservedPod, PodInventory, TrackerStore};
    use crate::domain::InMemoryCluster;
    use std::collections::HashSet;

    fn host(name: &str, ip: &str) -> HostState {
        HostState {
            name: name.into(),
            internal_ip: Some(ip.into()),
            resources: NodeResources {
                cpu_capacity: "4".into(),
                memory_capacity: "16Gi".into(),
                cpu_allocatable: "3800m".into(),
                memory_allocatable: "15Gi".into(),
            },
        }
    }

    fn pod(name: &str, ip: &str, node: &str) -> ObservedPod {
        ObservedPod {
            name: name.into(),
            namespace: "default".into(),
            ip: ip.into(),
            node_name: Some(node.into()),
            creation_timestamp: None,
            phase: Some("Running".into()),
        }
    }

    fn collector(cluster: &Arc<InMemoryCluster>, node: &str) -> NodeReportCollector {
        let config = AgentConfig {
            node_name: node.into(),
            ..Default::default()
        };
        NodeReportCollector::new(
            &config,
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            OperatorMetrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_collect_builds_node_report() {
        let cluster = InMemoryCluster::new();
        cluster.set_node(host("node-1", "192.168.1.10"));
        cluster.upsert_pod(pod("web-1", "10.0.0.6", "node-1"));
        cluster.upsert_pod(pod("web-0", "10.0.0.5", "node-1"));
        cluster.upsert_pod(pod("pending", "", "node-1"));
        cluster.upsert_pod(pod("elsewhere", "10.0.1.5", "node-2"));

        let info = collector(&cluster, "node-1").collect().await.unwrap();
        assert_eq!(info.node_name, "node-1");
        assert_eq!(info.node_ip, "192.168.1.10");
        assert_eq!(info.resources.cpu_allocatable, "3800m");
        let names: Vec<&str> = info.pod_ips.iter().map(|p| p.pod_name.as_str()).collect();
        assert_eq!(names, vec!["web-0", "web-1"]);
        assert!(info.last_update_time.is_some());
    }

    #[tokio::test]
    async fn test_two_nodes_report_into_one_tracker() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        cluster.set_node(host("node-1", "192.168.1.10"));
        cluster.set_node(host("node-2", "192.168.1.11"));
        cluster.upsert_pod(pod("web-0", "10.0.0.5", "node-1"));
        cluster.upsert_pod(pod("web-1", "10.0.1.5", "node-2"));

        let first = collector(&cluster, "node-1");
        let second = collector(&cluster, "node-2");
        first.report_cycle().await.unwrap();
        second.report_cycle().await.unwrap();
        // A repeat report replaces, never duplicates
        first.report_cycle().await.unwrap();

        let stored = cluster.tracker("all").unwrap();
        assert_eq!(stored.node_info().len(), 2);
        let status = stored.status.as_ref().unwrap();
        assert_eq!(status.node("node-1").unwrap().node_ip, "192.168.1.10");
        assert_eq!(status.node("node-2").unwrap().pod_ips[0].pod_name, "web-1");
    }

    #[tokio::test]
    async fn test_report_never_touches_pod_list() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        cluster.set_node(host("node-1", "192.168.1.10"));
        cluster.upsert_pod(pod("web-0", "10.0.0.5", "node-1"));

        // Controller-owned list that differs from what the agent sees
        let mut seeded = cluster.tracker("all").unwrap();
        let mut status = seeded.status.take().unwrap_or_default();
        status.set_pod_ips(
            vec![pod("other", "10.9.9.9", "node-9").to_pod_info().unwrap()],
            Utc::now(),
        );
        seeded.status = Some(status);
        cluster.update_tracker_status(&seeded).await.unwrap();
        let before = cluster.tracker("all").unwrap().pod_ips().to_vec();

        collector(&cluster, "node-1").report_cycle().await.unwrap();
        let stored = cluster.tracker("all").unwrap();
        assert_eq!(stored.pod_ips(), before.as_slice());
        assert_eq!(stored.node_info().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_cycle() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("a", "");
        cluster.create_tracker("b", "");
        cluster.set_node(host("node-1", "192.168.1.10"));
        cluster.interleave_status_write("a", |_| {});

        let c = collector(&cluster, "node-1");
        let report = c.report_cycle().await.unwrap();
        assert_eq!(report, CycleReport { updated: 1, failed: 1 });
        assert!(cluster.tracker("a").unwrap().node_info().is_empty());
        assert_eq!(cluster.tracker("b").unwrap().node_info().len(), 1);
        assert_eq!(c.metrics.node_reports.with_label_values(&["failed"]).get(), 1);

        // Dropped until the next cycle, which succeeds
        let report = c.report_cycle().await.unwrap();
        assert_eq!(report, CycleReport { updated: 2, failed: 0 });
        assert_eq!(cluster.tracker("b").unwrap().node_info().len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_tracker_skipped() {
        let cluster = InMemoryCluster::new();
        let mut tracker = cluster.create_tracker("all", "");
        tracker.metadata.finalizers = Some(vec![crate::crd::POD_TRACKER_FINALIZER.into()]);
        cluster.update_tracker(&tracker).await.unwrap();
        cluster.mark_for_deletion("all");
        cluster.set_node(host("node-1", "192.168.1.10"));

        let report = collector(&cluster, "node-1").report_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(cluster.status_writes("all"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reports_and_reconciles_interleave_safely() {
        let cluster = InMemoryCluster::new();
        cluster.set_node(host("node-1", "192.168.1.10"));
        cluster.set_node(host("node-2", "192.168.1.11"));
        cluster.create_tracker("all", "");
        let reconciler = Arc::new(Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            OperatorMetrics::new().unwrap(),
            &ControllerConfig::default(),
        ));
        reconciler.reconcile("all").await.unwrap();

        let agents: Vec<_> = ["node-1", "node-2"]
            .iter()
            .map(|node| {
                let c = collector(&cluster, node);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        // Conflicting writes are dropped until the next cycle
                        let _ = c.report_cycle().await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        let controller = {
            let cluster = cluster.clone();
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let node = if i % 2 == 0 { "node-1" } else { "node-2" };
                    let ip = match i % 9 {
                        0 => String::new(),
                        _ => format!("10.0.0.{}", i % 7 + 1),
                    };
                    cluster.upsert_pod(pod(&format!("web-{}", i % 5), &ip, node));
                    let _ = reconciler.reconcile("all").await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for agent in agents {
            agent.await.unwrap();
        }
        controller.await.unwrap();

        // One quiet round from every writer
        reconciler.reconcile("all").await.unwrap();
        for node in ["node-1", "node-2"] {
            collector(&cluster, node).report_cycle().await.unwrap();
        }

        let stored = cluster.tracker("all").unwrap();
        let pod_keys: HashSet<_> = stored.pod_ips().iter().map(|p| p.key()).collect();
        assert_eq!(pod_keys.len(), stored.pod_ips().len());
        assert_eq!(
            stored.pod_ips(),
            derive_pod_infos(&cluster.list_pods(None).await.unwrap()).as_slice()
        );

        let mut nodes: Vec<&str> = stored
            .node_info()
            .iter()
            .map(|n| n.node_name.as_str())
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["node-1", "node-2"]);
        for node in ["node-1", "node-2"] {
            let reported = collector(&cluster, node).collect().await.unwrap();
            let status = stored.status.as_ref().unwrap();
            assert_eq!(status.node(node).unwrap().pod_ips, reported.pod_ips);
        }
    }

    #[tokio::test]
    async fn test_failed_collection_skips_cycle() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");

        // Node object missing
        assert!(collector(&cluster, "node-1").report_cycle().await.is_err());
        assert_eq!(cluster.status_writes("all"), 0);
    }

    #[tokio::test]
    async fn test_missing_internal_ip_reported_empty() {
        let cluster = InMemoryCluster::new();
        cluster.set_node(HostState {
            name: "node-1".into(),
            ..Default::default()
        });
        let info = collector(&cluster, "node-1").collect().await.unwrap();
        assert_eq!(info.node_ip, "");
        assert!(info.pod_ips.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cluster = InMemoryCluster::new();
        cluster.create_tracker("all", "");
        cluster.set_node(host("node-1", "192.168.1.10"));
        let c = collector(&cluster, "node-1");
        let token = CancellationToken::new();

        let child = token.clone();
        let cancel = async move {
            while cluster.status_writes("all") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            child.cancel();
        };
        tokio::join!(c.run(token.clone()), cancel);
        assert!(token.is_cancelled());
    }
}
