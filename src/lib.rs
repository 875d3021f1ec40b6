//! Pod Tracker Operator
//!
//! A Kubernetes operator that keeps a cluster-wide (or per-namespace) list of
//! pod addresses in `PodTracker` objects, while a per-node agent adds node
//! address, capacity, and hosted pods to the same objects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Controller                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────────────┐ │
//! │  │  Pod watch   │──▶│   PodIndex   │   │     PodTracker watch      │ │
//! │  └──────┬───────┘   └──────┬───────┘   └─────────────┬─────────────┘ │
//! │         │ fanout           │ list                    │ by name       │
//! │         ▼                  ▼                         ▼               │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │  ResyncScheduler: WorkQueue ──▶ workers ──▶ Reconciler         │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │                    status.podIPs ▼                                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                          PodTracker (cluster-scoped)                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                    status.nodeInfo[node] ▲                           │
//! │  Agent (one per node): NodeReportCollector                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Finalizers, reconciliation, fanout and scheduling
//! - [`agent`]: Per-node report collection
//! - [`client`]: Kubernetes adapters and watch loops
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Ports, observed types and the in-memory cluster
//! - [`index`]: Watch-fed pod snapshot
//! - [`error`]: Error types and handling

pub mod agent;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod index;
pub mod metrics;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use agent::{CycleReport, NodeReportCollector};

pub use client::{watch_pods, watch_trackers, KubeClient};

pub use config::{AgentConfig, ControllerConfig};

pub use controller::{
    derive_pod_infos, FanoutIndex, FinalizerState, ReconcileOutcome, Reconciler,
    ResyncScheduler, WorkQueue,
};

pub use crd::{
    NodeInfo, NodeResources, PodInfo, PodTracker, PodTrackerSpec, PodTrackerStatus,
    POD_TRACKER_FINALIZER,
};

pub use domain::ports::{
    EventPublisher, HostState, NodeInventory, ObservedPod, PodInventory, TrackerStore,
    TriggerEvent, WatchEvent,
};

pub use domain::InMemoryCluster;

pub use error::{Error, ErrorAction, Result};

pub use index::PodIndex;

pub use metrics::OperatorMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
