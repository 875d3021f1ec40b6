//! PodTracker Reconciler
//!
//! Drives one tracker towards its desired state per call:
//!
//! 1. Missing trackers are done.
//! 2. Trackers without the finalizer get it, and nothing else happens.
//! 3. Deleting trackers release the finalizer, and nothing else happens.
//! 4. Active trackers get `status.podIPs` recomputed from the pod
//!    inventory and written only when it differs structurally from what
//!    is stored.
//!
//! Status writes start from a copy fetched right before the write and keep
//! its `nodeInfo` verbatim. A version conflict restarts the steady-state
//! step from a fresh read, a bounded number of times.

use crate::config::ControllerConfig;
use crate::controller::finalizer::{
    add_finalizer, remove_finalizer, FinalizerState, FinalizerTransition,
};
use crate::crd::{PodInfo, PodTracker};
use crate::domain::deadline::with_deadline;
use crate::domain::ports::{EventPublisherRef, ObservedPod, PodInventoryRef, TrackerStoreRef};
use crate::error::{Error, Result};
use crate::metrics::OperatorMetrics;
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Outcome
// =============================================================================

/// Result of one successful reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The tracker does not exist (anymore)
    NotFound,
    /// The finalizer was added; status work is left to the next cycle
    FinalizerAdded,
    /// The tracker is being deleted and no longer holds our finalizer
    FinalizerReleased,
    /// The stored pod list already matches the inventory
    Unchanged,
    /// A new pod list was written
    StatusUpdated { pod_count: usize },
    /// The tracker changed lifecycle state between read and write
    Superseded,
}

impl ReconcileOutcome {
    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::FinalizerAdded => "finalizer_added",
            ReconcileOutcome::FinalizerReleased => "finalizer_released",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::StatusUpdated { .. } => "status_updated",
            ReconcileOutcome::Superseded => "superseded",
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles PodTracker objects against the pod inventory
pub struct Reconciler {
    trackers: TrackerStoreRef,
    pods: PodInventoryRef,
    events: Option<EventPublisherRef>,
    metrics: Arc<OperatorMetrics>,
    max_conflict_retries: u32,
    call_timeout: Duration,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        trackers: TrackerStoreRef,
        pods: PodInventoryRef,
        metrics: Arc<OperatorMetrics>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            trackers,
            pods,
            events: None,
            metrics,
            max_conflict_retries: config.max_conflict_retries.max(1),
            call_timeout: config.call_timeout(),
        }
    }

    /// Publish a cluster event after every pod list rewrite
    pub fn with_event_publisher(mut self, events: EventPublisherRef) -> Self {
        self.events = Some(events);
        self
    }

    /// Reconcile the tracker called `name`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        debug!("Reconciling PodTracker {}", name);

        let tracker = match self.fetch(name).await? {
            Some(tracker) => tracker,
            None => {
                debug!("PodTracker {} not found, nothing to do", name);
                return Ok(ReconcileOutcome::NotFound);
            }
        };

        let state = FinalizerState::of(&tracker);
        match state.transition(&tracker) {
            FinalizerTransition::Add => self.add_finalizer(tracker).await,
            FinalizerTransition::Release => self.release_finalizer(tracker).await,
            FinalizerTransition::Stay if state == FinalizerState::Deleting => {
                Ok(ReconcileOutcome::FinalizerReleased)
            }
            FinalizerTransition::Stay => self.sync_status(tracker).await,
        }
    }

    async fn fetch(&self, name: &str) -> Result<Option<PodTracker>> {
        with_deadline(self.call_timeout, "get tracker", self.trackers.get_tracker(name)).await
    }

    async fn add_finalizer(&self, mut tracker: PodTracker) -> Result<ReconcileOutcome> {
        let name = tracker.name_any();
        add_finalizer(&mut tracker.metadata);
        // Only metadata travels on this write
        tracker.status = None;
        with_deadline(
            self.call_timeout,
            "add finalizer",
            self.trackers.update_tracker(&tracker),
        )
        .await?;
        info!("Added finalizer to PodTracker {}", name);
        Ok(ReconcileOutcome::FinalizerAdded)
    }

    async fn release_finalizer(&self, mut tracker: PodTracker) -> Result<ReconcileOutcome> {
        let name = tracker.name_any();
        remove_finalizer(&mut tracker.metadata);
        tracker.status = None;
        match with_deadline(
            self.call_timeout,
            "remove finalizer",
            self.trackers.update_tracker(&tracker),
        )
        .await
        {
            Ok(_) => {}
            // Erased by someone else in the meantime
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::NotFound),
            Err(e) => return Err(e),
        }
        info!("Removed finalizer from PodTracker {}", name);
        Ok(ReconcileOutcome::FinalizerReleased)
    }

    /// Steady-state step with bounded conflict retry
    async fn sync_status(&self, tracker: PodTracker) -> Result<ReconcileOutcome> {
        let name = tracker.name_any();
        let mut observed = tracker;

        for attempt in 1..=self.max_conflict_retries {
            let pod_ips = self.desired_pod_ips(&observed).await?;
            if observed.pod_ips() == pod_ips.as_slice() {
                debug!("PodTracker {} is up to date ({} pods)", name, pod_ips.len());
                return Ok(ReconcileOutcome::Unchanged);
            }

            // Narrow the window against concurrent node reports
            let mut latest = match self.fetch(&name).await? {
                Some(latest) => latest,
                None => return Ok(ReconcileOutcome::NotFound),
            };
            if FinalizerState::of(&latest) != FinalizerState::Active {
                debug!("PodTracker {} left the active state before the write", name);
                return Ok(ReconcileOutcome::Superseded);
            }
            if latest.pod_ips() == pod_ips.as_slice() {
                return Ok(ReconcileOutcome::Unchanged);
            }

            let pod_count = pod_ips.len();
            let mut status = latest.status.take().unwrap_or_default();
            status.set_pod_ips(pod_ips, Utc::now());
            latest.status = Some(status);

            match with_deadline(
                self.call_timeout,
                "update tracker status",
                self.trackers.update_tracker_status(&latest),
            )
            .await
            {
                Ok(updated) => {
                    info!("Updated PodTracker {} status with {} pods", name, pod_count);
                    self.publish_status_updated(&updated, pod_count).await;
                    return Ok(ReconcileOutcome::StatusUpdated { pod_count });
                }
                Err(e) if e.is_conflict() => {
                    self.metrics.status_conflicts.inc();
                    warn!(
                        "Conflict writing PodTracker {} status (attempt {}/{}), retrying from a fresh read",
                        name, attempt, self.max_conflict_retries
                    );
                    observed = match self.fetch(&name).await? {
                        Some(fresh) => fresh,
                        None => return Ok(ReconcileOutcome::NotFound),
                    };
                    if FinalizerState::of(&observed) != FinalizerState::Active {
                        return Ok(ReconcileOutcome::Superseded);
                    }
                }
                Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::NotFound),
                Err(e) => return Err(e),
            }
        }

        Err(Error::ConflictRetriesExhausted {
            name,
            attempts: self.max_conflict_retries,
        })
    }

    /// Pod list the tracker should carry right now
    async fn desired_pod_ips(&self, tracker: &PodTracker) -> Result<Vec<PodInfo>> {
        let pods = with_deadline(
            self.call_timeout,
            "list pods",
            self.pods.list_pods(tracker.namespace_filter()),
        )
        .await?;
        Ok(derive_pod_infos(&pods))
    }

    async fn publish_status_updated(&self, tracker: &PodTracker, pod_count: usize) {
        if let Some(events) = &self.events {
            let published = with_deadline(
                self.call_timeout,
                "publish event",
                events.status_updated(tracker, pod_count),
            )
            .await;
            if let Err(e) = published {
                warn!("Failed to publish StatusUpdated event for {}: {}", tracker.name_any(), e);
            }
        }
    }
}

/// Tracked records for a pod listing: addressed pods only, sorted by
/// namespace and name, one record per pod
pub fn derive_pod_infos(pods: &[ObservedPod]) -> Vec<PodInfo> {
    let mut infos: Vec<PodInfo> = pods.iter().filter_map(ObservedPod::to_pod_info).collect();
    infos.sort_by(|a, b| a.key().cmp(&b.key()));
    infos.dedup_by(|a, b| a.key() == b.key());
    infos
}
