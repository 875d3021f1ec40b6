//! Pod Event Fanout
//!
//! Maps one pod change to the trackers whose namespace filter admits it.
//! The tracker list is small next to pod churn, so every event does a full
//! list-and-filter; there is no incremental index to keep coherent.

use crate::crd::PodTracker;
use crate::domain::deadline::with_deadline;
use crate::domain::ports::{ObservedPod, TrackerStoreRef, WatchEvent};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error};

/// Resolves pod events to tracker names
pub struct FanoutIndex {
    trackers: TrackerStoreRef,
    call_timeout: Duration,
}

impl FanoutIndex {
    pub fn new(trackers: TrackerStoreRef, call_timeout: Duration) -> Self {
        Self {
            trackers,
            call_timeout,
        }
    }

    /// Names of every tracker affected by the event
    ///
    /// Pods without an address are fanned out as well; a reconcile that
    /// finds nothing changed skips its write. A failed tracker list yields
    /// no names and is left to the periodic resync.
    pub async fn affected_trackers(&self, event: &WatchEvent<ObservedPod>) -> BTreeSet<String> {
        let pod = event.object();
        let trackers = match with_deadline(
            self.call_timeout,
            "list trackers",
            self.trackers.list_trackers(),
        )
        .await
        {
            Ok(trackers) => trackers,
            Err(e) => {
                error!("Failed to list PodTrackers for pod {}/{}: {}", pod.namespace, pod.name, e);
                return BTreeSet::new();
            }
        };

        let names = matching_trackers(&trackers, &pod.namespace);
        if !names.is_empty() {
            debug!(
                pod = %pod.name,
                namespace = %pod.namespace,
                ip = %pod.ip,
                event = event.kind(),
                requests = names.len(),
                "Pod change triggered reconciliation"
            );
        }
        names
    }
}

/// Trackers whose filter is empty or equals `namespace`
pub fn matching_trackers(trackers: &[PodTracker], namespace: &str) -> BTreeSet<String> {
    trackers
        .iter()
        .filter(|t| t.tracks_namespace(namespace))
        .map(|t| t.name_any())
        .collect()
}
