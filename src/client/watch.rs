//! Watch Loops
//!
//! Feed the pod index and the scheduler's trigger channel from API server
//! watches. Watch errors are retried with the runtime's default backoff; a
//! relist replaces the pod snapshot and emits one trigger per difference.

use crate::crd::PodTracker;
use crate::domain::ports::{ObservedPod, TriggerEvent, WatchEvent};
use crate::error::Result;
use crate::index::PodIndex;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watch all pods until cancelled or the trigger channel closes
pub async fn watch_pods(
    client: Client,
    index: Arc<PodIndex>,
    triggers: mpsc::Sender<TriggerEvent>,
    token: CancellationToken,
) -> Result<()> {
    let api: Api<Pod> = Api::all(client);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    info!("Watching pods");

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        let changes = match event {
            Some(Ok(event)) => apply_pod_event(&index, event),
            Some(Err(e)) => {
                warn!("Pod watch error: {}", e);
                continue;
            }
            None => break,
        };
        for change in changes {
            if triggers.send(TriggerEvent::Pod(change)).await.is_err() {
                debug!("Trigger channel closed, stopping pod watch");
                return Ok(());
            }
        }
    }
    info!("Pod watch stopped");
    Ok(())
}

/// Watch PodTracker objects until cancelled or the trigger channel closes
pub async fn watch_trackers(
    client: Client,
    triggers: mpsc::Sender<TriggerEvent>,
    token: CancellationToken,
) -> Result<()> {
    let api: Api<PodTracker> = Api::all(client);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    info!("Watching PodTrackers");

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        let changes = match event {
            Some(Ok(event)) => tracker_changes(event),
            Some(Err(e)) => {
                warn!("PodTracker watch error: {}", e);
                continue;
            }
            None => break,
        };
        for change in changes {
            if triggers.send(TriggerEvent::Tracker(change)).await.is_err() {
                debug!("Trigger channel closed, stopping PodTracker watch");
                return Ok(());
            }
        }
    }
    info!("PodTracker watch stopped");
    Ok(())
}

/// Apply one pod watch event to the index, returning the resulting changes
pub fn apply_pod_event(index: &PodIndex, event: Event<Pod>) -> Vec<WatchEvent<ObservedPod>> {
    match event {
        Event::Applied(pod) => observe(&pod).map(|p| index.upsert(p)).into_iter().collect(),
        Event::Deleted(pod) => observe(&pod).map(|p| index.remove(p)).into_iter().collect(),
        Event::Restarted(pods) => {
            let changes = index.replace_all(pods.iter().filter_map(observe));
            info!(
                "Pod inventory relisted: {} pods, {} changes",
                index.len(),
                changes.len()
            );
            changes
        }
    }
}

/// Tracker names touched by one watch event
pub fn tracker_changes(event: Event<PodTracker>) -> Vec<WatchEvent<String>> {
    match event {
        Event::Applied(tracker) => vec![WatchEvent::Modified(tracker.name_any())],
        Event::Deleted(tracker) => vec![WatchEvent::Deleted(tracker.name_any())],
        Event::Restarted(trackers) => trackers
            .iter()
            .map(|t| WatchEvent::Added(t.name_any()))
            .collect(),
    }
}

fn observe(pod: &Pod) -> Option<ObservedPod> {
    match ObservedPod::try_from(pod) {
        Ok(observed) => Some(observed),
        Err(e) => {
            warn!("Ignoring pod from watch: {}", e);
            None
        }
    }
}
