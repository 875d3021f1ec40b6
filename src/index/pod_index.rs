//! Observed Pod Index
//!
//! Concurrent snapshot of the watched pod inventory. The pod watch loop is
//! the only writer; the reconciler reads it through [`PodInventory`].
//!
//! The index answers nothing until the first full list has been applied.
//! An empty, unsynced index would otherwise look like a cluster without
//! pods and every tracker would be wiped.

use crate::domain::ports::{ObservedPod, PodInventory, PodKey, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Watch-fed pod snapshot
#[derive(Debug, Default)]
pub struct PodIndex {
    pods: DashMap<PodKey, ObservedPod>,
    synced: AtomicBool,
    /// Number of applied changes, for debugging and metrics
    generation: AtomicU64,
}

impl PodIndex {
    /// Create an empty, unsynced index
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether the initial list has been applied
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Number of indexed pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// Check if the index holds no pods
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Number of changes applied so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Look up a pod
    pub fn get(&self, namespace: &str, name: &str) -> Option<ObservedPod> {
        self.pods
            .get(&PodKey::new(namespace, name))
            .map(|entry| entry.value().clone())
    }

    /// Insert or replace a pod, reporting whether it was new
    pub fn upsert(&self, pod: ObservedPod) -> WatchEvent<ObservedPod> {
        self.generation.fetch_add(1, Ordering::Relaxed);
        match self.pods.insert(pod.key(), pod.clone()) {
            Some(_) => WatchEvent::Modified(pod),
            None => WatchEvent::Added(pod),
        }
    }

    /// Remove a pod
    pub fn remove(&self, pod: ObservedPod) -> WatchEvent<ObservedPod> {
        self.generation.fetch_add(1, Ordering::Relaxed);
        let removed = self
            .pods
            .remove(&pod.key())
            .map(|(_, stored)| stored)
            .unwrap_or(pod);
        WatchEvent::Deleted(removed)
    }

    /// Replace the whole snapshot after a (re)list
    ///
    /// Returns one event per pod that appeared, changed, or vanished relative
    /// to the previous snapshot, and marks the index as synced.
    pub fn replace_all(
        &self,
        pods: impl IntoIterator<Item = ObservedPod>,
    ) -> Vec<WatchEvent<ObservedPod>> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for pod in pods {
            let key = pod.key();
            let changed = self
                .pods
                .get(&key)
                .map(|existing| *existing.value() != pod)
                .unwrap_or(true);
            if changed {
                events.push(self.upsert(pod));
            }
            seen.insert(key);
        }

        let stale: Vec<ObservedPod> = self
            .pods
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for pod in stale {
            events.push(self.remove(pod));
        }

        self.synced.store(true, Ordering::Release);
        events
    }

    fn ensure_synced(&self) -> Result<()> {
        if self.is_synced() {
            Ok(())
        } else {
            Err(Error::Transient(
                "pod index has not completed its initial list".into(),
            ))
        }
    }
}

#[async_trait]
impl PodInventory for PodIndex {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<ObservedPod>> {
        self.ensure_synced()?;
        Ok(self
            .pods
            .iter()
            .filter(|entry| namespace.map(|ns| entry.key().namespace == ns).unwrap_or(true))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<ObservedPod>> {
        self.ensure_synced()?;
        Ok(self
            .pods
            .iter()
            .filter(|entry| entry.value().node_name.as_deref() == Some(node_name))
            .map(|entry| entry.value().clone())
            .collect())
    }
}
