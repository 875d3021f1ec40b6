//! Finalizer State Machine
//!
//! A tracker is in exactly one of three states:
//!
//! ```text
//!   Absent ──add finalizer──▶ Active ──deletion requested──▶ Deleting
//!                                                              │
//!                                         remove finalizer ◀───┘ (then erased)
//! ```
//!
//! Every transition is a single metadata write and ends the reconcile cycle,
//! so a finalizer change never shares a write with status work.

use crate::crd::{PodTracker, POD_TRACKER_FINALIZER};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Lifecycle state derived from finalizers and the deletion timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live object that does not carry the finalizer yet
    Absent,
    /// Live object guarded by the finalizer; status is maintained
    Active,
    /// Deletion requested; the finalizer must be released
    Deleting,
}

/// Metadata change required to leave the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerTransition {
    /// Persist the finalizer
    Add,
    /// Drop the finalizer so the store can erase the object
    Release,
    /// Nothing to change
    Stay,
}

impl FinalizerState {
    /// Classify a tracker
    pub fn of(tracker: &PodTracker) -> Self {
        if tracker.is_deleting() {
            FinalizerState::Deleting
        } else if tracker.has_finalizer() {
            FinalizerState::Active
        } else {
            FinalizerState::Absent
        }
    }

    /// Transition to apply for a tracker in this state
    pub fn transition(self, tracker: &PodTracker) -> FinalizerTransition {
        match self {
            FinalizerState::Absent => FinalizerTransition::Add,
            FinalizerState::Active => FinalizerTransition::Stay,
            FinalizerState::Deleting if tracker.has_finalizer() => FinalizerTransition::Release,
            FinalizerState::Deleting => FinalizerTransition::Stay,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizerState::Absent => "absent",
            FinalizerState::Active => "active",
            FinalizerState::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for FinalizerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Add the finalizer; returns false if it was already present
pub fn add_finalizer(meta: &mut ObjectMeta) -> bool {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == POD_TRACKER_FINALIZER) {
        return false;
    }
    finalizers.push(POD_TRACKER_FINALIZER.to_string());
    true
}

/// Remove the finalizer, keeping foreign ones; returns false if absent
pub fn remove_finalizer(meta: &mut ObjectMeta) -> bool {
    match meta.finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != POD_TRACKER_FINALIZER);
            finalizers.len() != before
        }
        None => false,
    }
}
