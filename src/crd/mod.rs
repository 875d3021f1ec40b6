//! Custom Resource Definitions for the Pod Tracker Operator
//!
//! - PodTracker: cluster-scoped aggregate of pod addresses and node reports

pub mod pod_tracker;

pub use pod_tracker::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
