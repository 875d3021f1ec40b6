//! Kubernetes client adapters
//!
//! Port implementations and watch loops backed by the API server.

pub mod adapter;
pub mod watch;

pub use adapter::KubeClient;
pub use watch::{watch_pods, watch_trackers};
