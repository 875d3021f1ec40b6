//! PodTracker Controller
//!
//! Finalizer handling, status reconciliation, pod event fanout and the
//! scheduler that ties them to the work queue.

pub mod fanout;
pub mod finalizer;
pub mod reconciler;
pub mod scheduler;

pub use fanout::FanoutIndex;
pub use finalizer::{FinalizerState, FinalizerTransition};
pub use reconciler::{derive_pod_infos, ReconcileOutcome, Reconciler};
pub use scheduler::{ResyncScheduler, WorkQueue};
