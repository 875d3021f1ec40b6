//! Observed inventory index
//!
//! In-memory view of the watched pod inventory.

pub mod pod_index;

pub use pod_index::PodIndex;
