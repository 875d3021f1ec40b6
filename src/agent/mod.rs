//! Node Agent
//!
//! Per-node reporting of address, resources and hosted pods.

pub mod collector;

pub use collector::{CycleReport, NodeReportCollector};
