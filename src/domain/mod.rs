//! Domain layer - Port definitions and in-process adapters
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod deadline;
pub mod memory;
pub mod ports;

pub use deadline::with_deadline;
pub use memory::InMemoryCluster;
pub use ports::*;
