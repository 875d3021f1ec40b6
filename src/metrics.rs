//! Operator Metrics
//!
//! Prometheus collectors for the reconcile loop and the node agent, held in
//! a dedicated registry rather than the process-global default so tests can
//! create as many instances as they like.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Collectors shared by controller and agent
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    /// Reconcile results by outcome
    pub reconciles: IntCounterVec,
    /// Reconciles that returned an error
    pub reconcile_errors: IntCounter,
    /// Status writes rejected because of a stale version
    pub status_conflicts: IntCounter,
    /// Reconcile requests produced by pod events
    pub fanout_requests: IntCounter,
    /// Names waiting in the work queue
    pub queue_depth: IntGauge,
    /// Per-tracker node report attempts by result
    pub node_reports: IntCounterVec,
}

impl OperatorMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new_custom(Some("podtracker".into()), None)
            .map_err(|e| Error::Internal(format!("metrics registry: {}", e)))?;

        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile results by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let reconcile_errors = IntCounter::new(
            "reconcile_errors_total",
            "Reconciles that failed and were requeued",
        )
        .map_err(metrics_error)?;
        let status_conflicts = IntCounter::new(
            "status_conflicts_total",
            "Status writes rejected because of a concurrent modification",
        )
        .map_err(metrics_error)?;
        let fanout_requests = IntCounter::new(
            "fanout_requests_total",
            "Reconcile requests produced by pod events",
        )
        .map_err(metrics_error)?;
        let queue_depth = IntGauge::new("queue_depth", "Tracker names waiting for reconciliation")
            .map_err(metrics_error)?;
        let node_reports = IntCounterVec::new(
            Opts::new("node_reports_total", "Node report writes by result"),
            &["result"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(reconciles.clone())).map_err(metrics_error)?;
        registry.register(Box::new(reconcile_errors.clone())).map_err(metrics_error)?;
        registry.register(Box::new(status_conflicts.clone())).map_err(metrics_error)?;
        registry.register(Box::new(fanout_requests.clone())).map_err(metrics_error)?;
        registry.register(Box::new(queue_depth.clone())).map_err(metrics_error)?;
        registry.register(Box::new(node_reports.clone())).map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            reconciles,
            reconcile_errors,
            status_conflicts,
            fanout_requests,
            queue_depth,
            node_reports,
        }))
    }

    /// Render all collectors in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
