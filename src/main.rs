//! Pod Tracker Controller
//!
//! Watches pods and PodTracker objects and keeps every tracker's
//! `status.podIPs` in line with the pods that currently have an address.

use clap::Parser;
use kube::CustomResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pod_tracker_operator::config::{self, ControllerConfig};
use pod_tracker_operator::server::{self, ServerState};
use pod_tracker_operator::telemetry::init_logging;
use pod_tracker_operator::{
    watch_pods, watch_trackers, KubeClient, OperatorMetrics, PodIndex, PodTracker, Reconciler,
    ResyncScheduler, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pod Tracker Controller - cluster-wide pod address tracking
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Periodic resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL")]
    resync_interval_secs: Option<u64>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the PodTracker CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config: ControllerConfig = config::load(self.config.as_deref())?;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.resync_interval_secs {
            config.resync_interval_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&PodTracker::crd())?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_json);
    let config = args.controller_config()?;

    info!("Starting Pod Tracker Controller");
    info!("  Version: {}", pod_tracker_operator::VERSION);
    info!("  Workers: {}", config.workers);
    info!("  Resync interval: {:?}", config.resync_interval());

    let metrics = OperatorMetrics::new()?;
    let kube = KubeClient::try_default().await?;
    let index = PodIndex::new();
    let token = CancellationToken::new();

    let reconciler = Reconciler::new(
        Arc::new(kube.clone()),
        index.clone(),
        metrics.clone(),
        &config,
    )
    .with_event_publisher(Arc::new(kube.clone()));
    let scheduler = ResyncScheduler::new(
        Arc::new(reconciler),
        Arc::new(kube.clone()),
        metrics.clone(),
        config.clone(),
    );

    // Ready once the pod inventory has been listed
    let synced = index.clone();
    let health = ServerState::new(metrics.clone(), move || synced.is_synced());
    let health_token = token.clone();
    let health_addr = args.health_addr.clone();
    let health_task = tokio::spawn(async move {
        if let Err(e) = server::serve("Health", &health_addr, health, health_token).await {
            error!("Health server error: {}", e);
        }
    });

    let scrape = ServerState::new(metrics.clone(), || true);
    let metrics_token = token.clone();
    let metrics_addr = args.metrics_addr.clone();
    let metrics_task = tokio::spawn(async move {
        if let Err(e) = server::serve("Metrics", &metrics_addr, scrape, metrics_token).await {
            error!("Metrics server error: {}", e);
        }
    });

    let (triggers, events) = mpsc::channel(config.event_buffer);
    let pod_watch = tokio::spawn(watch_pods(
        kube.client(),
        index.clone(),
        triggers.clone(),
        token.clone(),
    ));
    let tracker_watch = tokio::spawn(watch_trackers(kube.client(), triggers, token.clone()));

    let signal_token = token.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    scheduler.run(events, token.clone()).await?;

    for (name, task) in [("pod watch", pod_watch), ("tracker watch", tracker_watch)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} failed: {}", name, e),
            Err(e) => error!("{} panicked: {}", name, e),
        }
    }
    let _ = tokio::join!(health_task, metrics_task);

    info!("Controller shutdown complete");
    Ok(())
}
