//! Pod Tracker Agent
//!
//! Runs on every node and reports that node's address, resources and
//! hosted pods into the `nodeInfo` list of each PodTracker.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pod_tracker_operator::config::{self, AgentConfig};
use pod_tracker_operator::server::{self, ServerState};
use pod_tracker_operator::telemetry::init_logging;
use pod_tracker_operator::{KubeClient, NodeReportCollector, OperatorMetrics, Result};

/// Pod Tracker Agent - per-node capacity and pod reporting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Seconds between report cycles
    #[arg(long, env = "REPORT_INTERVAL")]
    report_interval_secs: Option<u64>,

    /// Health and metrics server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8082")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn agent_config(&self) -> Result<AgentConfig> {
        let mut config: AgentConfig = config::load(self.config.as_deref())?;
        if let Some(node_name) = &self.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(secs) = self.report_interval_secs {
            config.report_interval_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);
    let config = args.agent_config()?;

    info!("Starting Pod Tracker Agent");
    info!("  Version: {}", pod_tracker_operator::VERSION);
    info!("  Node: {}", config.node_name);
    info!("  Report interval: {:?}", config.report_interval());

    let metrics = OperatorMetrics::new()?;
    let kube = Arc::new(KubeClient::try_default().await?);
    let token = CancellationToken::new();

    let collector = NodeReportCollector::new(
        &config,
        kube.clone(),
        kube.clone(),
        kube.clone(),
        metrics.clone(),
    );

    // Probes and metrics share one listener on the agent
    let state = ServerState::new(metrics, || true);
    let server_token = token.clone();
    let health_addr = args.health_addr.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve("Health", &health_addr, state, server_token).await {
            error!("Health server error: {}", e);
        }
    });

    let signal_token = token.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    collector.run(token).await;
    let _ = server_task.await;

    info!("Agent shutdown complete");
    Ok(())
}
