//! Kinetic Replicator Daemon
//!
//! Runs replication cycles over every replicated storage policy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Kinetic Replicator                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Cycle     │───▶│  Replication │───▶│   Kinetic    │       │
//! │  │  Scheduler   │    │    Engine    │    │   Devices    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kinetic_objstore::adapters::TcpConnector;
use kinetic_objstore::domain::DeviceId;
use kinetic_objstore::{metrics, Config, Replicator};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Kinetic Replicator - peer-to-peer replication for kinetic devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "KINETIC_CONFIG", default_value = "/etc/kinetic/replicator.yaml")]
    config: String,

    /// Restrict cycles to these devices (comma separated host:port)
    #[arg(long, env = "KINETIC_DEVICES", value_delimiter = ',')]
    devices: Vec<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Seconds between cycles (overrides the config file)
    #[arg(long, env = "REPLICATION_INTERVAL")]
    interval: Option<u64>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    if let Some(interval) = args.interval {
        config.replicator.interval = interval;
    }
    config.validate().context("validating configuration")?;

    info!("Starting Kinetic Replicator");
    info!("  Config: {}", args.config);
    info!("  Mode: {}", config.replicator.replication_mode);
    info!("  Interval: {}s", config.replicator.interval);
    info!("  Max connections: {}", config.replicator.max_connections);

    metrics::init().context("registering metrics")?;

    let policies = config.storage_policies()?;
    let replicator = Arc::new(Replicator::new(
        config.replicator.clone(),
        policies,
        Arc::new(TcpConnector::new()),
    ));
    let override_devices: Option<Vec<DeviceId>> = if args.devices.is_empty() {
        None
    } else {
        Some(args.devices.iter().map(|d| DeviceId::new(d.trim())).collect())
    };

    if args.once {
        let stats = replicator.run_once(override_devices.as_deref()).await;
        info!(?stats, "Single cycle complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    // Start health server
    let health = tokio::spawn(metrics::server::serve(
        "Health",
        args.health_addr.clone(),
        replicator.ready_flag(),
        shutdown.clone(),
    ));

    // Start metrics server
    let metrics_server = tokio::spawn(metrics::server::serve(
        "Metrics",
        args.metrics_addr.clone(),
        replicator.ready_flag(),
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    replicator.run(override_devices, shutdown.clone()).await;
    shutdown.cancel();

    for (name, handle) in [("health", health), ("metrics", metrics_server)] {
        match handle.await {
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
            Ok(Ok(())) => {}
        }
    }

    info!("Replicator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("h2=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
