//! Metering Engine Daemon
//!
//! Runs the metering engine with in-memory stores until Ctrl-C, then drains
//! the ingestion buffers and exits.

use llm_metering_engine::telemetry::{init_tracing, install_metrics_exporter};
use llm_metering_engine::{Config, MeteringEngine};

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// Metering Engine Daemon
#[derive(Parser, Debug)]
#[command(name = "metering-engine")]
#[command(about = "Usage metering, quotas, budgets and billing for an LLM gateway")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, env = "METERING_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Prometheus scrape address, e.g. 0.0.0.0:9090
    #[arg(long, env = "METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,

    /// Disable telemetry counters
    #[arg(long)]
    no_telemetry: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    if args.json_logs {
        config.telemetry.json_logs = true;
    }
    if args.metrics_address.is_some() {
        config.telemetry.metrics_address = args.metrics_address;
    }
    if args.no_telemetry {
        config.telemetry.enabled = false;
    }

    init_tracing(&config.telemetry).context("initializing logging")?;
    info!("Starting Metering Engine Daemon v{}", llm_metering_engine::VERSION);

    config.validate().context("invalid configuration")?;

    if let Some(address) = config.telemetry.metrics_address {
        install_metrics_exporter(address).context("installing metrics exporter")?;
        info!(%address, "Prometheus metrics exporter listening");
    }

    let engine = MeteringEngine::builder()
        .with_config(config)
        .build()
        .await
        .context("building metering engine")?;
    engine.start().context("starting metering engine")?;

    info!(
        batch_size = engine.config().ingestion.batch_size,
        flush_interval = ?engine.config().ingestion.flush_interval,
        "Metering Engine Daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;

    info!("Shutting down Metering Engine Daemon");
    match engine.stop().await {
        Ok(report) => info!(flushed = report.total(), "Final flush complete"),
        Err(e) => warn!(error = %e, "Shutdown did not drain every buffer"),
    }

    Ok(())
}
