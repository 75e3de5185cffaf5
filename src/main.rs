//! FORKER - Durable File Replication Engine
//!
//! Main entry point for the replication service.
//!
//! Configuration is read from a JSON file whose path comes from the
//! `FORKER_CONFIG` environment variable (default `forker.json`). The
//! engine runs until the process receives an interrupt, then shuts down
//! cooperatively: in-flight copies roll back to safe states and staging
//! files are removed.

use forker::config::EngineConfig;
use forker::engine::ReplicationEngine;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with configurable level
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  FORKER - Durable File Replication Engine");
    log::info!("  Version: {}", forker::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config_path = std::env::var("FORKER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("forker.json"));
    log::info!("Loading configuration from {}", config_path.display());
    let config = EngineConfig::load(&config_path)?;

    let engine = ReplicationEngine::start(config).await?;
    let report = engine.recovery_report();
    log::info!(
        "Recovery: {} examined, {} reset, {} promoted, {} requeued, {} orphans removed",
        report.jobs_examined,
        report.targets_reset,
        report.targets_promoted,
        report.jobs_requeued,
        report.orphans_removed
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupt received");
    engine.shutdown().await;

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  FORKER shutdown complete");
    log::info!("═══════════════════════════════════════════════════════════");
    Ok(())
}
