//! ModelPool Coordinator - Main Entry Point
//!
//! Runs the worker pool and session manager as a daemon. Configuration
//! comes from the YAML file named by `MODELPOOL_CONFIG`, layered with
//! `MODELPOOL__SECTION__KEY` environment overrides.

use modelpool_common::{ModelPoolConfig, Result};
use modelpool_coordinator::{
    CommandLauncher, DirectoryLocator, MemorySessionStore, SessionManager, Supervisor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("MODELPOOL_CONFIG")
        .unwrap_or_else(|_| "configs/modelpool.yaml".to_string());
    let config = ModelPoolConfig::load(&config_path)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("modelpool_coordinator={}", config.observability.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ModelPool Coordinator");
    info!(
        "Configuration loaded from {}: arena={:.1} GB, max_loaded_models={}, model_root={}",
        config_path,
        config.allocator.capacity_gb(),
        config.supervisor.max_loaded_models,
        config.supervisor.model_root.display()
    );

    let locator = Arc::new(DirectoryLocator::new(&config.supervisor.model_root));
    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        &config.allocator,
        Arc::new(CommandLauncher),
        locator,
    );
    let manager = Arc::new(SessionManager::new(
        config.sessions.clone(),
        Arc::clone(&supervisor),
        Arc::new(MemorySessionStore::new()),
    ));

    let sweeper = Arc::clone(&manager).start_idle_sweeper();
    let reporter = start_stats_reporter(
        Arc::clone(&manager),
        Duration::from_secs(config.observability.stats_interval_secs),
        config.observability.enable_metrics,
    );

    info!("ModelPool Coordinator running");

    // Wait for shutdown signal
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        }
        result = sweeper => {
            if let Err(e) = result {
                error!("Idle sweeper stopped: {}", e);
            }
        }
    }

    reporter.abort();
    supervisor.shutdown();

    info!("ModelPool Coordinator shutdown complete");
    Ok(())
}

/// Log a service snapshot on a fixed interval
fn start_stats_reporter(
    manager: Arc<SessionManager>,
    interval: Duration,
    with_metrics: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = manager.stats();
            info!(
                "Stats: utilization={:.1}% fragmentation={:.2} workers={} sessions={} inferences={} avg_response={:.0}ms",
                stats.allocator.utilization_percent,
                stats.allocator.fragmentation_ratio,
                stats.loaded_workers,
                stats.active_sessions,
                stats.total_inferences,
                stats.average_response_time_ms
            );

            if with_metrics {
                tracing::debug!("Metrics:\n{}", modelpool_common::METRICS.gather());
            }
        }
    })
}
