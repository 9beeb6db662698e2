//! Baseline engine daemon
//!
//! Trains per-machine energy baselines, scores incoming readings, watches
//! for drift and runs retraining and A/B promotion on a schedule.

use anyhow::{Context, Result};
use baseline_engine::{api, config::DaemonConfig};
use engine_lib::{
    health::components,
    source::{JsonLinesSource, RetryingSource, TimeSeriesSource},
    Engine, EngineMetrics, HealthRegistry, Machine, Scheduler, Store,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting baseline-engine");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = DaemonConfig::load(config_path.as_deref())?;
    info!(
        instance = %config.instance,
        data_dir = %config.source.data_dir.display(),
        state_dir = %config.storage.state_dir.display(),
        "Engine configured"
    );

    std::fs::create_dir_all(&config.storage.state_dir).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.storage.state_dir.display()
        )
    })?;

    let health_registry = HealthRegistry::with_engine_components().await;
    let metrics = EngineMetrics::new();

    let snapshot_path = config.snapshot_path();
    let store = Arc::new(open_store(&snapshot_path)?);

    let source: Arc<dyn TimeSeriesSource> = Arc::new(RetryingSource::new(
        Arc::new(JsonLinesSource::new(config.source.data_dir.clone())),
        config.retry_config(),
    ));

    let engine = Arc::new(Engine::new(
        source,
        store.clone(),
        config.engine_config(),
        health_registry.clone(),
    ));
    for entry in &config.machines {
        engine.register_machine(Machine::from(entry)).await;
    }
    let active_models = engine.publish_store_gauges().await;
    engine
        .logger()
        .log_startup(ENGINE_VERSION, config.machines.len());
    info!(active_models, "Store restored");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let retrain_handle = tokio::spawn(
        engine
            .retrain_coordinator()
            .run(shutdown_tx.subscribe()),
    );

    let scheduler = Scheduler::new(engine.clone(), engine.config().scheduler.clone())
        .with_health(health_registry.clone());
    scheduler.start().await;

    let flush_handle = tokio::spawn(flush_loop(
        store.clone(),
        snapshot_path.clone(),
        config.snapshot_interval(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api.port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    engine.logger().log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    scheduler.stop().await;
    let _ = shutdown_tx.send(());
    if let Err(e) = retrain_handle.await {
        warn!(error = %e, "Retrain worker ended abnormally");
    }
    if let Err(e) = flush_handle.await {
        warn!(error = %e, "Flush loop ended abnormally");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server ended abnormally"),
        Ok(Ok(())) => {}
    }

    store
        .save_snapshot(&snapshot_path)
        .await
        .context("final snapshot failed")?;
    info!(path = %snapshot_path.display(), "Shutdown complete");

    Ok(())
}

/// Restore the store from its snapshot, or start empty when none exists
fn open_store(path: &Path) -> Result<Store> {
    if !path.exists() {
        info!(path = %path.display(), "No store snapshot, starting empty");
        return Ok(Store::new());
    }
    Store::load_snapshot(path).with_context(|| format!("failed to restore {}", path.display()))
}

/// Periodically write the store snapshot when it has changed
async fn flush_loop(
    store: Arc<Store>,
    path: PathBuf,
    every: std::time::Duration,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.flush(&path).await {
                    Ok(written) => {
                        if written {
                            debug!(path = %path.display(), "Store snapshot written");
                        }
                        health.set_healthy(components::STORE).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Store snapshot failed");
                        health.set_unhealthy(components::STORE, e.to_string()).await;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
