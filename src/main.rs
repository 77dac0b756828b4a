use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use venuex::aggregator::StreamAggregator;
use venuex::config::AppConfig;
use venuex::pipeline::OrderPipeline;
use venuex::quotes::StaticPrices;
use venuex::reconcile::Reconciler;
use venuex::risk::HttpRiskClient;
use venuex::shutdown::ShutdownSignal;
use venuex::store::{PgStore, Store};
use venuex::telemetry::{self, Metrics};
use venuex::types::Symbol;
use venuex::venue::{PaperVenue, Venue, VenueRegistry};

use rust_decimal::Decimal;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    info!("🦀 VenueX execution core starting...");

    let config = AppConfig::load_default();

    let store = PgStore::connect(&config.database_url)
        .await
        .context("failed to connect to store")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure store schema")?;
    let store: Arc<dyn Store> = Arc::new(store);

    let metrics = Arc::new(Metrics::new());
    let listener = telemetry::bind(&config.metrics_addr)
        .await
        .context("failed to bind metrics endpoint")?;
    info!(addr = %config.metrics_addr, "metrics endpoint up");

    let shutdown = ShutdownSignal::new();
    let metrics_task = telemetry::spawn(listener, metrics.clone(), shutdown.clone());

    let risk = Arc::new(HttpRiskClient::new(&config.risk_url, metrics.clone()));

    let mut venues: HashMap<String, Arc<dyn Venue>> = HashMap::new();
    for name in &config.venues {
        let venue = Arc::new(PaperVenue::new(name.clone()));
        venue
            .connect()
            .await
            .map_err(|err| anyhow::anyhow!("failed to connect venue {name}: {err}"))?;
        venues.insert(name.clone(), venue);
    }
    let registry = Arc::new(VenueRegistry::new(venues));
    info!(venues = registry.len(), "venue registry frozen");

    let quotes = Arc::new(StaticPrices::new());
    for symbol in &config.symbols {
        quotes.set(Symbol::new(symbol), Decimal::from(100));
    }

    let aggregator = StreamAggregator::new(
        registry.clone(),
        metrics.clone(),
        shutdown.clone(),
        &config.stream,
    );
    let monitor_task = aggregator.clone().spawn_monitor();

    let (_pipeline, worker) = OrderPipeline::new(
        registry.clone(),
        risk,
        store.clone(),
        quotes,
        metrics.clone(),
        config.execution.clone(),
    );
    let pipeline_task = worker.spawn(shutdown.clone());

    let reconciler = Reconciler::new(
        registry,
        store,
        metrics,
        config.reconciliation.interval(),
    );
    let reconcile_task = reconciler.spawn(shutdown.clone());

    wait_for_signal().await;
    info!("shutting down execution core...");
    shutdown.trigger();

    let teardown = async {
        let _ = pipeline_task.await;
        let _ = reconcile_task.await;
        let _ = monitor_task.await;
        let _ = metrics_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, teardown).await.is_err() {
        warn!("grace period expired, forcing teardown");
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(%err, "cannot listen for SIGTERM, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
