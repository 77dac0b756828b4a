//! Metrics registry and the Prometheus scrape endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::shutdown::ShutdownSignal;

/// Process-wide gauges, rendered in Prometheus text exposition format.
#[derive(Default)]
pub struct Metrics {
    venue_latency: RwLock<BTreeMap<String, f64>>,
    orders_sent: RwLock<BTreeMap<(String, String), u64>>,
    orders_filled: RwLock<BTreeMap<(String, String), u64>>,
    risk_duration: RwLock<BTreeMap<String, f64>>,
    circuit_breaker: RwLock<BTreeMap<String, bool>>,
    dropped_events: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest observed latency of a venue API call.
    pub fn observe_venue_latency(&self, venue: &str, seconds: f64) {
        self.venue_latency.write().insert(venue.to_string(), seconds);
    }

    pub fn record_order_sent(&self, venue: &str, symbol: &str) {
        *self
            .orders_sent
            .write()
            .entry((venue.to_string(), symbol.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_order_filled(&self, venue: &str, symbol: &str) {
        *self
            .orders_filled
            .write()
            .entry((venue.to_string(), symbol.to_string()))
            .or_insert(0) += 1;
    }

    pub fn observe_risk_duration(&self, service: &str, seconds: f64) {
        self.risk_duration.write().insert(service.to_string(), seconds);
    }

    pub fn set_circuit_breaker(&self, service: &str, triggered: bool) {
        self.circuit_breaker
            .write()
            .insert(service.to_string(), triggered);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP venue_api_latency_seconds Latency of venue API calls in seconds\n");
        out.push_str("# TYPE venue_api_latency_seconds gauge\n");
        for (venue, seconds) in self.venue_latency.read().iter() {
            let _ = writeln!(out, "venue_api_latency_seconds{{venue=\"{venue}\"}} {seconds}");
        }

        out.push_str("# HELP order_fill_rate Fraction of placed orders observed filled\n");
        out.push_str("# TYPE order_fill_rate gauge\n");
        {
            let sent = self.orders_sent.read();
            let filled = self.orders_filled.read();
            for ((venue, symbol), sent_count) in sent.iter() {
                let filled_count = filled
                    .get(&(venue.clone(), symbol.clone()))
                    .copied()
                    .unwrap_or(0);
                let rate = filled_count as f64 / *sent_count as f64;
                let _ = writeln!(
                    out,
                    "order_fill_rate{{venue=\"{venue}\",symbol=\"{symbol}\"}} {rate}"
                );
            }
        }

        out.push_str(
            "# HELP risk_calculation_time_seconds Time taken for risk checks in seconds\n",
        );
        out.push_str("# TYPE risk_calculation_time_seconds gauge\n");
        for (service, seconds) in self.risk_duration.read().iter() {
            let _ = writeln!(
                out,
                "risk_calculation_time_seconds{{service=\"{service}\"}} {seconds}"
            );
        }

        out.push_str("# HELP circuit_breaker_triggered Circuit breaker status (1 = triggered)\n");
        out.push_str("# TYPE circuit_breaker_triggered gauge\n");
        for (service, triggered) in self.circuit_breaker.read().iter() {
            let _ = writeln!(
                out,
                "circuit_breaker_triggered{{service=\"{service}\"}} {}",
                u8::from(*triggered)
            );
        }

        out.push_str("# HELP trade_events_dropped_total Trade events dropped by the aggregator\n");
        out.push_str("# TYPE trade_events_dropped_total counter\n");
        let _ = writeln!(
            out,
            "trade_events_dropped_total {}",
            self.dropped_events()
        );

        out
    }
}

/// Bind the scrape listener. Kept separate from serving so a bad address is
/// a fatal startup error.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| Error::Config(format!("cannot bind metrics endpoint {addr}: {err}")))
}

/// Serve `/metrics` until shutdown.
pub fn spawn(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(metrics);
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await });
        if let Err(err) = serve.await {
            error!(%err, "metrics server terminated");
        }
        debug!("metrics server stopped");
    })
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}
