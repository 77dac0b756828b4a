//! Trade stream aggregation across venues.
//!
//! One aggregated channel per symbol, one fan-in task per (symbol, venue),
//! and a monitor that revives dead venue streams. Consumers keep their
//! channel across reconnects; under burst load events are dropped rather
//! than back-pressuring the fan-in.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metrics;
use crate::types::{Symbol, TradeEvent};
use crate::venue::{Venue, VenueRegistry};

/// Receive handle over a symbol's aggregated feed. Clones share the same
/// underlying channel, so the stream identity is stable for the life of the
/// process.
#[derive(Clone)]
pub struct TradeStream {
    inner: Arc<Mutex<mpsc::Receiver<TradeEvent>>>,
}

impl TradeStream {
    fn new(rx: mpsc::Receiver<TradeEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next event; `None` once the aggregator is gone.
    pub async fn recv(&self) -> Option<TradeEvent> {
        self.inner.lock().await.recv().await
    }

    /// Whether two handles share one channel.
    pub fn same_channel(&self, other: &TradeStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct VenueFeed {
    terminated: Arc<AtomicBool>,
}

#[derive(Default)]
struct AggregatorState {
    aggregated: HashMap<Symbol, (mpsc::Sender<TradeEvent>, TradeStream)>,
    feeds: HashMap<Symbol, HashMap<String, VenueFeed>>,
}

pub struct StreamAggregator {
    registry: Arc<VenueRegistry>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
    capacity: usize,
    monitor_interval: Duration,
    state: RwLock<AggregatorState>,
}

impl StreamAggregator {
    pub fn new(
        registry: Arc<VenueRegistry>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
        config: &StreamConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            shutdown,
            capacity: config.capacity,
            monitor_interval: config.monitor_interval(),
            state: RwLock::new(AggregatorState::default()),
        })
    }

    /// Aggregated trade stream for `symbol`. The first call opens one venue
    /// stream per registered venue; later calls return the same channel.
    pub async fn get_stream(&self, symbol: &Symbol) -> TradeStream {
        if let Some((_, stream)) = self.state.read().aggregated.get(symbol) {
            return stream.clone();
        }

        let (tx, stream) = {
            let mut state = self.state.write();
            // Double-check after acquiring the write lock.
            if let Some((_, stream)) = state.aggregated.get(symbol) {
                return stream.clone();
            }
            let (tx, rx) = mpsc::channel(self.capacity);
            let stream = TradeStream::new(rx);
            state
                .aggregated
                .insert(symbol.clone(), (tx.clone(), stream.clone()));
            state.feeds.insert(symbol.clone(), HashMap::new());
            (tx, stream)
        };

        let venues: Vec<(String, Arc<dyn Venue>)> = self
            .registry
            .iter()
            .map(|(name, venue)| (name.to_string(), venue.clone()))
            .collect();
        for (name, venue) in venues {
            self.open_feed(symbol, &name, venue.as_ref(), &tx).await;
        }

        stream
    }

    /// Open one venue stream and start its fan-in. The state lock is never
    /// held across the venue call.
    async fn open_feed(
        &self,
        symbol: &Symbol,
        venue_name: &str,
        venue: &dyn Venue,
        tx: &mpsc::Sender<TradeEvent>,
    ) {
        let rx = match venue.stream_trades(symbol).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(
                    venue = venue_name,
                    symbol = %symbol,
                    %err,
                    "venue trade stream unavailable"
                );
                return;
            }
        };

        let terminated = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.write();
            if let Some(feeds) = state.feeds.get_mut(symbol) {
                feeds.insert(
                    venue_name.to_string(),
                    VenueFeed {
                        terminated: terminated.clone(),
                    },
                );
            }
        }

        self.spawn_fan_in(venue_name.to_string(), rx, tx.clone(), terminated);
    }

    /// The fan-in owns its inbound receiver; per-venue FIFO is preserved.
    fn spawn_fan_in(
        &self,
        venue_name: String,
        mut rx: mpsc::Receiver<TradeEvent>,
        tx: mpsc::Sender<TradeEvent>,
        terminated: Arc<AtomicBool>,
    ) {
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => None,
                    event = rx.recv() => event,
                };
                let Some(mut event) = event else { break };
                event.venue = venue_name.clone();
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        metrics.record_dropped_event();
                        debug!(
                            venue = %venue_name,
                            symbol = %event.symbol,
                            "aggregated channel full, dropping trade"
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            terminated.store(true, Ordering::SeqCst);
        });
    }

    /// Health monitor: revives missing or terminated venue feeds for every
    /// subscribed symbol. The aggregated channel is never replaced.
    pub fn spawn_monitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while self.shutdown.sleep(self.monitor_interval).await {
                self.check_feeds().await;
            }
            debug!("stream monitor stopped");
        })
    }

    async fn check_feeds(&self) {
        // Collect work under the read lock, reconnect outside it.
        let mut stale: Vec<(Symbol, String, mpsc::Sender<TradeEvent>)> = Vec::new();
        {
            let state = self.state.read();
            for (symbol, (tx, _)) in &state.aggregated {
                let feeds = state.feeds.get(symbol);
                for (venue_name, _) in self.registry.iter() {
                    let dead = feeds
                        .and_then(|feeds| feeds.get(venue_name))
                        .map_or(true, |feed| feed.terminated.load(Ordering::SeqCst));
                    if dead {
                        stale.push((symbol.clone(), venue_name.to_string(), tx.clone()));
                    }
                }
            }
        }

        for (symbol, venue_name, tx) in stale {
            debug!(venue = %venue_name, symbol = %symbol, "reconnecting venue trade stream");
            let Some(venue) = self.registry.lookup(&venue_name) else {
                continue;
            };
            self.open_feed(&symbol, &venue_name, venue.as_ref(), &tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{trade_event, StubVenue};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn aggregator(
        venues: Vec<Arc<StubVenue>>,
        capacity: usize,
    ) -> (Arc<StreamAggregator>, ShutdownSignal) {
        let map: HashMap<String, Arc<dyn Venue>> = venues
            .into_iter()
            .map(|venue| (venue.name().to_string(), venue as Arc<dyn Venue>))
            .collect();
        let registry = Arc::new(VenueRegistry::new(map));
        let shutdown = ShutdownSignal::new();
        let config = StreamConfig {
            capacity,
            monitor_interval_secs: 30,
        };
        let aggregator =
            StreamAggregator::new(registry, Arc::new(Metrics::new()), shutdown.clone(), &config);
        (aggregator, shutdown)
    }

    #[tokio::test]
    async fn get_stream_twice_returns_same_channel() {
        let venue = Arc::new(StubVenue::new("binance"));
        let (aggregator, _shutdown) = aggregator(vec![venue], 16);
        let symbol = Symbol::new("BTCUSDT");

        let first = aggregator.get_stream(&symbol).await;
        let second = aggregator.get_stream(&symbol).await;
        assert!(first.same_channel(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_stamped_with_venue_identity() {
        let venue = Arc::new(StubVenue::new("kraken"));
        let (aggregator, _shutdown) = aggregator(vec![venue.clone()], 16);
        let symbol = Symbol::new("BTCUSDT");

        let stream = aggregator.get_stream(&symbol).await;
        venue.push_trade(trade_event("BTCUSDT")).await;

        let event = stream.recv().await.unwrap();
        assert_eq!(event.venue, "kraken");
        assert_eq!(event.symbol, symbol);
    }

    #[tokio::test(start_paused = true)]
    async fn fans_in_from_all_registered_venues() {
        let binance = Arc::new(StubVenue::new("binance"));
        let kraken = Arc::new(StubVenue::new("kraken"));
        let (aggregator, _shutdown) = aggregator(vec![binance.clone(), kraken.clone()], 16);
        let symbol = Symbol::new("BTCUSDT");

        let stream = aggregator.get_stream(&symbol).await;
        binance.push_trade(trade_event("BTCUSDT")).await;
        kraken.push_trade(trade_event("BTCUSDT")).await;

        let mut venues = vec![
            stream.recv().await.unwrap().venue,
            stream.recv().await.unwrap().venue,
        ];
        venues.sort();
        assert_eq!(venues, ["binance", "kraken"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_instead_of_blocking() {
        let venue = Arc::new(StubVenue::new("binance"));
        let (aggregator, _shutdown) = aggregator(vec![venue.clone()], 1);
        let symbol = Symbol::new("BTCUSDT");

        let stream = aggregator.get_stream(&symbol).await;
        for _ in 0..3 {
            venue.push_trade(trade_event("BTCUSDT")).await;
        }
        // Let the fan-in drain its inbound channel.
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(aggregator.metrics.dropped_events(), 2);
        assert!(stream.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reconnects_terminated_streams() {
        let venue = Arc::new(StubVenue::new("binance"));
        let (aggregator, shutdown) = aggregator(vec![venue.clone()], 16);
        let symbol = Symbol::new("BTCUSDT");

        let stream = aggregator.get_stream(&symbol).await;
        assert_eq!(venue.stream_opens.load(AtomicOrdering::SeqCst), 1);
        let monitor = aggregator.clone().spawn_monitor();

        // Venue-side termination: the fan-in sees the channel close.
        venue.close_streams();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(venue.stream_opens.load(AtomicOrdering::SeqCst), 2);

        // The consumer-facing channel survived the reconnect.
        venue.push_trade(trade_event("BTCUSDT")).await;
        let event = stream.recv().await.unwrap();
        assert_eq!(event.venue, "binance");

        shutdown.trigger();
        monitor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_fan_in_tasks() {
        let venue = Arc::new(StubVenue::new("binance"));
        let (aggregator, shutdown) = aggregator(vec![venue.clone()], 16);
        let symbol = Symbol::new("BTCUSDT");

        let _stream = aggregator.get_stream(&symbol).await;
        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // The fan-in marked itself terminated on the way out.
        let state = aggregator.state.read();
        let feed = &state.feeds[&symbol]["binance"];
        assert!(feed.terminated.load(AtomicOrdering::SeqCst));
    }
}
