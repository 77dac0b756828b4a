//! Order execution pipeline.
//!
//! Orders enter through a bounded intake and are processed one task per
//! order: slippage guard, risk gate, then venue placement with bounded
//! linear-backoff retry. Every transition is persisted to the store.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::quotes::PriceSource;
use crate::risk::RiskAuthority;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::telemetry::Metrics;
use crate::types::{Order, OrderStatus, OrderType, Side};
use crate::venue::VenueRegistry;

struct PipelineContext {
    registry: Arc<VenueRegistry>,
    risk: Arc<dyn RiskAuthority>,
    store: Arc<dyn Store>,
    quotes: Arc<dyn PriceSource>,
    metrics: Arc<Metrics>,
    config: ExecutionConfig,
}

/// Cloneable submit handle. Construction also yields the worker that owns
/// the intake; spawn it to start processing.
#[derive(Clone)]
pub struct OrderPipeline {
    tx: mpsc::Sender<Order>,
    registry: Arc<VenueRegistry>,
}

/// Owns the intake receiver and the dispatch loop.
pub struct PipelineWorker {
    rx: mpsc::Receiver<Order>,
    ctx: Arc<PipelineContext>,
}

impl OrderPipeline {
    pub fn new(
        registry: Arc<VenueRegistry>,
        risk: Arc<dyn RiskAuthority>,
        store: Arc<dyn Store>,
        quotes: Arc<dyn PriceSource>,
        metrics: Arc<Metrics>,
        config: ExecutionConfig,
    ) -> (Self, PipelineWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let ctx = Arc::new(PipelineContext {
            registry: registry.clone(),
            risk,
            store,
            quotes,
            metrics,
            config,
        });
        (Self { tx, registry }, PipelineWorker { rx, ctx })
    }

    /// Admit an order. Suspends while the intake is full; returns the local
    /// id once enqueued. Processing continues asynchronously.
    pub async fn submit(&self, mut order: Order) -> Result<Uuid> {
        order.validate()?;
        if !self.registry.contains(&order.venue) {
            return Err(Error::VenueNotFound(order.venue.clone()));
        }
        order.status = OrderStatus::Pending;
        let now = chrono::Utc::now();
        order.created_at = now;
        order.updated_at = now;
        let id = order.id;
        self.tx.send(order).await.map_err(|_| Error::PipelineClosed)?;
        Ok(id)
    }
}

impl PipelineWorker {
    /// Dispatch loop: one spawned task per order, so a slow venue never
    /// blocks other orders. Stops dequeuing on shutdown; in-flight orders
    /// run to completion.
    pub fn spawn(mut self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    order = self.rx.recv() => match order {
                        Some(order) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                process_order(ctx, order).await;
                            });
                        }
                        None => break,
                    },
                }
            }
            debug!("order pipeline stopped");
        })
    }
}

async fn process_order(ctx: Arc<PipelineContext>, mut order: Order) {
    if ctx.config.slippage_protection && order.order_type == OrderType::Limit {
        match ctx.quotes.market_price(&order.symbol).await {
            Ok(market) => {
                let adjusted = guard_limit_price(order.side, order.price, market);
                if adjusted != order.price {
                    debug!(
                        order = %order.id,
                        from = %order.price,
                        to = %adjusted,
                        "slippage guard adjusted limit price"
                    );
                    order.price = adjusted;
                }
            }
            Err(err) => {
                fail(&ctx, &mut order, &format!("failed to get market price: {err}")).await;
                return;
            }
        }
    }

    let risk_started = Instant::now();
    let verdict = ctx.risk.check_order(&order).await;
    ctx.metrics
        .observe_risk_duration("risk-controller", risk_started.elapsed().as_secs_f64());
    match verdict {
        Ok(true) => {}
        Ok(false) => {
            order.status = OrderStatus::Rejected;
            persist(&ctx, &mut order, "Rejected by risk controller").await;
            return;
        }
        Err(err) => {
            fail(&ctx, &mut order, &format!("risk check failed: {err}")).await;
            return;
        }
    }

    for attempt in 0..=ctx.config.max_retries {
        order.retry_count = attempt;
        if attempt > 0 {
            tokio::time::sleep(ctx.config.retry_delay() * attempt).await;
        }

        let venue = match ctx.registry.get(&order.venue) {
            Ok(venue) => venue,
            Err(err) => {
                fail(&ctx, &mut order, &err.to_string()).await;
                return;
            }
        };

        let call_started = Instant::now();
        let placed = venue.place_order(&order).await;
        ctx.metrics
            .observe_venue_latency(&order.venue, call_started.elapsed().as_secs_f64());

        match placed {
            Ok(venue_order_id) => {
                order.venue_order_id = Some(venue_order_id);
                order.status = OrderStatus::SentToVenue;
                ctx.metrics
                    .record_order_sent(&order.venue, order.symbol.as_str());
                persist(&ctx, &mut order, "order sent to venue").await;
                return;
            }
            Err(err) => {
                persist(
                    &ctx,
                    &mut order,
                    &format!("placement attempt {} failed: {err}", attempt + 1),
                )
                .await;
            }
        }
    }

    order.status = OrderStatus::Failed;
    persist(&ctx, &mut order, "placement retries exhausted").await;
}

/// Slippage guard: makes marginal limit prices marginally more aggressive
/// than the market, and is the identity when the submitted price already is.
fn guard_limit_price(side: Side, price: Decimal, market: Decimal) -> Decimal {
    match side {
        Side::Buy if price < market => market * Decimal::new(1005, 3),
        Side::Sell if price > market => market * Decimal::new(995, 3),
        _ => price,
    }
}

async fn persist(ctx: &PipelineContext, order: &mut Order, message: &str) {
    order.updated_at = chrono::Utc::now();
    info!(
        order = %order.id,
        status = order.status.as_str(),
        venue = %order.venue,
        "{message}"
    );
    // In-memory state is not rolled back on a store failure; the venue holds
    // authoritative state and reconciliation recovers.
    if let Err(err) = ctx.store.log_order(order).await {
        warn!(order = %order.id, %err, "failed to persist order");
    }
}

async fn fail(ctx: &PipelineContext, order: &mut Order, message: &str) {
    order.status = OrderStatus::Failed;
    persist(ctx, order, message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::StaticPrices;
    use crate::test_support::{limit_order, wait_for, MemoryStore, StubRisk, StubVenue};
    use crate::types::Symbol;
    use crate::venue::Venue;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        pipeline: OrderPipeline,
        worker_task: JoinHandle<()>,
        store: Arc<MemoryStore>,
        venue: Arc<StubVenue>,
        risk: Arc<StubRisk>,
        shutdown: ShutdownSignal,
    }

    fn harness(risk: StubRisk) -> Harness {
        let venue = Arc::new(StubVenue::new("binance"));
        let mut venues: HashMap<String, Arc<dyn Venue>> = HashMap::new();
        venues.insert("binance".to_string(), venue.clone());
        let registry = Arc::new(VenueRegistry::new(venues));
        let store = Arc::new(MemoryStore::new());
        let quotes = Arc::new(StaticPrices::new());
        quotes.set(Symbol::new("BTCUSDT"), Decimal::from(100));
        let risk = Arc::new(risk);
        let metrics = Arc::new(Metrics::new());
        let config = ExecutionConfig {
            slippage_protection: true,
            max_retries: 3,
            retry_delay_ms: 500,
            queue_capacity: 16,
        };
        let (pipeline, worker) = OrderPipeline::new(
            registry,
            risk.clone(),
            store.clone(),
            quotes,
            metrics,
            config,
        );
        let shutdown = ShutdownSignal::new();
        let worker_task = worker.spawn(shutdown.clone());
        Harness {
            pipeline,
            worker_task,
            store,
            venue,
            risk,
            shutdown,
        }
    }

    async fn teardown(harness: Harness) {
        harness.shutdown.trigger();
        harness.worker_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_leaves_aggressive_price_alone() {
        let h = harness(StubRisk::approving());
        h.venue.push_place(Ok("B1"));

        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::SentToVenue).await;
        let stored = h.store.order(id).unwrap();
        assert_eq!(stored.price, Decimal::from(100));
        assert_eq!(stored.venue_order_id.as_deref(), Some("B1"));
        assert_eq!(stored.retry_count, 0);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slippage_raises_buy_below_market() {
        let h = harness(StubRisk::approving());
        h.venue.push_place(Ok("B2"));

        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(99), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::SentToVenue).await;
        // 100 * 1.005
        assert_eq!(h.store.order(id).unwrap().price, Decimal::new(1005, 1));
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slippage_lowers_sell_above_market() {
        let h = harness(StubRisk::approving());
        h.venue.push_place(Ok("S1"));

        let order = limit_order("BTCUSDT", Side::Sell, Decimal::from(101), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::SentToVenue).await;
        // 100 * 0.995
        assert_eq!(h.store.order(id).unwrap().price, Decimal::new(995, 1));
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn risk_denial_is_terminal_without_venue_call() {
        let h = harness(StubRisk::denying());

        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::Rejected).await;
        assert_eq!(h.venue.place_calls.load(Ordering::SeqCst), 0);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn risk_error_fails_without_retry() {
        let h = harness(StubRisk::failing());

        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::Failed).await;
        assert_eq!(h.risk.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.venue.place_calls.load(Ordering::SeqCst), 0);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff_then_succeeds() {
        let h = harness(StubRisk::approving());
        h.venue.push_place(Err("gateway timeout"));
        h.venue.push_place(Err("gateway timeout"));
        h.venue.push_place(Ok("K7"));

        let begun = Instant::now();
        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::SentToVenue).await;
        // Backoff before attempts 2 and 3: 500 ms + 1 s.
        let elapsed = begun.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "elapsed {elapsed:?}");

        let stored = h.store.order(id).unwrap();
        assert_eq!(stored.venue_order_id.as_deref(), Some("K7"));
        assert_eq!(stored.retry_count, 2);
        assert_eq!(h.venue.place_calls.load(Ordering::SeqCst), 3);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_order() {
        let h = harness(StubRisk::approving());
        for _ in 0..4 {
            h.venue.push_place(Err("gateway timeout"));
        }

        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::Failed).await;
        let stored = h.store.order(id).unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(h.venue.place_calls.load(Ordering::SeqCst), 4);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn market_price_failure_fails_the_order() {
        let h = harness(StubRisk::approving());

        // No quote seeded for this symbol.
        let order = limit_order("ETHUSDT", Side::Buy, Decimal::from(50), Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::Failed).await;
        assert_eq!(h.risk.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.venue.place_calls.load(Ordering::SeqCst), 0);
        teardown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn market_orders_skip_the_slippage_guard() {
        let h = harness(StubRisk::approving());
        h.venue.push_place(Ok("M1"));

        // No quote for the symbol, but market orders never look one up.
        let order = Order::market(Symbol::new("SOLUSDT"), Side::Buy, Decimal::ONE, "binance");
        let id = h.pipeline.submit(order).await.unwrap();

        wait_for(&h.store, id, OrderStatus::SentToVenue).await;
        teardown(h).await;
    }

    #[tokio::test]
    async fn submit_rejects_unknown_venue() {
        let h = harness(StubRisk::approving());
        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ONE, "luno");
        match h.pipeline.submit(order).await {
            Err(Error::VenueNotFound(name)) => assert_eq!(name, "luno"),
            other => panic!("expected VenueNotFound, got {other:?}"),
        }
        teardown(h).await;
    }

    #[tokio::test]
    async fn submit_rejects_invalid_order() {
        let h = harness(StubRisk::approving());
        let order = limit_order("BTCUSDT", Side::Buy, Decimal::from(100), Decimal::ZERO, "binance");
        assert!(matches!(
            h.pipeline.submit(order).await,
            Err(Error::InvalidOrder(_))
        ));
        teardown(h).await;
    }

    #[test]
    fn guard_is_identity_when_price_is_aggressive() {
        let market = Decimal::from(100);
        assert_eq!(
            guard_limit_price(Side::Buy, Decimal::from(100), market),
            Decimal::from(100)
        );
        assert_eq!(
            guard_limit_price(Side::Buy, Decimal::from(120), market),
            Decimal::from(120)
        );
        assert_eq!(
            guard_limit_price(Side::Sell, Decimal::from(100), market),
            Decimal::from(100)
        );
        assert_eq!(
            guard_limit_price(Side::Sell, Decimal::from(80), market),
            Decimal::from(80)
        );
    }

    #[test]
    fn guard_adjusts_marginal_prices() {
        let market = Decimal::from(100);
        assert_eq!(
            guard_limit_price(Side::Buy, Decimal::from(99), market),
            Decimal::new(1005, 1)
        );
        assert_eq!(
            guard_limit_price(Side::Sell, Decimal::from(101), market),
            Decimal::new(995, 1)
        );
    }
}
