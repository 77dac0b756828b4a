//! Reconciliation engine - venue truth repairs local order state.
//!
//! On a fixed cadence, every order still tracking venue state is checked
//! against its venue. Where the two disagree, the venue wins; fills are
//! harvested into the trade log, which is idempotent per
//! `(order_id, venue_trade_id)`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use crate::store::Store;
use crate::telemetry::Metrics;
use crate::types::{Order, OrderStatus, TradeRecord};
use crate::venue::{Venue, VenueRegistry};

pub struct Reconciler {
    registry: Arc<VenueRegistry>,
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<VenueRegistry>,
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            metrics,
            interval,
        }
    }

    /// Run until shutdown. A cycle that overruns the interval causes the
    /// next tick to be skipped, never queued; shutdown is observed between
    /// cycles, so a running cycle always completes.
    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Consume the immediate tick so the cadence starts one interval out.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.reconcile().await {
                            error!(%err, "reconciliation cycle failed");
                        }
                    }
                }
            }
            debug!("reconciler stopped");
        })
    }

    /// One reconciliation cycle. A single order's failure never aborts it.
    pub async fn reconcile(&self) -> Result<()> {
        let orders = self.store.orders_for_reconciliation().await?;
        debug!(open = orders.len(), "starting reconciliation cycle");

        for mut order in orders {
            let Some(venue_order_id) = order.venue_order_id.clone() else {
                warn!(order = %order.id, "open order has no venue id, skipping");
                continue;
            };

            let venue = match self.registry.get(&order.venue) {
                Ok(venue) => venue,
                Err(_) => {
                    warn!(
                        order = %order.id,
                        venue = %order.venue,
                        "venue not registered, skipping"
                    );
                    continue;
                }
            };

            let call_started = tokio::time::Instant::now();
            let status = venue.get_order_status(&venue_order_id).await;
            self.metrics
                .observe_venue_latency(&order.venue, call_started.elapsed().as_secs_f64());
            let status = match status {
                Ok(status) => status,
                Err(err) => {
                    warn!(
                        order = %order.id,
                        venue = %order.venue,
                        %err,
                        "status query failed, retrying next cycle"
                    );
                    continue;
                }
            };

            if status == order.status {
                continue;
            }

            info!(
                order = %order.id,
                ours = order.status.as_str(),
                venue = status.as_str(),
                "status divergence, venue wins"
            );
            if let Err(err) = self.store.update_order_status(order.id, status).await {
                warn!(order = %order.id, %err, "failed to persist status update");
            }
            order.status = status;

            match status {
                OrderStatus::Filled => {
                    self.harvest_fills(venue.as_ref(), &order, &venue_order_id)
                        .await
                }
                OrderStatus::Cancelled => {
                    info!(order = %order.id, venue = %order.venue, "order cancelled on venue");
                }
                _ => {}
            }
        }

        debug!("reconciliation cycle complete");
        Ok(())
    }

    async fn harvest_fills(&self, venue: &dyn Venue, order: &Order, venue_order_id: &str) {
        let fills = match venue.get_trade_details(venue_order_id).await {
            Ok(fills) => fills,
            Err(err) => {
                warn!(order = %order.id, %err, "failed to fetch trade details");
                return;
            }
        };

        for fill in fills {
            let record = TradeRecord::from_fill(order.id, fill);
            if let Err(err) = self.store.log_trade(&record).await {
                warn!(
                    order = %order.id,
                    trade = %record.venue_trade_id,
                    %err,
                    "failed to log trade"
                );
            }
        }

        self.metrics
            .record_order_filled(&order.venue, order.symbol.as_str());
        info!(order = %order.id, venue = %order.venue, "order filled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fill, limit_order, MemoryStore, StubVenue};
    use crate::types::Side;
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    struct Harness {
        reconciler: Reconciler,
        store: Arc<MemoryStore>,
        venue: Arc<StubVenue>,
    }

    fn harness() -> Harness {
        let venue = Arc::new(StubVenue::new("binance"));
        let mut venues: HashMap<String, Arc<dyn Venue>> = HashMap::new();
        venues.insert("binance".to_string(), venue.clone());
        let registry = Arc::new(VenueRegistry::new(venues));
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            registry,
            store.clone(),
            Arc::new(Metrics::new()),
            Duration::from_secs(300),
        );
        Harness {
            reconciler,
            store,
            venue,
        }
    }

    fn sent_order(venue_order_id: &str) -> Order {
        let mut order = limit_order(
            "BTCUSDT",
            Side::Buy,
            Decimal::from(100),
            Decimal::ONE,
            "binance",
        );
        order.status = OrderStatus::SentToVenue;
        order.venue_order_id = Some(venue_order_id.to_string());
        order
    }

    #[tokio::test]
    async fn promotes_filled_order_and_harvests_trades_once() {
        let h = harness();
        let order = sent_order("B1");
        let id = order.id;
        h.store.insert(order);
        h.venue.set_status("B1", OrderStatus::Filled);
        h.venue
            .set_fills("B1", vec![fill("B1-T1", "BTCUSDT"), fill("B1-T2", "BTCUSDT")]);

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.store.order(id).unwrap().status, OrderStatus::Filled);
        assert_eq!(h.store.trade_count(id), 2);

        // Second cycle with the same venue response adds nothing.
        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.store.trade_count(id), 2);
    }

    #[tokio::test]
    async fn duplicate_fill_reports_stay_unique() {
        let h = harness();
        let order = sent_order("B2");
        let id = order.id;
        h.store.insert(order);
        h.venue.set_status("B2", OrderStatus::Filled);
        h.venue
            .set_fills("B2", vec![fill("B2-T1", "BTCUSDT"), fill("B2-T1", "BTCUSDT")]);

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.store.trade_count(id), 1);
    }

    #[tokio::test]
    async fn one_failing_order_does_not_abort_the_cycle() {
        let h = harness();
        let broken = sent_order("B3");
        let broken_id = broken.id;
        let healthy = sent_order("B4");
        let healthy_id = healthy.id;
        h.store.insert(broken);
        h.store.insert(healthy);
        h.venue.set_status_error("B3", "socket reset");
        h.venue.set_status("B4", OrderStatus::Cancelled);

        h.reconciler.reconcile().await.unwrap();
        // The broken order keeps its status for the next cycle.
        assert_eq!(
            h.store.order(broken_id).unwrap().status,
            OrderStatus::SentToVenue
        );
        assert_eq!(
            h.store.order(healthy_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn unregistered_venue_is_skipped() {
        let h = harness();
        let mut order = sent_order("X1");
        order.venue = "disabled-venue".to_string();
        let id = order.id;
        h.store.insert(order);

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.store.order(id).unwrap().status, OrderStatus::SentToVenue);
    }

    #[tokio::test]
    async fn partial_fill_updates_status_only() {
        let h = harness();
        let order = sent_order("B5");
        let id = order.id;
        h.store.insert(order);
        h.venue.set_status("B5", OrderStatus::PartiallyFilled);

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(
            h.store.order(id).unwrap().status,
            OrderStatus::PartiallyFilled
        );
        assert_eq!(h.store.trade_count(id), 0);
    }

    #[tokio::test]
    async fn matching_status_is_left_alone() {
        let h = harness();
        let order = sent_order("B6");
        let id = order.id;
        h.store.insert(order);
        h.venue.set_status("B6", OrderStatus::SentToVenue);

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.store.order(id).unwrap().status, OrderStatus::SentToVenue);
        assert_eq!(h.store.trade_count(id), 0);
    }
}
