//! Paper venue - instant fills and a synthetic trade feed.
//!
//! Used as the default live wiring and by the integration tests. Every
//! placed order fills immediately at its own price with a basis-point fee.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use async_trait::async_trait;

use super::{Venue, VenueError};
use crate::types::{Fill, Order, OrderStatus, Symbol, TradeEvent};

struct PaperOrder {
    status: OrderStatus,
    fills: Vec<Fill>,
}

pub struct PaperVenue {
    name: String,
    fee_rate: Decimal,
    /// Shared with the stream emitter tasks, which stop once it clears.
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    orders: RwLock<HashMap<String, PaperOrder>>,
    balances: RwLock<HashMap<String, Decimal>>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>) -> Self {
        // 5 bps taker fee, funded with play money.
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), Decimal::from(1_000_000));
        Self {
            name: name.into(),
            fee_rate: Decimal::new(5, 4),
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
            balances: RwLock::new(balances),
        }
    }

    fn ensure_connected(&self) -> Result<(), VenueError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VenueError::NotConnected)
        }
    }
}

#[async_trait]
impl Venue for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), VenueError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VenueError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn place_order(&self, order: &Order) -> Result<String, VenueError> {
        self.ensure_connected()?;
        let id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let fill = Fill {
            venue_trade_id: format!("{id}-T1"),
            symbol: order.symbol.clone(),
            price: order.price,
            quantity: order.quantity,
            fee: order.price * order.quantity * self.fee_rate,
            fee_currency: "USDT".to_string(),
            executed_at: Utc::now(),
            side: order.side,
        };
        self.orders.write().insert(
            id.clone(),
            PaperOrder {
                status: OrderStatus::Filled,
                fills: vec![fill],
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        self.ensure_connected()?;
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(venue_order_id)
            .ok_or_else(|| VenueError::Rejected(format!("unknown order {venue_order_id}")))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn get_order_status(&self, venue_order_id: &str) -> Result<OrderStatus, VenueError> {
        self.ensure_connected()?;
        self.orders
            .read()
            .get(venue_order_id)
            .map(|order| order.status)
            .ok_or_else(|| VenueError::Rejected(format!("unknown order {venue_order_id}")))
    }

    async fn get_trade_details(&self, venue_order_id: &str) -> Result<Vec<Fill>, VenueError> {
        self.ensure_connected()?;
        self.orders
            .read()
            .get(venue_order_id)
            .map(|order| order.fills.clone())
            .ok_or_else(|| VenueError::Rejected(format!("unknown order {venue_order_id}")))
    }

    async fn stream_trades(
        &self,
        symbol: &Symbol,
    ) -> Result<mpsc::Receiver<TradeEvent>, VenueError> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::channel(64);

        let symbol = symbol.clone();
        let venue = self.name.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut tick: u64 = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                tick += 1;
                let event = TradeEvent {
                    symbol: symbol.clone(),
                    venue: venue.clone(),
                    price: Decimal::from(100) + Decimal::from(tick % 5),
                    quantity: Decimal::new(1, 2),
                    timestamp: Utc::now(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn get_balance(&self, currency: &str) -> Result<Decimal, VenueError> {
        self.ensure_connected()?;
        Ok(self
            .balances
            .read()
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
