//! Shared fakes for the per-module test suites.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::risk::RiskAuthority;
use crate::store::Store;
use crate::types::{Fill, Order, OrderStatus, Side, Symbol, TradeEvent, TradeRecord};
use crate::venue::{Venue, VenueError};

/// In-memory store mirroring the Postgres contract: upsert by order id,
/// trades unique on `(order_id, venue_trade_id)`.
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, Order>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            trades: Mutex::new(Vec::new()),
        }
    }

    /// Seed an order directly, bypassing the pipeline.
    pub fn insert(&self, order: Order) {
        self.orders.lock().insert(order.id, order);
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.lock().get(&id).cloned()
    }

    pub fn trade_count(&self, order_id: Uuid) -> usize {
        self.trades
            .lock()
            .iter()
            .filter(|trade| trade.order_id == order_id)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn log_order(&self, order: &Order) -> Result<()> {
        self.orders.lock().insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order_status(&self, id: Uuid, status: OrderStatus) -> Result<()> {
        if let Some(order) = self.orders.lock().get_mut(&id) {
            order.status = status;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn log_trade(&self, trade: &TradeRecord) -> Result<()> {
        let mut trades = self.trades.lock();
        let duplicate = trades.iter().any(|existing| {
            existing.order_id == trade.order_id
                && existing.venue_trade_id == trade.venue_trade_id
        });
        if !duplicate {
            trades.push(trade.clone());
        }
        Ok(())
    }

    async fn orders_for_reconciliation(&self) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|order| order.status.needs_reconciliation())
            .cloned()
            .collect())
    }
}

/// Scripted risk authority.
pub struct StubRisk {
    behavior: RiskBehavior,
    pub calls: AtomicU32,
}

enum RiskBehavior {
    Approve,
    Deny,
    Fail,
}

impl StubRisk {
    pub fn approving() -> Self {
        Self::with(RiskBehavior::Approve)
    }

    pub fn denying() -> Self {
        Self::with(RiskBehavior::Deny)
    }

    pub fn failing() -> Self {
        Self::with(RiskBehavior::Fail)
    }

    fn with(behavior: RiskBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RiskAuthority for StubRisk {
    async fn check_order(&self, _order: &Order) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RiskBehavior::Approve => Ok(true),
            RiskBehavior::Deny => Ok(false),
            RiskBehavior::Fail => Err(Error::Risk("risk authority unreachable".into())),
        }
    }
}

/// Scripted venue: placement outcomes are queued, statuses and fills keyed
/// by venue order id, trade streams pushable from the test.
pub struct StubVenue {
    name: String,
    place_results: Mutex<VecDeque<std::result::Result<String, String>>>,
    pub place_calls: AtomicU32,
    statuses: Mutex<HashMap<String, std::result::Result<OrderStatus, String>>>,
    fills: Mutex<HashMap<String, Vec<Fill>>>,
    stream_senders: Mutex<Vec<mpsc::Sender<TradeEvent>>>,
    pub stream_opens: AtomicU32,
}

impl StubVenue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            place_results: Mutex::new(VecDeque::new()),
            place_calls: AtomicU32::new(0),
            statuses: Mutex::new(HashMap::new()),
            fills: Mutex::new(HashMap::new()),
            stream_senders: Mutex::new(Vec::new()),
            stream_opens: AtomicU32::new(0),
        }
    }

    /// Queue the outcome of the next `place_order` call.
    pub fn push_place(&self, result: std::result::Result<&str, &str>) {
        self.place_results.lock().push_back(
            result
                .map(str::to_string)
                .map_err(str::to_string),
        );
    }

    pub fn set_status(&self, venue_order_id: &str, status: OrderStatus) {
        self.statuses
            .lock()
            .insert(venue_order_id.to_string(), Ok(status));
    }

    pub fn set_status_error(&self, venue_order_id: &str, message: &str) {
        self.statuses
            .lock()
            .insert(venue_order_id.to_string(), Err(message.to_string()));
    }

    pub fn set_fills(&self, venue_order_id: &str, fills: Vec<Fill>) {
        self.fills.lock().insert(venue_order_id.to_string(), fills);
    }

    /// Emit an event on every open trade stream.
    pub async fn push_trade(&self, event: TradeEvent) {
        let senders = self.stream_senders.lock().clone();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// Drop every stream sender, closing the inbound channels.
    pub fn close_streams(&self) {
        self.stream_senders.lock().clear();
    }
}

#[async_trait]
impl Venue for StubVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> std::result::Result<(), VenueError> {
        Ok(())
    }

    async fn disconnect(&self) -> std::result::Result<(), VenueError> {
        self.close_streams();
        Ok(())
    }

    async fn place_order(&self, _order: &Order) -> std::result::Result<String, VenueError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        match self.place_results.lock().pop_front() {
            Some(Ok(id)) => Ok(id),
            Some(Err(message)) => Err(VenueError::Transport(message)),
            None => Err(VenueError::Transport("no scripted response".into())),
        }
    }

    async fn cancel_order(&self, _venue_order_id: &str) -> std::result::Result<(), VenueError> {
        Ok(())
    }

    async fn get_order_status(
        &self,
        venue_order_id: &str,
    ) -> std::result::Result<OrderStatus, VenueError> {
        match self.statuses.lock().get(venue_order_id) {
            Some(Ok(status)) => Ok(*status),
            Some(Err(message)) => Err(VenueError::Transport(message.clone())),
            None => Err(VenueError::Transport(format!(
                "unknown order {venue_order_id}"
            ))),
        }
    }

    async fn get_trade_details(
        &self,
        venue_order_id: &str,
    ) -> std::result::Result<Vec<Fill>, VenueError> {
        Ok(self
            .fills
            .lock()
            .get(venue_order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stream_trades(
        &self,
        _symbol: &Symbol,
    ) -> std::result::Result<mpsc::Receiver<TradeEvent>, VenueError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        self.stream_senders.lock().push(tx);
        Ok(rx)
    }

    async fn get_balance(&self, _currency: &str) -> std::result::Result<Decimal, VenueError> {
        Ok(Decimal::ZERO)
    }
}

pub fn limit_order(
    symbol: &str,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    venue: &str,
) -> Order {
    Order::limit(Symbol::new(symbol), side, price, quantity, venue)
}

pub fn fill(venue_trade_id: &str, symbol: &str) -> Fill {
    Fill {
        venue_trade_id: venue_trade_id.to_string(),
        symbol: Symbol::new(symbol),
        price: Decimal::from(100),
        quantity: Decimal::ONE,
        fee: Decimal::new(5, 2),
        fee_currency: "USDT".to_string(),
        executed_at: Utc::now(),
        side: Side::Buy,
    }
}

pub fn trade_event(symbol: &str) -> TradeEvent {
    TradeEvent {
        symbol: Symbol::new(symbol),
        venue: String::new(),
        price: Decimal::from(100),
        quantity: Decimal::ONE,
        timestamp: Utc::now(),
    }
}

/// Poll the store until the order reaches `status`. Panics after a bounded
/// number of polls so a broken pipeline fails fast instead of hanging.
pub async fn wait_for(store: &Arc<MemoryStore>, id: Uuid, status: OrderStatus) {
    for _ in 0..1_000 {
        if store.order(id).map(|order| order.status) == Some(status) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!(
        "order {id} never reached {status}, currently {:?}",
        store.order(id).map(|order| order.status)
    );
}
