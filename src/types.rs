//! Core types - strong typing for order and trade state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Tradeable symbol (e.g. "BTCUSDT").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit" => Some(OrderType::Limit),
            "market" => Some(OrderType::Market),
            _ => None,
        }
    }
}

/// Order lifecycle status.
///
/// The pipeline owns every transition out of `Pending`; once an order is
/// `SentToVenue` only the reconciler may advance it further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    SentToVenue,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
    Rejected,
}

impl OrderStatus {
    /// No further transitions occur from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Failed
                | OrderStatus::Rejected
        )
    }

    /// Statuses the reconciler still tracks against venue state.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, OrderStatus::SentToVenue | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::SentToVenue => "sent_to_venue",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "sent_to_venue" => Some(OrderStatus::SentToVenue),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "failed" => Some(OrderStatus::Failed),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instruction to trade on a named venue.
///
/// Orders carry the venue *name*, never a capability reference; resolution
/// always goes through the registry, which keeps orders serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Locally assigned submission id.
    pub id: Uuid,
    /// Venue-assigned id, present once the venue accepted the order.
    pub venue_order_id: Option<String>,
    pub symbol: Symbol,
    pub order_type: OrderType,
    pub side: Side,
    /// Limit price. Semantically ignored for market orders.
    pub price: Decimal,
    pub quantity: Decimal,
    pub venue: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl Order {
    pub fn limit(
        symbol: Symbol,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        venue: impl Into<String>,
    ) -> Self {
        Self::new(symbol, OrderType::Limit, side, price, quantity, venue)
    }

    pub fn market(
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        venue: impl Into<String>,
    ) -> Self {
        Self::new(symbol, OrderType::Market, side, Decimal::ZERO, quantity, venue)
    }

    fn new(
        symbol: Symbol,
        order_type: OrderType,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        venue: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            venue_order_id: None,
            symbol,
            order_type,
            side,
            price,
            quantity,
            venue: venue.into(),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            retry_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(Error::InvalidOrder(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.order_type == OrderType::Limit && self.price <= Decimal::ZERO {
            return Err(Error::InvalidOrder(format!(
                "limit price must be positive, got {}",
                self.price
            )));
        }
        Ok(())
    }
}

/// A realtime trade observed on a venue. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: Symbol,
    /// Stamped by the aggregator fan-in.
    pub venue: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Source clock.
    pub timestamp: DateTime<Utc>,
}

/// A fill as reported by a venue for one of its orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub venue_trade_id: String,
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub executed_at: DateTime<Utc>,
    pub side: Side,
}

/// A realized fill tied to a local order. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: Uuid,
    pub venue_trade_id: String,
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub executed_at: DateTime<Utc>,
    pub side: Side,
}

impl TradeRecord {
    pub fn from_fill(order_id: Uuid, fill: Fill) -> Self {
        Self {
            order_id,
            venue_trade_id: fill.venue_trade_id,
            symbol: fill.symbol,
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            fee_currency: fill.fee_currency,
            executed_at: fill.executed_at,
            side: fill.side,
        }
    }
}
