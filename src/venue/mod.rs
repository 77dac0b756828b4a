//! Venue capability - pluggable trading venue adapters.

pub mod paper;
mod registry;

pub use paper::PaperVenue;
pub use registry::VenueRegistry;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Fill, Order, OrderStatus, Symbol, TradeEvent};

/// Venue-side failure taxonomy. The pipeline retries placement on any of
/// these; a rejection settles as a venue-side cancellation at reconciliation.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level failure (timeout, reset, 5xx).
    #[error("venue transport error: {0}")]
    Transport(String),

    /// The venue refused the request outright.
    #[error("rejected by venue: {0}")]
    Rejected(String),

    #[error("venue not connected")]
    NotConnected,
}

/// A trading venue: order entry plus a realtime trade feed.
///
/// Implementations live outside the core. The registry owns each capability
/// for the process lifetime and hands out shared references.
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the session. Idempotent.
    async fn connect(&self) -> Result<(), VenueError>;

    /// Tear down the session and terminate all open trade streams.
    async fn disconnect(&self) -> Result<(), VenueError>;

    /// Submit an order, returning the venue-assigned id.
    async fn place_order(&self, order: &Order) -> Result<String, VenueError>;

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError>;

    async fn get_order_status(&self, venue_order_id: &str) -> Result<OrderStatus, VenueError>;

    /// Fills reported for a venue order. Empty until the order trades.
    async fn get_trade_details(&self, venue_order_id: &str) -> Result<Vec<Fill>, VenueError>;

    /// Open a realtime trade stream for `symbol`. The channel closes when
    /// the underlying stream terminates or the venue disconnects.
    async fn stream_trades(
        &self,
        symbol: &Symbol,
    ) -> Result<mpsc::Receiver<TradeEvent>, VenueError>;

    async fn get_balance(&self, currency: &str) -> Result<Decimal, VenueError>;
}
