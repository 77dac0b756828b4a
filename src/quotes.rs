//! Market price lookup used by the slippage guard.

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Symbol;

/// Source of point-in-time market prices.
///
/// The pipeline only needs a single quote per order; wiring a real feed is
/// the embedding process's concern.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn market_price(&self, symbol: &Symbol) -> Result<Decimal>;
}

/// Quote table updated out of band. Missing symbols are an error, which the
/// pipeline turns into a failed order.
#[derive(Default)]
pub struct StaticPrices {
    prices: RwLock<HashMap<Symbol, Decimal>>,
}

impl StaticPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: Symbol, price: Decimal) {
        self.prices.write().insert(symbol, price);
    }
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn market_price(&self, symbol: &Symbol) -> Result<Decimal> {
        self.prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::MarketData(format!("no quote for {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_seeded_quote() {
        let prices = StaticPrices::new();
        prices.set(Symbol::new("BTCUSDT"), Decimal::from(100));
        let quote = prices.market_price(&Symbol::new("btcusdt")).await.unwrap();
        assert_eq!(quote, Decimal::from(100));
    }

    #[tokio::test]
    async fn missing_symbol_is_an_error() {
        let prices = StaticPrices::new();
        assert!(prices.market_price(&Symbol::new("ETHUSDT")).await.is_err());
    }
}
