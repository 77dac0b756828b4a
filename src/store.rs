//! Order and trade persistence.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Order, OrderStatus, OrderType, Side, Symbol, TradeRecord};

/// Durable order/trade log.
///
/// Implementations must be safe for concurrent use and must make
/// `log_trade` idempotent on `(order_id, venue_trade_id)`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert by local order id.
    async fn log_order(&self, order: &Order) -> Result<()>;

    async fn update_order_status(&self, id: Uuid, status: OrderStatus) -> Result<()>;

    /// Insert a realized fill. Duplicate `(order_id, venue_trade_id)` pairs
    /// are ignored.
    async fn log_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// All orders whose status still tracks venue state.
    async fn orders_for_reconciliation(&self) -> Result<Vec<Order>>;
}

/// Postgres/TimescaleDB-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and verify the connection with a ping.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        const SCHEMA: &[&str] = &[
            r#"CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                venue_order_id TEXT,
                symbol TEXT NOT NULL,
                type TEXT NOT NULL,
                side TEXT NOT NULL,
                price NUMERIC NOT NULL,
                quantity NUMERIC NOT NULL,
                venue TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                retry_count INTEGER NOT NULL
            )"#,
            // No foreign key from trades to orders: hypertables reject them.
            r#"CREATE TABLE IF NOT EXISTS trades (
                id BIGSERIAL,
                order_id UUID NOT NULL,
                venue_trade_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                price NUMERIC NOT NULL,
                quantity NUMERIC NOT NULL,
                fee NUMERIC NOT NULL,
                fee_currency TEXT NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL,
                side TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol)",
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_order_trade
                ON trades(order_id, venue_trade_id)",
        ];
        for query in SCHEMA {
            sqlx::query(query).execute(&self.pool).await?;
        }

        // Time partitioning needs the TimescaleDB extension; plain Postgres
        // works without it.
        const HYPERTABLES: &[&str] = &[
            "SELECT create_hypertable('orders', 'created_at', if_not_exists => TRUE)",
            "SELECT create_hypertable('trades', 'executed_at', if_not_exists => TRUE)",
        ];
        for query in HYPERTABLES {
            if let Err(err) = sqlx::query(query).execute(&self.pool).await {
                warn!(%err, "hypertable creation skipped");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn log_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO orders (
                id, venue_order_id, symbol, type, side, price, quantity,
                venue, status, created_at, updated_at, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                venue_order_id = EXCLUDED.venue_order_id,
                price = EXCLUDED.price,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                retry_count = EXCLUDED.retry_count"#,
        )
        .bind(order.id)
        .bind(&order.venue_order_id)
        .bind(order.symbol.as_str())
        .bind(order.order_type.as_str())
        .bind(order.side.as_str())
        .bind(order.price)
        .bind(order.quantity)
        .bind(&order.venue)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.retry_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_order_status(&self, id: Uuid, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO trades (
                order_id, venue_trade_id, symbol, price, quantity,
                fee, fee_currency, executed_at, side
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (order_id, venue_trade_id) DO NOTHING"#,
        )
        .bind(trade.order_id)
        .bind(&trade.venue_trade_id)
        .bind(trade.symbol.as_str())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.fee)
        .bind(&trade.fee_currency)
        .bind(trade.executed_at)
        .bind(trade.side.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn orders_for_reconciliation(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"SELECT id, venue_order_id, symbol, type, side, price, quantity,
                      venue, status, created_at, updated_at, retry_count
               FROM orders
               WHERE status IN ('sent_to_venue', 'partially_filled')"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let status_text: String = row.try_get("status")?;
    let status = OrderStatus::parse(&status_text)
        .ok_or_else(|| Error::Store(format!("unknown order status: {status_text}")))?;
    let type_text: String = row.try_get("type")?;
    let order_type = OrderType::parse(&type_text)
        .ok_or_else(|| Error::Store(format!("unknown order type: {type_text}")))?;
    let side_text: String = row.try_get("side")?;
    let side = Side::parse(&side_text)
        .ok_or_else(|| Error::Store(format!("unknown order side: {side_text}")))?;

    Ok(Order {
        id: row.try_get("id")?,
        venue_order_id: row.try_get("venue_order_id")?,
        symbol: Symbol::new(row.try_get::<String, _>("symbol")?),
        order_type,
        side,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        venue: row.try_get("venue")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
    })
}
