//! Risk authority client.
//!
//! The authority is the arbiter: a denial is terminal for the order and a
//! query error is never retried by the pipeline.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use crate::types::Order;

/// Synchronous order gate.
#[async_trait]
pub trait RiskAuthority: Send + Sync {
    /// True permits placement; false is a terminal rejection.
    async fn check_order(&self, order: &Order) -> Result<bool>;
}

#[derive(Serialize)]
struct RiskCheckRequest<'a> {
    symbol: &'a str,
    venue: &'a str,
    side: &'a str,
    position_size: Decimal,
}

/// HTTP client for the platform risk controller.
///
/// `POST {base}/validate`: 2xx approves, 403/400 denies with a reason body,
/// anything else is a query error.
pub struct HttpRiskClient {
    base_url: String,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

const RISK_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICE: &str = "risk-controller";

impl HttpRiskClient {
    pub fn new(base_url: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            metrics,
        }
    }
}

#[async_trait]
impl RiskAuthority for HttpRiskClient {
    async fn check_order(&self, order: &Order) -> Result<bool> {
        let request = RiskCheckRequest {
            symbol: order.symbol.as_str(),
            venue: &order.venue,
            side: order.side.as_str(),
            position_size: order.price * order.quantity,
        };

        let response = self
            .client
            .post(format!("{}/validate", self.base_url))
            .timeout(RISK_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            self.metrics.set_circuit_breaker(SERVICE, false);
            return Ok(true);
        }

        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::BAD_REQUEST {
            let reason = response.text().await.unwrap_or_default();
            if reason.to_lowercase().contains("circuit breaker") {
                self.metrics.set_circuit_breaker(SERVICE, true);
            }
            warn!(order = %order.id, %status, reason = %reason, "risk authority denied order");
            return Ok(false);
        }

        Err(Error::Risk(format!(
            "unexpected status {status} from risk authority"
        )))
    }
}
