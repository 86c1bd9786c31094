//! Order execution collaborators
//!
//! The engine talks to execution through the `ExecutionClient` trait so the
//! live REST client and the paper client are interchangeable. Submission is
//! retried with exponential backoff; exhausted retries surface as a terminal
//! error rather than being swallowed.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ExchangeConfig;
use crate::types::Money;
use crate::{MarketSnapshot, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The venue refused the order; retrying the same order is pointless
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Transport or venue-side failure worth retrying
    #[error("transport error: {0}")]
    Transport(String),

    #[error("order failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Confirmed fill reported back by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub quantity: Money,
    pub average_price: Money,
}

/// Execution venue seam; paper and live clients both implement this
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        price_hint: f64,
    ) -> Result<Fill, ExecutionError>;
}

/// Market data seam; the engine pulls one snapshot per symbol per cycle
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn snapshot(&self, symbol: &Symbol) -> anyhow::Result<MarketSnapshot>;
}

/// Retry with exponential backoff (1s, 2s, 4s, ...) up to `max_attempts`.
///
/// Rejections are not retried. The final failure carries the attempt count
/// so the caller can alert on it.
pub async fn submit_with_retry(
    client: &dyn ExecutionClient,
    symbol: &Symbol,
    side: Side,
    quantity: f64,
    price_hint: f64,
    max_attempts: u32,
) -> Result<Fill, ExecutionError> {
    let mut backoff = Duration::from_secs(1);
    let mut last_error = String::new();
    let attempts = max_attempts.max(1);

    for attempt in 1..=attempts {
        match client.submit_order(symbol, side, quantity, price_hint).await {
            Ok(fill) => return Ok(fill),
            Err(ExecutionError::Rejected(reason)) => {
                return Err(ExecutionError::Rejected(reason));
            }
            Err(err) => {
                warn!(
                    symbol = %symbol,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "order submission failed"
                );
                last_error = err.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(ExecutionError::RetriesExhausted {
        attempts,
        last_error,
    })
}

// ============================================================================
// Paper client
// ============================================================================

/// Fills every order immediately at the hinted price. Keeps a counter so
/// order ids stay unique within a run.
pub struct PaperExecutionClient {
    next_id: Mutex<u64>,
}

impl PaperExecutionClient {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
        }
    }
}

impl Default for PaperExecutionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutionClient {
    async fn submit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        price_hint: f64,
    ) -> Result<Fill, ExecutionError> {
        if quantity <= 0.0 {
            return Err(ExecutionError::Rejected("non-positive quantity".to_string()));
        }
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        info!(symbol = %symbol, %side, quantity, price = price_hint, "paper fill");
        Ok(Fill {
            order_id: format!("paper-{id}"),
            quantity: Money::from_f64(quantity),
            average_price: Money::from_f64(price_hint),
        })
    }
}

// ============================================================================
// REST client
// ============================================================================

#[derive(Debug, Serialize)]
struct OrderRequest {
    side: String,
    order_type: String,
    market: String,
    total_quantity: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    filled_quantity: Option<f64>,
    #[serde(default)]
    avg_price: Option<f64>,
}

/// HMAC-SHA256 signed REST client
pub struct RestExecutionClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestExecutionClient {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing exchange API key"))?;
        let api_secret = config
            .api_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing exchange API secret"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            api_secret,
            base_url: config.base_url.clone(),
            client,
        })
    }

    fn generate_signature(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ExecutionClient for RestExecutionClient {
    async fn submit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        price_hint: f64,
    ) -> Result<Fill, ExecutionError> {
        let request = OrderRequest {
            side: side.to_string(),
            order_type: "market_order".to_string(),
            market: symbol.as_str().to_string(),
            total_quantity: quantity,
            timestamp: Utc::now().timestamp_millis(),
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let signature = self.generate_signature(&body);

        let url = format!("{}/v1/orders/create", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        if response.status().is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Rejected(detail));
        }
        if !response.status().is_success() {
            return Err(ExecutionError::Transport(format!(
                "http status {}",
                response.status()
            )));
        }

        let parsed: OrderResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        if parsed.status == "rejected" {
            return Err(ExecutionError::Rejected(format!("order {}", parsed.id)));
        }

        Ok(Fill {
            order_id: parsed.id,
            quantity: Money::from_f64(parsed.filled_quantity.unwrap_or(quantity)),
            average_price: Money::from_f64(parsed.avg_price.unwrap_or(price_hint)),
        })
    }
}

/// Pulls precomputed snapshots from the market-data service
pub struct RestMarketData {
    base_url: String,
    client: reqwest::Client,
}

impl RestMarketData {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.clone(),
            client,
        })
    }
}

#[async_trait]
impl MarketData for RestMarketData {
    async fn snapshot(&self, symbol: &Symbol) -> anyhow::Result<MarketSnapshot> {
        use anyhow::Context;
        let url = format!("{}/v1/snapshots/{}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetch snapshot for {symbol}"))?
            .error_for_status()
            .with_context(|| format!("snapshot request for {symbol}"))?;
        let snapshot: MarketSnapshot = response
            .json()
            .await
            .with_context(|| format!("parse snapshot for {symbol}"))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
