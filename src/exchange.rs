//! bitFlyer exchange adapter
//!
//! HTTP client for the bitFlyer REST API with HMAC request signing,
//! retry-with-backoff on every network call, and order-safety policies the
//! exchange itself does not enforce: per-symbol lot bounds, a hard per-order
//! cost ceiling, and a buy-side balance pre-check with a buffer for price
//! drift and fees.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{OrderSide, Symbol};

pub const API_BASE_URL: &str = "https://api.bitflyer.com";

/// Commission charged per executed leg
pub const COMMISSION_RATE: f64 = 0.0015;

/// Buffer applied on top of commission in the balance pre-check
pub const BALANCE_BUFFER_RATE: f64 = 0.03;

/// Hard ceiling on a single order's notional, in JPY
pub const MAX_ORDER_COST_JPY: f64 = 100_000_000.0;

/// Normalized order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Closed,
    Filled,
    Canceled,
    Unknown,
}

impl OrderStatus {
    /// Closed and Filled both mean the order executed
    pub fn is_success(&self) -> bool {
        matches!(self, OrderStatus::Closed | OrderStatus::Filled)
    }

    /// Terminal statuses end the status-polling loop
    pub fn is_terminal(&self) -> bool {
        self.is_success() || matches!(self, OrderStatus::Canceled)
    }
}

/// Result of an order placement or status query
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub id: String,
    pub status: OrderStatus,
    /// Amount actually executed
    pub filled: f64,
    /// Amount requested
    pub amount: f64,
    /// Realized VWAP when known
    pub average: Option<f64>,
    pub price: Option<f64>,
    pub cost: f64,
    pub fee: f64,
}

impl OrderResult {
    /// Confirmed execution price: average, else limit price, else the fallback
    pub fn executed_price(&self, fallback: f64) -> f64 {
        self.average.or(self.price).unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

/// Thin exchange interface consumed by the executors
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError>;

    async fn create_limit_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderResult, ExchangeError>;

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<OrderResult, ExchangeError>;

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, ExchangeError>;

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError>;
}

// ==================== Order-safety policies ====================

/// Minimum order amount per symbol
pub fn min_order_amount(symbol: &Symbol) -> f64 {
    match symbol.as_str() {
        "BTC/JPY" => 0.001,
        "ETH/JPY" => 0.01,
        "XRP/JPY" => 1.0,
        "FX_BTC_JPY" => 0.01,
        _ => 0.0,
    }
}

/// Maximum order amount per symbol, rejecting fat-finger quantities
pub fn max_order_amount(symbol: &Symbol) -> f64 {
    match symbol.as_str() {
        "BTC/JPY" | "FX_BTC_JPY" => 10.0,
        "ETH/JPY" => 100.0,
        "XRP/JPY" => 100_000.0,
        _ => 1_000.0,
    }
}

pub fn validate_order_amount(symbol: &Symbol, amount: f64) -> Result<(), ExchangeError> {
    let min = min_order_amount(symbol);
    if amount < min {
        return Err(ExchangeError::BelowMinAmount {
            symbol: symbol.to_string(),
            amount,
            min,
        });
    }
    let max = max_order_amount(symbol);
    if amount > max {
        return Err(ExchangeError::AboveMaxAmount {
            symbol: symbol.to_string(),
            amount,
            max,
        });
    }
    Ok(())
}

/// Round an amount to the exchange's 8-decimal precision
pub fn round_amount(amount: f64) -> f64 {
    (amount * 1e8).round() / 1e8
}

/// JPY prices are integral; everything else keeps 8 decimals
pub fn round_price(price: f64, symbol: &Symbol) -> f64 {
    if symbol.quote_currency() == "JPY" {
        price.round()
    } else {
        (price * 1e8).round() / 1e8
    }
}

// ==================== bitFlyer client ====================

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct BitflyerClient {
    api_key: String,
    api_secret: String,
    http: reqwest::Client,
    read_policy: RetryPolicy,
    order_policy: RetryPolicy,
    max_order_cost: f64,
    balance_buffer: f64,
    commission_rate: f64,
}

/// bitFlyer product code for a symbol ("BTC/JPY" -> "BTC_JPY")
fn product_code(symbol: &Symbol) -> String {
    symbol.as_str().replace('/', "_")
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    ltp: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    currency_code: String,
    amount: f64,
    available: f64,
}

#[derive(Debug, Deserialize)]
struct SendChildOrderResponse {
    child_order_acceptance_id: String,
}

#[derive(Debug, Deserialize)]
struct ChildOrder {
    child_order_state: String,
    size: f64,
    #[serde(default)]
    executed_size: f64,
    #[serde(default)]
    average_price: f64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    total_commission: f64,
    child_order_acceptance_id: String,
}

impl ChildOrder {
    fn to_order_result(&self) -> OrderResult {
        let status = match self.child_order_state.as_str() {
            "ACTIVE" => OrderStatus::Open,
            "COMPLETED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" | "REJECTED" => OrderStatus::Canceled,
            _ => OrderStatus::Unknown,
        };
        OrderResult {
            id: self.child_order_acceptance_id.clone(),
            status,
            filled: self.executed_size,
            amount: self.size,
            average: (self.average_price > 0.0).then_some(self.average_price),
            price: (self.price > 0.0).then_some(self.price),
            cost: self.average_price * self.executed_size,
            fee: self.total_commission,
        }
    }
}

impl BitflyerClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        BitflyerClient {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            http,
            read_policy: RetryPolicy::api(),
            order_policy: RetryPolicy::order(),
            max_order_cost: MAX_ORDER_COST_JPY,
            balance_buffer: BALANCE_BUFFER_RATE,
            commission_rate: COMMISSION_RATE,
        }
    }

    pub fn with_limits(mut self, max_order_cost: f64, balance_buffer: f64, commission: f64) -> Self {
        self.max_order_cost = max_order_cost;
        self.balance_buffer = balance_buffer;
        self.commission_rate = commission;
        self
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn map_send_error(err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() {
            ExchangeError::Timeout { order_id: None }
        } else {
            ExchangeError::Network(err.to_string())
        }
    }

    async fn check_response(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited(text));
        }
        if status.is_client_error() {
            return Err(ExchangeError::Rejected(format!("{}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(ExchangeError::Network(format!("{}: {}", status, text)));
        }
        Ok(text)
    }

    async fn public_get(&self, path_and_query: &str) -> Result<String, ExchangeError> {
        let url = format!("{}{}", API_BASE_URL, path_and_query);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }

    async fn private_get(&self, path_and_query: &str) -> Result<String, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, "GET", path_and_query, "");
        let url = format!("{}{}", API_BASE_URL, path_and_query);
        let response = self
            .http
            .get(&url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-SIGN", signature)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }

    async fn private_post(&self, path: &str, body: String) -> Result<String, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, "POST", path, &body);
        let url = format!("{}{}", API_BASE_URL, path);
        let response = self
            .http
            .post(&url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }

    /// Pre-trade checks the exchange does not perform for us
    async fn pre_trade_checks(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<(), ExchangeError> {
        validate_order_amount(symbol, amount)?;

        let estimated_price = self.get_current_price(symbol).await?;
        let estimated_cost = round_price(amount * estimated_price, symbol);
        if estimated_cost > self.max_order_cost {
            return Err(ExchangeError::CostCeilingExceeded {
                cost: estimated_cost,
                ceiling: self.max_order_cost,
            });
        }

        if side == OrderSide::Buy {
            let quote = symbol.quote_currency();
            match self.fetch_balance(quote).await {
                Ok(balance) => {
                    let required = estimated_cost
                        * (1.0 + self.commission_rate)
                        * (1.0 + self.balance_buffer);
                    if required > balance.free {
                        return Err(ExchangeError::InsufficientBalance {
                            currency: quote.to_string(),
                            required,
                            available: balance.free,
                        });
                    }
                }
                Err(e) => {
                    // Balance check is best-effort; the exchange rejects for real
                    warn!("balance pre-check failed, continuing: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn send_child_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        order_type: &str,
        amount: f64,
        price: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        let amount = round_amount(amount);
        let code = product_code(symbol);
        let mut body = serde_json::json!({
            "product_code": code,
            "child_order_type": order_type,
            "side": match side { OrderSide::Buy => "BUY", OrderSide::Sell => "SELL" },
            "size": amount,
        });
        if let Some(p) = price {
            body["price"] = serde_json::json!(round_price(p, symbol));
        }
        let body = body.to_string();

        let accepted: SendChildOrderResponse = {
            let text = with_retry(&self.order_policy, || {
                self.private_post("/v1/me/sendchildorder", body.clone())
            })
            .await?;
            serde_json::from_str(&text)
                .map_err(|e| ExchangeError::Network(format!("bad order response: {}", e)))?
        };
        let acceptance_id = accepted.child_order_acceptance_id;
        info!("order accepted: {} {} {:.8} {} ({})", side, symbol, amount, order_type, acceptance_id);

        // The acceptance id is not a fill. Look the order up briefly; if it
        // has not propagated yet, surface a timeout carrying the id so the
        // caller can keep polling on its own schedule.
        for attempt in 0..3u32 {
            if attempt > 0 {
                sleep(Duration::from_secs(1)).await;
            }
            match self.get_order_status(&acceptance_id, symbol).await {
                Ok(result) if result.status != OrderStatus::Unknown => return Ok(result),
                Ok(_) => continue,
                Err(e) => {
                    debug!("order lookup attempt {} failed: {}", attempt + 1, e);
                }
            }
        }
        Err(ExchangeError::Timeout {
            order_id: Some(acceptance_id),
        })
    }
}

#[async_trait]
impl ExchangeApi for BitflyerClient {
    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.pre_trade_checks(symbol, side, amount).await?;
        self.send_child_order(symbol, side, "MARKET", amount, None).await
    }

    async fn create_limit_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.pre_trade_checks(symbol, side, amount).await?;
        self.send_child_order(symbol, side, "LIMIT", amount, Some(price)).await
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<OrderResult, ExchangeError> {
        let path = format!(
            "/v1/me/getchildorders?product_code={}&child_order_acceptance_id={}",
            product_code(symbol),
            order_id
        );
        let text = with_retry(&self.read_policy, || self.private_get(&path)).await?;
        let orders: Vec<ChildOrder> = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Network(format!("bad order status response: {}", e)))?;
        match orders.first() {
            Some(order) => Ok(order.to_order_result()),
            None => Ok(OrderResult {
                id: order_id.to_string(),
                status: OrderStatus::Unknown,
                filled: 0.0,
                amount: 0.0,
                average: None,
                price: None,
                cost: 0.0,
                fee: 0.0,
            }),
        }
    }

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, ExchangeError> {
        let text = with_retry(&self.read_policy, || self.private_get("/v1/me/getbalance")).await?;
        let entries: Vec<BalanceEntry> = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Network(format!("bad balance response: {}", e)))?;
        let entry = entries.into_iter().find(|b| b.currency_code == currency);
        Ok(entry
            .map(|b| Balance {
                free: b.available,
                used: b.amount - b.available,
                total: b.amount,
            })
            .unwrap_or_default())
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let path = format!("/v1/ticker?product_code={}", product_code(symbol));
        let text = with_retry(&self.read_policy, || self.public_get(&path)).await?;
        let ticker: TickerResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Network(format!("bad ticker response: {}", e)))?;
        Ok(ticker.ltp)
    }
}

// ==================== Paper exchange ====================

static SIM_ORDER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-process exchange used in test mode: fixed reference prices, a seeded
/// JPY balance, and instant full fills at the reference price.
pub struct PaperExchange {
    prices: Mutex<HashMap<String, f64>>,
    balances: Mutex<HashMap<String, f64>>,
    commission_rate: f64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(200_000.0)
    }
}

impl PaperExchange {
    pub fn new(jpy_balance: f64) -> Self {
        let mut prices = HashMap::new();
        prices.insert("BTC/JPY".to_string(), 12_000_000.0);
        prices.insert("ETH/JPY".to_string(), 500_000.0);
        prices.insert("XRP/JPY".to_string(), 80.0);
        prices.insert("FX_BTC_JPY".to_string(), 12_000_000.0);

        let mut balances = HashMap::new();
        balances.insert("JPY".to_string(), jpy_balance);

        PaperExchange {
            prices: Mutex::new(prices),
            balances: Mutex::new(balances),
            commission_rate: COMMISSION_RATE,
        }
    }

    pub fn set_price(&self, symbol: &Symbol, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, currency: &str, amount: f64) {
        self.balances.lock().unwrap().insert(currency.to_string(), amount);
    }

    fn fill(&self, symbol: &Symbol, amount: f64) -> Result<OrderResult, ExchangeError> {
        validate_order_amount(symbol, amount)?;
        let price = *self
            .prices
            .lock()
            .unwrap()
            .get(symbol.as_str())
            .unwrap_or(&100_000.0);
        let id = format!("SIM-{}", SIM_ORDER_COUNTER.fetch_add(1, Ordering::Relaxed));
        Ok(OrderResult {
            id,
            status: OrderStatus::Filled,
            filled: amount,
            amount,
            average: Some(price),
            price: Some(price),
            cost: price * amount,
            fee: price * amount * self.commission_rate,
        })
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let order = self.fill(symbol, amount)?;
        info!("[paper] market order: {} {} {:.8} @ {:.0}", side, symbol, amount, order.executed_price(0.0));
        Ok(order)
    }

    async fn create_limit_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let mut order = self.fill(symbol, amount)?;
        order.average = Some(price);
        order.price = Some(price);
        info!("[paper] limit order: {} {} {:.8} @ {:.0}", side, symbol, amount, price);
        Ok(order)
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &Symbol,
    ) -> Result<OrderResult, ExchangeError> {
        Ok(OrderResult {
            id: order_id.to_string(),
            status: OrderStatus::Filled,
            filled: 0.0,
            amount: 0.0,
            average: None,
            price: None,
            cost: 0.0,
            fee: 0.0,
        })
    }

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, ExchangeError> {
        let free = *self.balances.lock().unwrap().get(currency).unwrap_or(&0.0);
        Ok(Balance {
            free,
            used: 0.0,
            total: free,
        })
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        Ok(*self
            .prices
            .lock()
            .unwrap()
            .get(symbol.as_str())
            .unwrap_or(&100_000.0))
    }
}
