//! Execution gateways
//!
//! A gateway turns normalized [`TradeInstruction`]s into [`TxResult`]s,
//! either by simulating fills (paper) or by placing orders on a venue.
//! Venue responses are mapped once, at this boundary, into the typed
//! [`OrderResult`], [`AccountBalance`] and [`ExchangePosition`] structs.

pub mod binance;
pub mod factory;
pub mod paper;

pub use binance::BinanceGateway;
pub use factory::create_execution_gateway;
pub use paper::PaperExecutionGateway;

use async_trait::async_trait;
use market_data::{quote_currency, Transient};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::types::{FeatureVector, PositionSnapshot, TradeInstruction, TradeType, TxResult};

/// Quotes tried when no symbol yields a quote currency
const FALLBACK_QUOTES: &[&str] = &["USDT", "USD", "USDC"];

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway configuration error: {0}")]
    Config(String),

    #[error("Exchange request timed out: {0}")]
    Timeout(String),

    #[error("Failed to connect to exchange: {0}")]
    Connect(String),

    #[error("Exchange server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Exchange rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("Exchange rejected request ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Invalid exchange response: {0}")]
    InvalidResponse(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

impl Transient for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::Connect(_)
                | GatewayError::Server { .. }
                | GatewayError::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Executes trade instructions against a venue or a simulator
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Execute instructions in order. Per-instruction failures come back as
    /// `rejected`/`error` results; `Err` means the whole batch could not run.
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Result<Vec<TxResult>>;

    async fn fetch_balance(&self) -> Result<AccountBalance>;

    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<ExchangePosition>>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResult>>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderResult>;

    /// Release connections and other held resources
    async fn close(&self) -> Result<()>;

    /// Short label for logs ("paper", "binance")
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Normalized venue types
// ---------------------------------------------------------------------------

/// One fill reported inside an order response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub commission: Option<Decimal>,
    #[serde(default, alias = "commissionAsset")]
    pub commission_asset: Option<String>,
}

/// Order as reported by a venue, whichever spelling it uses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    #[serde(default, alias = "orderId", alias = "id", deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(
        default,
        alias = "clientOrderId",
        alias = "client_oid",
        deserialize_with = "de_opt_id"
    )]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "executedQty", alias = "filled")]
    pub executed_qty: Option<Decimal>,
    #[serde(default, alias = "avgPrice", alias = "average")]
    pub avg_price: Option<Decimal>,
    #[serde(default, alias = "cummulativeQuoteQty", alias = "cumQuote")]
    pub cum_quote: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<Decimal>,
    #[serde(default)]
    pub fills: Vec<OrderFill>,
}

impl OrderResult {
    /// Average fill price, derived from the quote total when the venue
    /// reports zero or nothing
    pub fn average_price(&self) -> Option<Decimal> {
        if let Some(px) = self.avg_price.filter(|p| *p > Decimal::ZERO) {
            return Some(px);
        }
        match (self.cum_quote, self.executed_qty) {
            (Some(quote), Some(qty)) if qty > Decimal::ZERO && quote > Decimal::ZERO => {
                Some(quote / qty)
            }
            _ => None,
        }
    }

    /// Reported fee, or the sum of per-fill commissions
    pub fn total_fee(&self) -> Option<Decimal> {
        if self.fee.is_some() {
            return self.fee;
        }
        let commissions: Vec<Decimal> = self.fills.iter().filter_map(|f| f.commission).collect();
        if commissions.is_empty() {
            None
        } else {
            Some(commissions.into_iter().sum())
        }
    }

    pub fn filled(&self) -> Decimal {
        self.executed_qty.unwrap_or(Decimal::ZERO)
    }
}

/// Order ids arrive as numbers on some venues and strings on others
fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Free and total balance per asset (upper-case asset codes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    #[serde(default)]
    pub free: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub total: BTreeMap<String, Decimal>,
}

impl AccountBalance {
    pub fn free_of(&self, asset: &str) -> Decimal {
        self.free.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Total for `asset`, falling back to its free amount
    pub fn total_of(&self, asset: &str) -> Decimal {
        self.total
            .get(asset)
            .copied()
            .unwrap_or_else(|| self.free_of(asset))
    }
}

/// Open position on a venue. `quantity` is signed: >0 long, <0 short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
}

impl ExchangePosition {
    pub fn to_snapshot(&self) -> PositionSnapshot {
        let mut snapshot = PositionSnapshot::new(self.symbol.clone(), self.quantity);
        snapshot.avg_price = self.entry_price;
        snapshot.mark_price = self.mark_price;
        snapshot.unrealized_pnl = self.unrealized_pnl;
        snapshot.leverage = self.leverage;
        snapshot.notional = self.mark_price.map(|px| (px * self.quantity).abs());
        snapshot.trade_type = Some(if self.quantity >= Decimal::ZERO {
            TradeType::Long
        } else {
            TradeType::Short
        });
        snapshot
    }
}

/// Cash available in the quote currencies a strategy trades
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuoteCash {
    pub free: Decimal,
    pub total: Decimal,
}

/// Quote currencies of `symbols`, deduplicated in order of appearance
pub fn quote_currencies(symbols: &[String]) -> Vec<String> {
    let mut quotes: Vec<String> = Vec::new();
    for symbol in symbols {
        if let Some(q) = quote_currency(symbol) {
            if !quotes.contains(&q) {
                quotes.push(q);
            }
        }
    }
    if quotes.is_empty() {
        quotes = FALLBACK_QUOTES.iter().map(|q| q.to_string()).collect();
    }
    quotes
}

/// Sum free and total balances over the quote currencies of `symbols`
pub async fn fetch_free_cash(
    gateway: &dyn ExecutionGateway,
    symbols: &[String],
) -> Result<QuoteCash> {
    let balance = gateway.fetch_balance().await?;
    let quotes = quote_currencies(symbols);

    let cash = quotes.iter().fold(QuoteCash::default(), |acc, q| QuoteCash {
        free: acc.free + balance.free_of(q),
        total: acc.total + balance.total_of(q),
    });

    debug!("Balance assets: {:?}", balance.free.keys().collect::<Vec<_>>());
    info!(
        "Synced balance from {}: free_cash={}, total_cash={}, quotes={:?}",
        gateway.name(),
        cash.free,
        cash.total,
        quotes
    );
    Ok(cash)
}
