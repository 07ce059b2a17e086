use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// OHLCV candle for feature computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds
    pub ts: i64,
    /// Canonical symbol, e.g. "BTC-USDT"
    pub symbol: String,
    pub interval: Interval,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.ts)
    }
}

/// Supported candle intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    Second1,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Second1 => "1s",
            Interval::Minute1 => "1m",
            Interval::Minute3 => "3m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
        }
    }

    pub fn to_millis(&self) -> i64 {
        match self {
            Interval::Second1 => 1_000,
            Interval::Minute1 => 60_000,
            Interval::Minute3 => 180_000,
            Interval::Minute5 => 300_000,
            Interval::Minute15 => 900_000,
            Interval::Minute30 => 1_800_000,
            Interval::Hour1 => 3_600_000,
            Interval::Hour4 => 14_400_000,
            Interval::Day1 => 86_400_000,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1s" => Ok(Interval::Second1),
            "1m" => Ok(Interval::Minute1),
            "3m" => Ok(Interval::Minute3),
            "5m" => Ok(Interval::Minute5),
            "15m" => Ok(Interval::Minute15),
            "30m" => Ok(Interval::Minute30),
            "1h" => Ok(Interval::Hour1),
            "4h" => Ok(Interval::Hour4),
            "1d" => Ok(Interval::Day1),
            other => Err(MarketDataError::Unsupported(format!("interval {}", other))),
        }
    }
}

/// Which side of a venue the source talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Spot,
    #[default]
    Derivatives,
}

/// Latest ticker state for one symbol. Every field is optional because
/// venues differ in what they report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last: Option<Decimal>,
    pub close: Option<Decimal>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    /// 24h change in percent (e.g. 1.5 for +1.5%)
    pub change_pct: Option<Decimal>,
    pub base_volume: Option<Decimal>,
    pub quote_volume: Option<Decimal>,
    pub open_interest: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    /// True when the venue returned nothing usable for this symbol
    pub fn is_empty(&self) -> bool {
        self.last.is_none()
            && self.close.is_none()
            && self.open.is_none()
            && self.high.is_none()
            && self.low.is_none()
            && self.bid.is_none()
            && self.ask.is_none()
            && self.change_pct.is_none()
            && self.base_volume.is_none()
            && self.quote_volume.is_none()
            && self.open_interest.is_none()
            && self.funding_rate.is_none()
            && self.mark_price.is_none()
    }
}

/// Error types for market data retrieval
#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("API request failed: {0}")]
    Api(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Rate limit exceeded for {source_name}")]
    RateLimit {
        source_name: String,
        retry_after: Option<u64>,
    },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl MarketDataError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::Timeout(_)
                | MarketDataError::Connect(_)
                | MarketDataError::Server { .. }
                | MarketDataError::RateLimit { .. }
        )
    }
}

/// Result type for market data operations
pub type Result<T> = std::result::Result<T, MarketDataError>;

/// Trait for market data sources
///
/// Implementations fetch each symbol independently. A failure for one
/// symbol is logged and that symbol is left out of the result; the call
/// only errors when the request itself cannot be formed.
#[async_trait::async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Recent candles for every symbol that could be fetched
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: Interval,
        lookback: usize,
    ) -> Result<Vec<Candle>>;

    /// Latest ticker snapshot keyed by canonical symbol
    async fn get_market_snapshot(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, MarketSnapshot>>;

    /// Source name
    fn name(&self) -> &str;
}
