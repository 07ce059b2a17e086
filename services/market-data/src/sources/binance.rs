use crate::aggregators::fetch_partial;
use crate::normalizers::{normalize_symbol, to_exchange_symbol};
use crate::retry::RetryPolicy;
use crate::types::*;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Per-request timeout for REST calls
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Venue cap on klines per request
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Binance REST client for spot (`/api/v3`) and USD-M futures (`/fapi/v1`)
pub struct BinanceRestSource {
    client: Client,
    base_url: String,
    market: MarketKind,
    retry: RetryPolicy,
}

impl BinanceRestSource {
    /// Client against the public production endpoint for `market`
    pub fn new(market: MarketKind) -> Result<Self> {
        let base_url = match market {
            MarketKind::Spot => SPOT_BASE_URL,
            MarketKind::Derivatives => FUTURES_BASE_URL,
        };
        Self::with_base_url(market, base_url)
    }

    /// Client against the public testnet endpoint for `market`
    pub fn testnet(market: MarketKind) -> Result<Self> {
        let base_url = match market {
            MarketKind::Spot => SPOT_TESTNET_URL,
            MarketKind::Derivatives => FUTURES_TESTNET_URL,
        };
        Self::with_base_url(market, base_url)
    }

    /// Client against a specific base URL (proxies, mocks)
    pub fn with_base_url(market: MarketKind, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| MarketDataError::Api(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            market,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn market(&self) -> MarketKind {
        self.market
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_prefix(&self) -> &'static str {
        match self.market {
            MarketKind::Spot => "/api/v3",
            MarketKind::Derivatives => "/fapi/v1",
        }
    }

    /// Interval actually requested from the venue. Futures have no 1s klines.
    pub fn effective_interval(&self, interval: Interval) -> Interval {
        if self.market == MarketKind::Derivatives && interval == Interval::Second1 {
            warn!("Interval 1s is not supported for derivatives, falling back to 1m");
            return Interval::Minute1;
        }
        interval
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        self.retry
            .run(path, move || async move { self.request_once::<T>(url, query).await })
            .await
    }

    async fn request_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(MarketDataError::RateLimit {
                source_name: "binance".to_string(),
                retry_after,
            });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::Server {
                status: status.as_u16(),
                body,
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // -1121 is Binance's "Invalid symbol"
            if text.contains("-1121") {
                return Err(MarketDataError::SymbolNotFound(text));
            }
            return Err(MarketDataError::Api(format!(
                "Binance API error ({}): {}",
                status, text
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| MarketDataError::InvalidResponse(e.to_string()))
    }

    /// Candles for one canonical symbol, ascending by open time
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        lookback: usize,
    ) -> Result<Vec<Candle>> {
        let venue_interval = self.effective_interval(interval);
        let limit = lookback.clamp(1, MAX_KLINES_PER_REQUEST);
        let path = format!("{}/klines", self.api_prefix());
        let query = [
            ("symbol", to_exchange_symbol(symbol)),
            ("interval", venue_interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];

        let rows: Vec<Vec<serde_json::Value>> = self.get_json(&path, &query).await?;
        let mut candles = rows
            .iter()
            .map(|row| parse_kline(symbol, interval, row))
            .collect::<Result<Vec<_>>>()?;
        candles.sort_by_key(|c| c.ts);

        debug!(
            "Fetched {} {} candles for {} (venue interval {})",
            candles.len(),
            interval,
            symbol,
            venue_interval
        );
        Ok(candles)
    }

    /// Ticker snapshot for one canonical symbol. Futures also pull mark
    /// price, funding and open interest; those extras are best-effort.
    pub async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let venue_symbol = to_exchange_symbol(symbol);
        let query = [("symbol", venue_symbol.clone())];
        let ticker_path = format!("{}/ticker/24hr", self.api_prefix());
        let ticker: Ticker24h = self.get_json(&ticker_path, &query).await?;

        let mut snapshot = MarketSnapshot::new(symbol);
        snapshot.last = parse_opt(&ticker.last_price);
        snapshot.close = parse_opt(&ticker.last_price);
        snapshot.open = parse_opt(&ticker.open_price);
        snapshot.high = parse_opt(&ticker.high_price);
        snapshot.low = parse_opt(&ticker.low_price);
        snapshot.bid = parse_opt(&ticker.bid_price);
        snapshot.ask = parse_opt(&ticker.ask_price);
        snapshot.change_pct = parse_opt(&ticker.price_change_percent);
        snapshot.base_volume = parse_opt(&ticker.volume);
        snapshot.quote_volume = parse_opt(&ticker.quote_volume);

        if self.market == MarketKind::Derivatives {
            let premium_path = format!("{}/premiumIndex", self.api_prefix());
            let oi_path = format!("{}/openInterest", self.api_prefix());
            let (premium, open_interest) = tokio::join!(
                self.get_json::<PremiumIndex>(&premium_path, &query),
                self.get_json::<OpenInterest>(&oi_path, &query),
            );
            match premium {
                Ok(p) => {
                    snapshot.mark_price = parse_opt(&p.mark_price);
                    snapshot.funding_rate = parse_opt(&p.last_funding_rate);
                }
                Err(e) => debug!("No funding data for {}: {}", symbol, e),
            }
            match open_interest {
                Ok(oi) => snapshot.open_interest = parse_opt(&oi.open_interest),
                Err(e) => debug!("No open interest for {}: {}", symbol, e),
            }
        }

        Ok(snapshot)
    }
}

fn map_transport_error(e: reqwest::Error) -> MarketDataError {
    if e.is_timeout() {
        MarketDataError::Timeout(e.to_string())
    } else if e.is_connect() {
        MarketDataError::Connect(e.to_string())
    } else {
        MarketDataError::Api(e.to_string())
    }
}

/// Canonical symbols for the request, dropping anything unparseable
fn canonical_symbols(symbols: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(symbols.len());
    for raw in symbols {
        match normalize_symbol(raw) {
            Some(s) if !out.contains(&s) => out.push(s),
            Some(_) => {}
            None => warn!("Skipping unrecognized symbol {:?}", raw),
        }
    }
    out
}

fn value_to_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::try_from(f).ok()),
        _ => None,
    }
}

fn parse_opt(raw: &Option<String>) -> Option<Decimal> {
    raw.as_deref().and_then(|s| Decimal::from_str(s).ok())
}

/// Kline row: `[open_time, open, high, low, close, volume, ...]`
fn parse_kline(symbol: &str, interval: Interval, row: &[serde_json::Value]) -> Result<Candle> {
    let field = |idx: usize, name: &str| {
        row.get(idx).and_then(value_to_decimal).ok_or_else(|| {
            MarketDataError::InvalidResponse(format!("kline for {} missing {}", symbol, name))
        })
    };

    let ts = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| MarketDataError::InvalidResponse(format!("kline for {} missing open time", symbol)))?;

    Ok(Candle {
        ts,
        symbol: symbol.to_string(),
        interval,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: Option<String>,
    open_price: Option<String>,
    high_price: Option<String>,
    low_price: Option<String>,
    bid_price: Option<String>,
    ask_price: Option<String>,
    price_change_percent: Option<String>,
    volume: Option<String>,
    quote_volume: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: Option<String>,
    last_funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterest {
    open_interest: Option<String>,
}

#[async_trait::async_trait]
impl MarketDataSource for BinanceRestSource {
    async fn get_recent_candles(
        &self,
        symbols: &[String],
        interval: Interval,
        lookback: usize,
    ) -> Result<Vec<Candle>> {
        let symbols = canonical_symbols(symbols);
        let fetched = fetch_partial(self.name(), &symbols, |symbol| async move {
            self.fetch_candles(&symbol, interval, lookback).await
        })
        .await;
        Ok(fetched.into_iter().flat_map(|(_, candles)| candles).collect())
    }

    async fn get_market_snapshot(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, MarketSnapshot>> {
        let symbols = canonical_symbols(symbols);
        let fetched = fetch_partial(self.name(), &symbols, |symbol| async move {
            self.fetch_snapshot(&symbol).await
        })
        .await;
        Ok(fetched
            .into_iter()
            .filter(|(_, snap)| !snap.is_empty())
            .collect())
    }

    fn name(&self) -> &str {
        "binance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kline(ts: i64, close: &str) -> serde_json::Value {
        serde_json::json!([ts, "100.0", "101.0", "99.0", close, "12.5", ts + 59_999, "0", 1, "0", "0", "0"])
    }

    fn source(server: &MockServer, market: MarketKind) -> BinanceRestSource {
        BinanceRestSource::with_base_url(market, &server.uri())
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_spot_candles_sorted_and_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("interval", "1m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                kline(120_000, "100.5"),
                kline(60_000, "100.0"),
            ])))
            .mount(&server)
            .await;

        let src = source(&server, MarketKind::Spot);
        let candles = src
            .get_recent_candles(&["BTC-USDT".to_string()], Interval::Minute1, 2)
            .await
            .unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].ts, 60_000);
        assert_eq!(candles[1].close, Decimal::from_str("100.5").unwrap());
        assert_eq!(candles[0].symbol, "BTC-USDT");
    }

    #[tokio::test]
    async fn test_derivatives_1s_falls_back_to_1m() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/klines"))
            .and(query_param("interval", "1m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([kline(60_000, "100.0")])))
            .expect(1)
            .mount(&server)
            .await;

        let src = source(&server, MarketKind::Derivatives);
        let candles = src
            .get_recent_candles(&["ETH-USDT".to_string()], Interval::Second1, 180)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        // Labelled with the requested interval so the caller's grouping is stable
        assert_eq!(candles[0].interval, Interval::Second1);
    }

    #[tokio::test]
    async fn test_partial_snapshot_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/24hr"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lastPrice": "65000.5",
                "openPrice": "64000",
                "highPrice": "65500",
                "lowPrice": "63900",
                "priceChangePercent": "1.563",
                "volume": "1200",
                "quoteVolume": "78000000"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/24hr"))
            .and(query_param("symbol", "DOGEUSDT"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "markPrice": "65001.0",
                "lastFundingRate": "0.0001"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/openInterest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let src = source(&server, MarketKind::Derivatives);
        let snaps = src
            .get_market_snapshot(&["BTC-USDT".to_string(), "DOGE-USDT".to_string()])
            .await
            .unwrap();

        assert_eq!(snaps.len(), 1);
        let btc = &snaps["BTC-USDT"];
        assert_eq!(btc.last, Some(Decimal::from_str("65000.5").unwrap()));
        assert_eq!(btc.funding_rate, Some(Decimal::from_str("0.0001").unwrap()));
        assert_eq!(btc.open_interest, None);
        assert_eq!(btc.bid, None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/24hr"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let src = source(&server, MarketKind::Spot);
        let err = src.fetch_snapshot("BTC-USDT").await.unwrap_err();
        match err {
            MarketDataError::RateLimit { retry_after, .. } => assert_eq!(retry_after, Some(3)),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_canonical_symbols_dedup() {
        let got = canonical_symbols(&[
            "BTC-USDT".to_string(),
            "btc/usdt".to_string(),
            "???".to_string(),
        ]);
        assert_eq!(got, vec!["BTC-USDT".to_string()]);
    }
}
