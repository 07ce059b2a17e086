//! Binance live gateway
//!
//! Signed REST against spot (`/api/v3`) and USD-M futures (`/fapi/v1`,
//! `/fapi/v2`). Every signed call carries `timestamp` and `recvWindow`, and
//! its query string is signed with HMAC-SHA256 using the secret key.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use market_data::{normalize_symbol, split_symbol, to_exchange_symbol, RetryPolicy};
use reqwest::{Client, Method, Url};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{AccountBalance, ExchangePosition, ExecutionGateway, GatewayError, OrderResult, Result};
use crate::config::{ExchangeConfig, MarginMode, MarketType};
use crate::features::extract_price_map;
use crate::types::{FeatureVector, PriceMode, TradeInstruction, TradeSide, TxResult, TxStatus};

type HmacSha256 = Hmac<Sha256>;

const SPOT_BASE_URL: &str = "https://api.binance.com";
const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

const REQUEST_TIMEOUT_SECS: u64 = 10;
const RECV_WINDOW_MS: u64 = 5_000;
const MAX_LEVERAGE: u32 = 125;

/// HMAC-SHA256 of `payload`, hex encoded
pub fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Config(format!("invalid secret key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    #[serde(default)]
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    balance: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesPosition {
    symbol: String,
    position_amt: Decimal,
    #[serde(default)]
    entry_price: Option<Decimal>,
    #[serde(default)]
    mark_price: Option<Decimal>,
    #[serde(default, rename = "unRealizedProfit")]
    unrealized_profit: Option<Decimal>,
    #[serde(default)]
    leverage: Option<Decimal>,
}

/// Live gateway for Binance spot or USD-M futures
pub struct BinanceGateway {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    market_type: MarketType,
    margin_mode: MarginMode,
    retry: RetryPolicy,
    /// Leverage already applied per venue symbol
    leverage_set: Mutex<BTreeMap<String, u32>>,
}

impl BinanceGateway {
    pub fn new(config: &ExchangeConfig, market_type: MarketType) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::Config("binance requires api_key".into()))?;
        let secret_key = config
            .secret_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::Config("binance requires secret_key".into()))?;

        let base_url = match (&config.base_url, market_type.is_spot(), config.testnet) {
            (Some(url), _, _) => url.clone(),
            (None, true, false) => SPOT_BASE_URL.to_string(),
            (None, true, true) => SPOT_TESTNET_URL.to_string(),
            (None, false, false) => FUTURES_BASE_URL.to_string(),
            (None, false, true) => FUTURES_TESTNET_URL.to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            "Binance gateway initialized: market={:?}, testnet={}, url={}",
            market_type, config.testnet, base_url
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
            market_type,
            margin_mode: config.margin_mode,
            retry: RetryPolicy::default(),
            leverage_set: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn is_spot(&self) -> bool {
        self.market_type.is_spot()
    }

    fn order_path(&self) -> &'static str {
        if self.is_spot() {
            "/api/v3/order"
        } else {
            "/fapi/v1/order"
        }
    }

    fn open_orders_path(&self) -> &'static str {
        if self.is_spot() {
            "/api/v3/openOrders"
        } else {
            "/fapi/v1/openOrders"
        }
    }

    /// Signed URL for one attempt; the timestamp is fresh every call
    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| GatewayError::Config(format!("invalid base url: {}", e)))?;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .append_pair("recvWindow", &RECV_WINDOW_MS.to_string())
            .append_pair("timestamp", &timestamp);
        let signature = sign(&self.secret_key, url.query().unwrap_or(""))?;
        url.query_pairs_mut().append_pair("signature", &signature);
        Ok(url)
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = self.signed_url(path, params)?;
        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
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
            return Err(GatewayError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Server {
                status: status.as_u16(),
                body,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // -2011 / -2013: unknown or missing order
            if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
                if err.code == -2011 || err.code == -2013 {
                    return Err(GatewayError::OrderNotFound(err.msg));
                }
            }
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    /// Reads are retried; order placement is attempted once
    async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        self.retry
            .run(path, move || async move {
                self.send_once::<T>(Method::GET, path, params).await
            })
            .await
    }

    /// Margin type and leverage for a derivative symbol, once per value.
    /// Failures are logged and the order proceeds.
    async fn prepare_symbol(&self, venue_symbol: &str, leverage: Option<Decimal>) {
        let Some(target) = leverage
            .and_then(|l| l.round().to_u32())
            .map(|l| l.clamp(1, MAX_LEVERAGE))
        else {
            return;
        };

        let mut applied = self.leverage_set.lock().await;
        if applied.get(venue_symbol) == Some(&target) {
            return;
        }

        if !applied.contains_key(venue_symbol) {
            let margin_type = match self.margin_mode {
                MarginMode::Cross => "CROSSED",
                MarginMode::Isolated => "ISOLATED",
            };
            let params = [
                ("symbol", venue_symbol.to_string()),
                ("marginType", margin_type.to_string()),
            ];
            // -4046 means the margin type is already set
            if let Err(e) = self
                .send_once::<serde_json::Value>(Method::POST, "/fapi/v1/marginType", &params)
                .await
            {
                debug!("Margin type for {} not changed: {}", venue_symbol, e);
            }
        }

        let params = [
            ("symbol", venue_symbol.to_string()),
            ("leverage", target.to_string()),
        ];
        match self
            .send_once::<serde_json::Value>(Method::POST, "/fapi/v1/leverage", &params)
            .await
        {
            Ok(_) => {
                debug!("Leverage for {} set to {}x", venue_symbol, target);
                applied.insert(venue_symbol.to_string(), target);
            }
            Err(e) => warn!("Failed to set leverage {}x for {}: {}", target, venue_symbol, e),
        }
    }

    fn order_params(&self, instruction: &TradeInstruction) -> Vec<(&'static str, String)> {
        let side = match instruction.side {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol", to_exchange_symbol(&instruction.instrument.symbol)),
            ("side", side.to_string()),
            ("quantity", instruction.quantity.normalize().to_string()),
        ];

        match (instruction.price_mode, instruction.limit_price) {
            (PriceMode::Limit, Some(price)) => {
                params.push(("type", "LIMIT".into()));
                params.push(("timeInForce", "GTC".into()));
                params.push(("price", price.normalize().to_string()));
            }
            _ => params.push(("type", "MARKET".into())),
        }

        if self.is_spot() {
            params.push(("newOrderRespType", "FULL".into()));
        } else if instruction.meta.reduce_only {
            params.push(("reduceOnly", "true".into()));
        }
        params
    }

    async fn place(&self, instruction: &TradeInstruction, reference: Option<Decimal>) -> TxResult {
        let venue_symbol = to_exchange_symbol(&instruction.instrument.symbol);
        if !self.is_spot() {
            self.prepare_symbol(&venue_symbol, instruction.leverage).await;
        }

        let params = self.order_params(instruction);
        let order = match self
            .send_once::<OrderResult>(Method::POST, self.order_path(), &params)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!(
                    "Order failed for {} {} {}: {}",
                    instruction.side, instruction.quantity, instruction.instrument.symbol, e
                );
                return TxResult::failed(instruction, TxStatus::Error, e.to_string());
            }
        };

        to_tx_result(instruction, &order, reference)
    }
}

/// Map a venue order onto the instruction it came from
fn to_tx_result(
    instruction: &TradeInstruction,
    order: &OrderResult,
    reference: Option<Decimal>,
) -> TxResult {
    let filled = order.filled();
    let venue_status = order.status.as_deref().unwrap_or("");
    let status = if filled >= instruction.quantity {
        TxStatus::Filled
    } else if filled > Decimal::ZERO
        || matches!(venue_status, "NEW" | "PARTIALLY_FILLED")
    {
        TxStatus::Partial
    } else {
        TxStatus::Rejected
    };

    let avg_price = order.average_price();
    let slippage_bps = match (avg_price, reference) {
        (Some(px), Some(reference)) if reference > Decimal::ZERO => {
            Some(instruction.side.sign() * (px - reference) / reference * Decimal::from(10_000))
        }
        _ => None,
    };

    TxResult {
        instruction_id: instruction.instruction_id.clone(),
        instrument: instruction.instrument.clone(),
        side: instruction.side,
        requested_qty: instruction.quantity,
        filled_qty: filled,
        avg_exec_price: avg_price,
        slippage_bps,
        fee_cost: order.total_fee(),
        leverage: instruction.leverage,
        status,
        reason: (status == TxStatus::Rejected).then(|| format!("order status {}", venue_status)),
        order_id: order.order_id.clone(),
    }
}

fn map_transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else if e.is_connect() {
        GatewayError::Connect(e.to_string())
    } else {
        GatewayError::InvalidResponse(e.to_string())
    }
}

#[async_trait]
impl ExecutionGateway for BinanceGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Result<Vec<TxResult>> {
        let prices = extract_price_map(market_features);
        let mut results = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            if instruction.quantity <= Decimal::ZERO {
                results.push(TxResult::failed(
                    instruction,
                    TxStatus::Rejected,
                    "non-positive quantity",
                ));
                continue;
            }
            let reference = prices.get(&instruction.instrument.symbol).copied();
            let result = self.place(instruction, reference).await;
            info!(
                "Binance {} {} {}: status={}, filled={}",
                instruction.side,
                instruction.quantity,
                instruction.instrument.symbol,
                result.status,
                result.filled_qty
            );
            results.push(result);
        }
        Ok(results)
    }

    async fn fetch_balance(&self) -> Result<AccountBalance> {
        let mut balance = AccountBalance::default();
        if self.is_spot() {
            let account: SpotAccount = self.get("/api/v3/account", &[]).await?;
            for b in account.balances {
                let asset = b.asset.to_uppercase();
                balance.free.insert(asset.clone(), b.free);
                balance.total.insert(asset, b.free + b.locked);
            }
        } else {
            let assets: Vec<FuturesBalance> = self.get("/fapi/v2/balance", &[]).await?;
            for b in assets {
                let asset = b.asset.to_uppercase();
                balance.free.insert(asset.clone(), b.available_balance);
                balance.total.insert(asset, b.balance);
            }
        }
        Ok(balance)
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<ExchangePosition>> {
        if self.is_spot() {
            // Spot holdings are base-asset balances
            let balance = self.fetch_balance().await?;
            return Ok(symbols
                .iter()
                .filter_map(|symbol| {
                    let (base, _) = split_symbol(symbol)?;
                    let qty = balance.total_of(&base);
                    (qty > Decimal::ZERO).then(|| ExchangePosition {
                        symbol: symbol.clone(),
                        quantity: qty,
                        entry_price: None,
                        mark_price: None,
                        unrealized_pnl: None,
                        leverage: None,
                    })
                })
                .collect());
        }

        let raw: Vec<FuturesPosition> = self.get("/fapi/v2/positionRisk", &[]).await?;
        Ok(raw
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .filter_map(|p| {
                let symbol = normalize_symbol(&p.symbol)?;
                (symbols.is_empty() || symbols.contains(&symbol)).then(|| ExchangePosition {
                    symbol,
                    quantity: p.position_amt,
                    entry_price: p.entry_price.filter(|px| *px > Decimal::ZERO),
                    mark_price: p.mark_price.filter(|px| *px > Decimal::ZERO),
                    unrealized_pnl: p.unrealized_profit,
                    leverage: p.leverage,
                })
            })
            .collect())
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResult>> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", to_exchange_symbol(s))])
            .unwrap_or_default();
        let mut orders: Vec<OrderResult> = self.get(self.open_orders_path(), &params).await?;
        for order in &mut orders {
            if let Some(canonical) = order.symbol.as_deref().and_then(normalize_symbol) {
                order.symbol = Some(canonical);
            }
        }
        Ok(orders)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderResult> {
        let params = [
            ("symbol", to_exchange_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        self.send_once(Method::DELETE, self.order_path(), &params).await
    }

    async fn close(&self) -> Result<()> {
        info!("Binance gateway closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "binance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::test_support::{instruction, price_feature};
    use std::str::FromStr;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn gateway(server: &MockServer, market_type: MarketType) -> BinanceGateway {
        let config = ExchangeConfig {
            exchange_id: Some("binance".into()),
            api_key: Some("key".into()),
            secret_key: Some("secret".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        };
        BinanceGateway::new(&config, market_type)
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    #[test]
    fn test_signature_matches_documented_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = ExchangeConfig {
            api_key: Some("key".into()),
            ..Default::default()
        };
        assert!(matches!(
            BinanceGateway::new(&config, MarketType::Swap),
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_futures_reduce_only_market_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/marginType"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 200})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/leverage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"leverage": 3})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "key"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("side", "SELL"))
            .and(query_param("type", "MARKET"))
            .and(query_param("reduceOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 991, "symbol": "BTCUSDT", "status": "FILLED",
                "executedQty": "0.5", "avgPrice": "49900", "cumQuote": "24950"
            })))
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Swap);
        let mut sell = instruction("BTC-USDT", TradeSide::Sell, dec("0.5"));
        sell.leverage = Some(dec("3"));
        sell.meta.reduce_only = true;

        let results = gw
            .execute(&[sell], &[price_feature("BTC-USDT", 50000.0)])
            .await
            .unwrap();
        let r = &results[0];
        assert_eq!(r.status, TxStatus::Filled);
        assert_eq!(r.order_id.as_deref(), Some("991"));
        assert_eq!(r.avg_exec_price, Some(dec("49900")));
        // Sold 100 below the reference: 20 bps adverse
        assert_eq!(r.slippage_bps, Some(dec("20")));
    }

    #[tokio::test]
    async fn test_leverage_failure_does_not_block_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/leverage"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"code":-4028,"msg":"bad"}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 5, "status": "FILLED", "executedQty": "1", "avgPrice": "10"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Swap);
        let mut buy = instruction("SOL-USDT", TradeSide::Buy, dec("1"));
        buy.leverage = Some(dec("5"));
        let results = gw.execute(&[buy], &[]).await.unwrap();
        assert_eq!(results[0].status, TxStatus::Filled);
    }

    #[tokio::test]
    async fn test_spot_order_with_fills() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(query_param("newOrderRespType", "FULL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 12, "symbol": "ETHUSDT", "status": "FILLED",
                "executedQty": "2.00000000", "cummulativeQuoteQty": "6000.00000000",
                "fills": [{"price": "3000", "qty": "2", "commission": "6", "commissionAsset": "USDT"}]
            })))
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Spot);
        let buy = instruction("ETH-USDT", TradeSide::Buy, dec("2"));
        let results = gw.execute(&[buy], &[]).await.unwrap();
        assert_eq!(results[0].avg_exec_price, Some(dec("3000")));
        assert_eq!(results[0].fee_cost, Some(dec("6")));
        assert_eq!(results[0].slippage_bps, None);
    }

    #[tokio::test]
    async fn test_rejected_order_maps_to_error_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"code":-2019,"msg":"Margin is insufficient."}"#),
            )
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Swap);
        let buy = instruction("BTC-USDT", TradeSide::Buy, dec("1"));
        let results = gw.execute(&[buy], &[]).await.unwrap();
        assert_eq!(results[0].status, TxStatus::Error);
        assert!(results[0].reason.as_deref().unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn test_futures_balance_and_positions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"asset": "USDT", "balance": "1200.5", "availableBalance": "800.25"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "positionAmt": "-0.010", "entryPrice": "60000",
                 "markPrice": "59000", "unRealizedProfit": "10", "leverage": "5"},
                {"symbol": "ETHUSDT", "positionAmt": "0", "entryPrice": "0",
                 "markPrice": "3000", "unRealizedProfit": "0", "leverage": "5"}
            ])))
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Swap);
        let balance = gw.fetch_balance().await.unwrap();
        assert_eq!(balance.free_of("USDT"), dec("800.25"));
        assert_eq!(balance.total_of("USDT"), dec("1200.5"));

        let positions = gw.fetch_positions(&[]).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC-USDT");
        assert_eq!(positions[0].quantity, dec("-0.010"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v3/order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"code":-2011,"msg":"Unknown order sent."}"#),
            )
            .mount(&server)
            .await;

        let gw = gateway(&server, MarketType::Spot);
        assert!(matches!(
            gw.cancel_order("BTC-USDT", "7").await,
            Err(GatewayError::OrderNotFound(_))
        ));
    }
}
