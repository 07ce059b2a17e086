//! Gateway construction from exchange configuration

use std::sync::Arc;
use tracing::info;

use super::{BinanceGateway, ExecutionGateway, GatewayError, PaperExecutionGateway, Result};
use crate::config::{ExchangeConfig, MarketType, TradingMode};

/// Exchanges that authenticate with a passphrase on top of key and secret
const PASSPHRASE_EXCHANGES: &[&str] = &["okx", "weex", "kucoin", "bitget"];

/// Exchanges with a live gateway in this crate
const SUPPORTED_LIVE_EXCHANGES: &[&str] = &["binance"];

fn has_value(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Build the gateway for `config`. Live mode fails fast on missing
/// credentials or an exchange without a live gateway.
pub fn create_execution_gateway(
    config: &ExchangeConfig,
    market_type: MarketType,
) -> Result<Arc<dyn ExecutionGateway>> {
    match config.trading_mode {
        TradingMode::Virtual => {
            info!("Using paper execution gateway (fee_bps={})", config.fee_bps);
            Ok(Arc::new(PaperExecutionGateway::new(config.fee_bps)))
        }
        TradingMode::Live => {
            let exchange_id = config
                .exchange_id
                .as_deref()
                .map(|id| id.trim().to_lowercase())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    GatewayError::Config(
                        "exchange_id is required for live trading mode (e.g. 'binance')".into(),
                    )
                })?;

            if !has_value(&config.api_key) || !has_value(&config.secret_key) {
                return Err(GatewayError::Config(format!(
                    "API credentials are required for live trading on {}: provide api_key and secret_key",
                    exchange_id
                )));
            }

            if PASSPHRASE_EXCHANGES.contains(&exchange_id.as_str()) && !has_value(&config.passphrase) {
                return Err(GatewayError::Config(format!(
                    "{} requires a passphrase for authentication",
                    exchange_id
                )));
            }

            if !SUPPORTED_LIVE_EXCHANGES.contains(&exchange_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "unsupported exchange for live trading: {}",
                    exchange_id
                )));
            }

            info!(
                "Using live {} gateway (market={:?}, testnet={})",
                exchange_id, market_type, config.testnet
            );
            Ok(Arc::new(BinanceGateway::new(config, market_type)?))
        }
    }
}
