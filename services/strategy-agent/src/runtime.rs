//! Runtime factory - wires a coordinator from a strategy request

use anyhow::{Context, Result};
use market_data::{BinanceRestSource, MarketKind};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{ExchangeConfig, MarketType, StrategyType, TradingMode, UserRequest};
use crate::coordinator::{CoordinatorComponents, DecisionCoordinator};
use crate::decision::{Composer, GridComposer, LlmComposer, PlanNormalizer};
use crate::execution::{create_execution_gateway, fetch_free_cash, ExecutionGateway};
use crate::features::{DefaultFeaturesPipeline, FeaturesPipeline};
use crate::history::{InMemoryHistoryRecorder, RollingDigestBuilder};
use crate::llm_client::OpenAiCompatibleClient;
use crate::portfolio::InMemoryPortfolioService;
use crate::types::Constraints;

/// Overrides for [`create_strategy_runtime`]; anything unset is built from
/// the request
#[derive(Default)]
pub struct RuntimeOptions {
    pub strategy_id: Option<String>,
    pub initial_capital: Option<Decimal>,
    pub composer: Option<Arc<dyn Composer>>,
    pub pipeline: Option<Arc<dyn FeaturesPipeline>>,
    pub gateway: Option<Arc<dyn ExecutionGateway>>,
}

/// A ready-to-run strategy
pub struct StrategyRuntime {
    pub strategy_id: String,
    pub request: UserRequest,
    pub coordinator: DecisionCoordinator,
}

fn market_kind(market_type: MarketType) -> MarketKind {
    if market_type.is_spot() {
        MarketKind::Spot
    } else {
        MarketKind::Derivatives
    }
}

/// Public market data endpoint matching the exchange config: an explicit
/// base URL wins, then testnet, then production
fn market_data_source(
    exchange: &ExchangeConfig,
    market_type: MarketType,
) -> market_data::Result<BinanceRestSource> {
    let kind = market_kind(market_type);
    match (&exchange.base_url, exchange.testnet) {
        (Some(url), _) => BinanceRestSource::with_base_url(kind, url),
        (None, true) => BinanceRestSource::testnet(kind),
        (None, false) => BinanceRestSource::new(kind),
    }
}

/// Capital the portfolio starts from. Live strategies use the venue's free
/// quote cash and fall back to the configured value.
async fn resolve_initial_capital(
    request: &UserRequest,
    gateway: &dyn ExecutionGateway,
    strategy_id: &str,
) -> Decimal {
    let configured = request.trading_config.initial_capital;
    if request.exchange_config.trading_mode != TradingMode::Live {
        return configured;
    }

    let capital = match fetch_free_cash(gateway, &request.trading_config.symbols).await {
        Ok(cash) => {
            info!(
                "Live initial capital for {} from {}: free={} total={}",
                strategy_id,
                gateway.name(),
                cash.free,
                cash.total
            );
            cash.free
        }
        Err(e) => {
            warn!(
                "Failed to fetch live balance for {}, using configured capital {}: {}",
                strategy_id, configured, e
            );
            configured
        }
    };
    if capital <= Decimal::ZERO {
        error!(
            "Live strategy {} starts with non-positive capital {}; orders will be rejected",
            strategy_id, capital
        );
    }
    capital
}

fn build_composer(
    request: &UserRequest,
    market_type: MarketType,
) -> Result<Arc<dyn Composer>> {
    let trading = &request.trading_config;
    let normalizer = PlanNormalizer::new(market_type, trading.cap_factor)
        .with_default_limits(trading.max_positions, trading.max_leverage);

    Ok(match trading.strategy_type {
        StrategyType::Prompt => {
            let client = OpenAiCompatibleClient::new(&request.llm_model_config)
                .context("failed to build LLM client")?;
            Arc::new(LlmComposer::new(trading.clone(), Arc::new(client), normalizer))
        }
        StrategyType::Grid => Arc::new(GridComposer::new(
            &trading.symbols,
            request.exchange_config.exchange_id.clone(),
            trading.max_leverage,
            trading.grid.clone(),
            normalizer,
        )),
    })
}

/// Build the gateway, portfolio, pipeline, composer and coordinator for
/// `request`. Gateway configuration errors fail here, before any cycle runs.
pub async fn create_strategy_runtime(
    mut request: UserRequest,
    options: RuntimeOptions,
) -> Result<StrategyRuntime> {
    request
        .canonicalize_symbols()
        .context("invalid strategy request")?;
    request.validate().context("invalid strategy request")?;

    let strategy_id = options
        .strategy_id
        .unwrap_or_else(|| format!("strategy-{}", uuid::Uuid::new_v4()));
    let market_type = request.market_type();
    let trading = &request.trading_config;

    let gateway = match options.gateway {
        Some(gateway) => gateway,
        None => create_execution_gateway(&request.exchange_config, market_type)
            .context("failed to create execution gateway")?,
    };

    let initial_capital = match options.initial_capital {
        Some(capital) => capital,
        None => resolve_initial_capital(&request, gateway.as_ref(), &strategy_id).await,
    };

    let constraints = Constraints {
        max_positions: Some(trading.max_positions),
        max_leverage: Some(trading.max_leverage),
        ..Default::default()
    };
    let portfolio = InMemoryPortfolioService::new(
        initial_capital,
        request.exchange_config.trading_mode,
        market_type,
        constraints,
        strategy_id.clone(),
    );

    let pipeline = match options.pipeline {
        Some(pipeline) => pipeline,
        None => {
            let source = market_data_source(&request.exchange_config, market_type)
                .context("failed to create market data source")?;
            Arc::new(DefaultFeaturesPipeline::new(
                Arc::new(source),
                trading.symbols.clone(),
            ))
        }
    };

    let composer = match options.composer {
        Some(composer) => composer,
        None => build_composer(&request, market_type)?,
    };

    info!(
        "Strategy runtime {} ready: type={:?}, mode={:?}, market={:?}, symbols={:?}, capital={}",
        strategy_id,
        trading.strategy_type,
        request.exchange_config.trading_mode,
        market_type,
        trading.symbols,
        initial_capital
    );

    let components = CoordinatorComponents {
        pipeline,
        composer,
        gateway,
        portfolio: Box::new(portfolio),
        history: Box::new(InMemoryHistoryRecorder::default()),
        digest_builder: Box::new(RollingDigestBuilder::default()),
    };
    let coordinator =
        DecisionCoordinator::new(strategy_id.clone(), request.clone(), initial_capital, components);

    Ok(StrategyRuntime {
        strategy_id,
        request,
        coordinator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeConfig, TradingConfig};
    use crate::execution::PaperExecutionGateway;
    use std::collections::BTreeMap;
    use tokio_test::assert_ok;

    fn grid_request(mode: TradingMode) -> UserRequest {
        UserRequest {
            llm_model_config: Default::default(),
            exchange_config: ExchangeConfig {
                exchange_id: Some("binance".into()),
                trading_mode: mode,
                market_type: Some(MarketType::Spot),
                ..Default::default()
            },
            trading_config: TradingConfig {
                strategy_type: StrategyType::Grid,
                symbols: vec!["BTC-USDT".into()],
                initial_capital: Decimal::from(5_000),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_virtual_runtime_uses_configured_capital() {
        let runtime = assert_ok!(
            create_strategy_runtime(
                grid_request(TradingMode::Virtual),
                RuntimeOptions {
                    strategy_id: Some("s-grid".into()),
                    ..Default::default()
                },
            )
            .await
        );

        assert_eq!(runtime.strategy_id, "s-grid");
        let view = runtime.coordinator.portfolio_view();
        assert_eq!(view.account_balance, Decimal::from(5_000));
    }

    #[tokio::test]
    async fn test_live_runtime_takes_free_cash() {
        let gateway = PaperExecutionGateway::default().with_initial_cash(
            [("USDT".to_string(), Decimal::from(1_234))]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
        );
        let runtime = create_strategy_runtime(
            grid_request(TradingMode::Live),
            RuntimeOptions {
                gateway: Some(Arc::new(gateway)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(runtime.strategy_id.starts_with("strategy-"));
        assert_eq!(
            runtime.coordinator.portfolio_view().account_balance,
            Decimal::from(1_234)
        );
    }

    #[tokio::test]
    async fn test_live_runtime_without_credentials_fails() {
        let result =
            create_strategy_runtime(grid_request(TradingMode::Live), RuntimeOptions::default()).await;
        let err = result.err().unwrap();
        assert!(format!("{:#}", err).contains("api_key"));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let mut request = grid_request(TradingMode::Virtual);
        request.trading_config.symbols.clear();
        assert!(create_strategy_runtime(request, RuntimeOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_runtime_canonicalizes_symbols() {
        let mut request = grid_request(TradingMode::Virtual);
        request.trading_config.symbols = vec!["btc/usdt".into(), "BTCUSDT".into()];
        let runtime = create_strategy_runtime(request, RuntimeOptions::default())
            .await
            .unwrap();

        assert_eq!(runtime.request.trading_config.symbols, vec!["BTC-USDT"]);
        assert_eq!(
            runtime.coordinator.request().trading_config.symbols,
            vec!["BTC-USDT"]
        );
    }

    #[test]
    fn test_market_data_source_follows_exchange_config() {
        let mut exchange = ExchangeConfig::default();
        let prod = market_data_source(&exchange, MarketType::Spot).unwrap();
        assert_eq!(prod.base_url(), "https://api.binance.com");

        exchange.testnet = true;
        let testnet = market_data_source(&exchange, MarketType::Swap).unwrap();
        assert_eq!(testnet.base_url(), "https://testnet.binancefuture.com");
        assert_eq!(testnet.market(), MarketKind::Derivatives);

        exchange.base_url = Some("http://127.0.0.1:9000/".into());
        let custom = market_data_source(&exchange, MarketType::Spot).unwrap();
        assert_eq!(custom.base_url(), "http://127.0.0.1:9000");
    }
}
