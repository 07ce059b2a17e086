//! End-to-end paper trading test harness
//!
//! Validates the full decision loop:
//! market data → features → compose (grid / LLM) → paper fills → portfolio + repository


use mock_sources::{MockLlm, MockMarketSource, RejectingGateway};
use rust_decimal::Decimal;
use std::sync::Arc;
use strategy_agent::{
    config::{ExchangeConfig, MarketType, StrategyType, TradingConfig, TradingMode, UserRequest},
    create_strategy_runtime,
    decision::{LlmComposer, PlanNormalizer},
    features::{extract_market_snapshot_features, DefaultFeaturesPipeline, FeaturesPipeline},
    persistence::StrategyRepository,
    types::{StrategyStatus, TradeSide, TradeType},
    RuntimeOptions,
};

/// Spot paper strategy on BTC with 10k capital
fn spot_request(strategy_type: StrategyType) -> UserRequest {
    UserRequest {
        llm_model_config: Default::default(),
        exchange_config: ExchangeConfig {
            exchange_id: Some("binance".into()),
            trading_mode: TradingMode::Virtual,
            market_type: Some(MarketType::Spot),
            ..Default::default()
        },
        trading_config: TradingConfig {
            strategy_name: Some("harness".into()),
            strategy_type,
            symbols: vec!["BTC-USDT".into()],
            initial_capital: Decimal::from(10_000),
            max_leverage: Decimal::ONE,
            ..Default::default()
        },
    }
}

fn pipeline(source: &Arc<MockMarketSource>, symbols: &[&str]) -> Arc<dyn FeaturesPipeline> {
    Arc::new(DefaultFeaturesPipeline::new(
        source.clone(),
        symbols.iter().map(|s| s.to_string()).collect(),
    ))
}

async fn repository(strategy_id: &str, request: &UserRequest) -> StrategyRepository {
    let repo = StrategyRepository::connect("sqlite::memory:").await.unwrap();
    repo.migrate().await.unwrap();
    repo.upsert_strategy(
        strategy_id,
        "harness",
        StrategyStatus::Running,
        request,
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    repo
}

#[tokio::test]
async fn test_grid_round_trip_on_paper() {
    let request = spot_request(StrategyType::Grid);
    let repo = repository("s-grid", &request).await;
    let source = Arc::new(MockMarketSource::new().with_series("BTC-USDT", &[100.0, 99.0]));

    let mut runtime = create_strategy_runtime(
        request,
        RuntimeOptions {
            strategy_id: Some("s-grid".into()),
            pipeline: Some(pipeline(&source, &["BTC-USDT"])),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // 1% drop over one candle: the grid opens a long
    let opened = runtime.coordinator.run_once().await.unwrap();
    assert_eq!(opened.trades.len(), 1);
    assert_eq!(opened.trades[0].side, TradeSide::Buy);
    assert_eq!(opened.trades[0].trade_type, TradeType::Long);
    assert!(opened.portfolio_view.positions.contains_key("BTC-USDT"));
    assert!(opened.portfolio_view.account_balance < Decimal::from(10_000));
    repo.record_cycle("s-grid", &opened).await.unwrap();
    assert_eq!(repo.latest_holdings("s-grid").await.unwrap().len(), 1);

    // Price rallies well past the average: the whole long is closed
    source.set_series("BTC-USDT", &[99.0, 105.0]);
    let closed = runtime.coordinator.run_once().await.unwrap();
    assert_eq!(closed.cycle_index, 2);
    assert_eq!(closed.trades.len(), 1);
    let exit = &closed.trades[0];
    assert_eq!(exit.side, TradeSide::Sell);
    assert_eq!(exit.quantity, opened.trades[0].quantity);
    assert!(exit.entry_price.is_some());
    assert!(exit.exit_price.is_some());
    assert!(exit.realized_pnl.unwrap() > Decimal::ZERO);
    assert!(closed.portfolio_view.positions.is_empty());
    assert!(closed.strategy_summary.realized_pnl > Decimal::ZERO);
    assert!(closed.digest.total_trades >= 1);
    repo.record_cycle("s-grid", &closed).await.unwrap();

    assert_eq!(repo.list_trade_details("s-grid", 10).await.unwrap().len(), 2);
    assert!(repo.latest_holdings("s-grid").await.unwrap().is_empty());
    assert_eq!(repo.equity_series("s-grid").await.unwrap().len(), 2);

    runtime.coordinator.close().await.unwrap();
}

#[tokio::test]
async fn test_partial_market_data_yields_subset() {
    let source = Arc::new(
        MockMarketSource::new()
            .with_series("BTC-USDT", &[100.0, 101.0, 102.0])
            .with_series("ETH-USDT", &[2000.0, 2010.0]),
    );
    source.fail_symbol("ETH-USDT");

    let result = pipeline(&source, &["BTC-USDT", "ETH-USDT"])
        .build()
        .await
        .unwrap();

    assert!(!result.features.is_empty());
    assert!(result
        .features
        .iter()
        .all(|fv| fv.instrument.symbol == "BTC-USDT"));
    assert_eq!(extract_market_snapshot_features(&result.features).len(), 1);
}

#[tokio::test]
async fn test_snapshot_outage_still_builds_candle_features() {
    let source = Arc::new(MockMarketSource::new().with_series("BTC-USDT", &[100.0, 101.0]));
    source.fail_snapshots();

    let result = pipeline(&source, &["BTC-USDT"]).build().await.unwrap();
    assert!(!result.features.is_empty());
    assert!(extract_market_snapshot_features(&result.features).is_empty());
}

#[tokio::test]
async fn test_llm_plan_executes_on_paper() {
    let request = spot_request(StrategyType::Prompt);
    let source = Arc::new(MockMarketSource::new().with_series("BTC-USDT", &[100.0, 99.0]));
    let llm = Arc::new(MockLlm::replying(
        r#"```json
{"items": [{"instrument": "BTC-USDT", "action": "open_long", "target_qty": 0.5,
  "rationale": "buy the dip"}],
 "rationale": "dip entry"}
```"#,
    ));
    let normalizer = PlanNormalizer::new(MarketType::Spot, request.trading_config.cap_factor)
        .with_default_limits(request.trading_config.max_positions, Decimal::ONE);
    let composer = LlmComposer::new(request.trading_config.clone(), llm.clone(), normalizer);

    let mut runtime = create_strategy_runtime(
        request,
        RuntimeOptions {
            pipeline: Some(pipeline(&source, &["BTC-USDT"])),
            composer: Some(Arc::new(composer)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let result = runtime.coordinator.run_once().await.unwrap();
    assert_eq!(result.rationale.as_deref(), Some("dip entry"));
    assert_eq!(result.instructions.len(), 1);
    assert_eq!(result.instructions[0].side, TradeSide::Buy);
    assert_eq!(result.instructions[0].quantity, Decimal::new(5, 1));
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].note.as_deref(), Some("buy the dip"));

    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("BTC-USDT"));

    // Second cycle: the model has nothing to add
    let idle = runtime.coordinator.run_once().await.unwrap();
    assert!(idle.instructions.is_empty());
    assert!(!idle.rationale.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_rejected_orders_leave_portfolio_untouched() {
    let request = spot_request(StrategyType::Grid);
    let source = Arc::new(MockMarketSource::new().with_series("BTC-USDT", &[100.0, 99.0]));
    let gateway = Arc::new(RejectingGateway::default());

    let mut runtime = create_strategy_runtime(
        request,
        RuntimeOptions {
            pipeline: Some(pipeline(&source, &["BTC-USDT"])),
            gateway: Some(gateway.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let result = runtime.coordinator.run_once().await.unwrap();
    assert_eq!(gateway.calls(), 1);
    assert!(result.instructions.is_empty());
    assert!(result.trades.is_empty());
    let rationale = result.rationale.unwrap();
    assert!(rationale.contains("Execution Warnings"));
    assert!(rationale.contains("insufficient margin"));
    assert_eq!(result.portfolio_view.account_balance, Decimal::from(10_000));
    assert!(result.portfolio_view.positions.is_empty());
}
