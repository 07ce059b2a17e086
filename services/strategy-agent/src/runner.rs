//! Strategy runner - decision loop, task management and process lifecycle

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{AgentSettings, UserRequest};
use crate::features::FeaturesPipeline;
use crate::persistence::StrategyRepository;
use crate::runtime::{create_strategy_runtime, RuntimeOptions, StrategyRuntime};
use crate::types::{StopReason, StrategyStatus, TradeHistoryEntry};

/// Loop settings shared by every runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub close_positions_on_stop: bool,
    pub max_consecutive_failures: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            close_positions_on_stop: false,
            max_consecutive_failures: 5,
        }
    }
}

impl From<&AgentSettings> for RunnerSettings {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            close_positions_on_stop: settings.close_positions_on_stop,
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
        }
    }
}

/// Drives one strategy's decision loop until shutdown or too many failures
pub struct StrategyRunner {
    runtime: StrategyRuntime,
    repo: StrategyRepository,
    settings: RunnerSettings,
}

impl StrategyRunner {
    pub fn new(runtime: StrategyRuntime, repo: StrategyRepository, settings: RunnerSettings) -> Self {
        Self {
            runtime,
            repo,
            settings,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.runtime.strategy_id
    }

    fn metadata(&self) -> serde_json::Value {
        let request = &self.runtime.request;
        serde_json::json!({
            "strategy_type": request.trading_config.strategy_type,
            "market_type": request.market_type(),
            "trading_mode": request.exchange_config.trading_mode,
            "symbols": request.trading_config.symbols,
        })
    }

    /// Record the exits placed on stop and the holdings they leave behind
    async fn persist_close(&self, strategy_id: &str, trades: &[TradeHistoryEntry]) {
        if !trades.is_empty() {
            if let Err(e) = self.repo.append_trade_details(strategy_id, trades).await {
                error!("Failed to persist closing trades for {}: {}", strategy_id, e);
            }
        }
        let view = self.runtime.coordinator.portfolio_view();
        if let Err(e) = self.repo.record_holdings(strategy_id, &view).await {
            error!("Failed to persist holdings for {}: {}", strategy_id, e);
        }
    }

    /// Run cycles every `decide_interval` until `shutdown` flips to true.
    /// A dropped sender ends the loop as a normal exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<StopReason> {
        let strategy_id = self.runtime.strategy_id.clone();
        let name = self
            .runtime
            .request
            .trading_config
            .strategy_name
            .clone()
            .unwrap_or_else(|| strategy_id.clone());

        self.repo
            .upsert_strategy(
                &strategy_id,
                &name,
                StrategyStatus::Running,
                &self.runtime.request,
                &self.metadata(),
            )
            .await?;

        let every = self.runtime.request.trading_config.decide_every();
        info!("Strategy {} starting decision loop (every {:?})", strategy_id, every);
        let mut ticker = interval(every);
        let mut failures = 0u32;

        let mut reason = loop {
            if *shutdown.borrow() {
                break StopReason::Cancelled;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => break StopReason::Cancelled,
                        Ok(()) => continue,
                        Err(_) => break StopReason::NormalExit,
                    }
                }
            }

            match self.runtime.coordinator.run_once().await {
                Ok(result) => {
                    failures = 0;
                    info!(
                        "Strategy {} cycle {}: {} instructions, {} trades, equity={:?}",
                        strategy_id,
                        result.cycle_index,
                        result.instructions.len(),
                        result.trades.len(),
                        result.strategy_summary.total_value
                    );
                    if let Err(e) = self.repo.record_cycle(&strategy_id, &result).await {
                        error!("Failed to persist cycle for {}: {}", strategy_id, e);
                    }
                }
                Err(e) => {
                    failures += 1;
                    error!(
                        "Strategy {} cycle failed ({}/{}): {:#}",
                        strategy_id, failures, self.settings.max_consecutive_failures, e
                    );
                    if failures >= self.settings.max_consecutive_failures {
                        break StopReason::Error;
                    }
                }
            }
        };

        if self.settings.close_positions_on_stop {
            let trades = match self.runtime.coordinator.close_all_positions().await {
                Ok(trades) => {
                    info!("Strategy {} closed {} positions", strategy_id, trades.len());
                    trades
                }
                Err(e) => {
                    error!("Failed to close positions for {}: {:#}", strategy_id, e);
                    reason = StopReason::ErrorClosingPositions;
                    Vec::new()
                }
            };
            self.persist_close(&strategy_id, &trades).await;
        }

        if let Err(e) = self
            .repo
            .set_status(&strategy_id, StrategyStatus::Stopped, Some(reason))
            .await
        {
            error!("Failed to mark {} stopped: {}", strategy_id, e);
        }
        if let Err(e) = self.runtime.coordinator.close().await {
            warn!("Strategy {}: {:#}", strategy_id, e);
        }

        info!("Strategy {} stopped ({})", strategy_id, reason.as_str());
        Ok(reason)
    }
}

struct RunningStrategy {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<StopReason>>,
}

/// Runs strategies as independent tokio tasks
pub struct StrategyManager {
    repo: StrategyRepository,
    settings: RunnerSettings,
    pipeline: Option<Arc<dyn FeaturesPipeline>>,
    running: Mutex<HashMap<String, RunningStrategy>>,
}

impl StrategyManager {
    pub fn new(repo: StrategyRepository, settings: RunnerSettings) -> Self {
        Self {
            repo,
            settings,
            pipeline: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Feature pipeline for strategies started without their own
    pub fn with_pipeline(mut self, pipeline: Arc<dyn FeaturesPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn repository(&self) -> &StrategyRepository {
        &self.repo
    }

    /// Build a runtime for `request` and spawn its loop. Returns the
    /// strategy id.
    pub async fn start(&self, request: UserRequest, mut options: RuntimeOptions) -> Result<String> {
        if options.pipeline.is_none() {
            options.pipeline = self.pipeline.clone();
        }
        if let Some(id) = options.strategy_id.as_deref() {
            if self.is_running(id).await {
                return Err(anyhow!("strategy {} is already running", id));
            }
        }

        let runtime = create_strategy_runtime(request, options).await?;
        let strategy_id = runtime.strategy_id.clone();
        let runner = StrategyRunner::new(runtime, self.repo.clone(), self.settings);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));

        self.running
            .lock()
            .await
            .insert(strategy_id.clone(), RunningStrategy { shutdown, handle });
        info!("Strategy {} started", strategy_id);
        Ok(strategy_id)
    }

    /// Whether a task for `strategy_id` is still alive
    pub async fn is_running(&self, strategy_id: &str) -> bool {
        self.running
            .lock()
            .await
            .get(strategy_id)
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn running_ids(&self) -> Vec<String> {
        let running = self.running.lock().await;
        let mut ids: Vec<String> = running
            .iter()
            .filter(|(_, s)| !s.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Signal one strategy and wait for its loop to finish
    pub async fn stop(&self, strategy_id: &str) -> Result<StopReason> {
        let entry = self
            .running
            .lock()
            .await
            .remove(strategy_id)
            .ok_or_else(|| anyhow!("strategy {} is not running", strategy_id))?;
        Self::join(strategy_id, entry).await
    }

    /// Signal every strategy and wait for all of them
    pub async fn shutdown(&self) -> Vec<(String, Result<StopReason>)> {
        let entries: Vec<(String, RunningStrategy)> = self.running.lock().await.drain().collect();
        info!("Stopping {} strategies", entries.len());
        let mut outcomes = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            let outcome = Self::join(&id, entry).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    async fn join(strategy_id: &str, entry: RunningStrategy) -> Result<StopReason> {
        // The task may already be gone
        let _ = entry.shutdown.send(true);
        match entry.handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow!("strategy {} task failed: {}", strategy_id, e)),
        }
    }
}

/// Process-wide lifecycle state
#[derive(Debug, Default)]
pub struct Lifecycle {
    autoresumed: AtomicBool,
    shutting_down: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only
    pub fn try_begin_autoresume(&self) -> bool {
        !self.autoresumed.swap(true, Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Restart every strategy persisted as running. Runs at most once per
/// lifecycle; returns how many strategies were started.
pub async fn autoresume(
    lifecycle: &Lifecycle,
    repo: &StrategyRepository,
    manager: &StrategyManager,
) -> Result<usize> {
    if !lifecycle.try_begin_autoresume() {
        debug!("Autoresume already ran, skipping");
        return Ok(0);
    }
    if lifecycle.is_shutting_down() {
        info!("Shutdown in progress, skipping autoresume");
        return Ok(0);
    }

    let strategies = repo.list_strategies(Some(StrategyStatus::Running)).await?;
    info!("Autoresume: {} running strategies found", strategies.len());

    let mut started = 0;
    for record in strategies {
        let id = record.strategy_id.clone();
        if manager.is_running(&id).await {
            debug!("Strategy {} already running, not resuming", id);
            continue;
        }
        let request = match record.request() {
            Ok(request) => request,
            Err(e) => {
                error!("Cannot resume {}: stored config is unreadable: {}", id, e);
                if let Err(e) = repo
                    .set_status(&id, StrategyStatus::Stopped, Some(StopReason::Error))
                    .await
                {
                    warn!("Failed to mark {} stopped: {}", id, e);
                }
                continue;
            }
        };

        let options = RuntimeOptions {
            strategy_id: Some(id.clone()),
            ..Default::default()
        };
        match manager.start(request, options).await {
            Ok(_) => {
                info!("Resumed strategy {}", id);
                started += 1;
            }
            Err(e) => {
                error!("Failed to resume strategy {}: {:#}", id, e);
                if let Err(e) = repo
                    .set_status(&id, StrategyStatus::Stopped, Some(StopReason::Error))
                    .await
                {
                    warn!("Failed to mark {} stopped: {}", id, e);
                }
            }
        }
    }
    Ok(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeConfig, MarketType, StrategyType, TradingConfig, TradingMode};
    use crate::coordinator::CLOSE_ALL_RATIONALE;
    use crate::decision::test_support::{instruction, price_feature};
    use crate::decision::Composer;
    use crate::features::FeaturesPipelineResult;
    use crate::types::{ComposeContext, ComposeResult, TradeSide};
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct FixedPricePipeline;

    #[async_trait::async_trait]
    impl FeaturesPipeline for FixedPricePipeline {
        async fn build(&self) -> Result<FeaturesPipelineResult> {
            Ok(FeaturesPipelineResult {
                features: vec![price_feature("BTC-USDT", 100.0)],
            })
        }
    }

    struct FailingPipeline;

    #[async_trait::async_trait]
    impl FeaturesPipeline for FailingPipeline {
        async fn build(&self) -> Result<FeaturesPipelineResult> {
            Err(anyhow!("market data unavailable"))
        }
    }

    fn grid_request() -> UserRequest {
        UserRequest {
            llm_model_config: Default::default(),
            exchange_config: ExchangeConfig {
                market_type: Some(MarketType::Spot),
                trading_mode: TradingMode::Virtual,
                ..Default::default()
            },
            trading_config: TradingConfig {
                strategy_type: StrategyType::Grid,
                symbols: vec!["BTC-USDT".into()],
                initial_capital: Decimal::from(10_000),
                decide_interval: 1,
                ..Default::default()
            },
        }
    }

    async fn repo() -> StrategyRepository {
        let repo = StrategyRepository::connect("sqlite::memory:").await.unwrap();
        repo.migrate().await.unwrap();
        repo
    }

    async fn runner(
        repo: &StrategyRepository,
        pipeline: Arc<dyn FeaturesPipeline>,
        settings: RunnerSettings,
    ) -> StrategyRunner {
        let runtime = create_strategy_runtime(
            grid_request(),
            RuntimeOptions {
                strategy_id: Some("s-run".into()),
                pipeline: Some(pipeline),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        StrategyRunner::new(runtime, repo.clone(), settings)
    }

    #[tokio::test]
    async fn test_runner_persists_cycles_and_stops_on_signal() {
        let repo = repo().await;
        let runner = runner(&repo, Arc::new(FixedPricePipeline), RunnerSettings::default()).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        let reason = handle.await.unwrap().unwrap();

        assert_eq!(reason, StopReason::Cancelled);
        let record = repo.get_strategy("s-run").await.unwrap().unwrap();
        assert_eq!(record.status, StrategyStatus::Stopped);
        assert_eq!(record.stop_reason, Some(StopReason::Cancelled));
        assert_eq!(record.request().unwrap(), grid_request());
        assert!(repo.latest_portfolio_snapshot("s-run").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_runner_stops_after_consecutive_failures() {
        let repo = repo().await;
        let settings = RunnerSettings {
            close_positions_on_stop: true,
            max_consecutive_failures: 1,
        };
        let runner = runner(&repo, Arc::new(FailingPipeline), settings).await;
        let (_tx, rx) = watch::channel(false);

        let reason = runner.run(rx).await.unwrap();
        assert_eq!(reason, StopReason::Error);
        let record = repo.get_strategy("s-run").await.unwrap().unwrap();
        assert_eq!(record.stop_reason, Some(StopReason::Error));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_normal_exit() {
        let repo = repo().await;
        let runner = runner(&repo, Arc::new(FixedPricePipeline), RunnerSettings::default()).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::NormalExit);
    }

    #[test]
    fn test_lifecycle_autoresume_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.try_begin_autoresume());
        assert!(!lifecycle.try_begin_autoresume());
        assert!(!lifecycle.is_shutting_down());
        lifecycle.begin_shutdown();
        assert!(lifecycle.is_shutting_down());
    }

    #[tokio::test]
    async fn test_autoresume_restarts_running_strategies_once() {
        let repo = repo().await;
        repo.upsert_strategy(
            "s-resume",
            "resume me",
            StrategyStatus::Running,
            &grid_request(),
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        repo.upsert_strategy(
            "s-idle",
            "stopped one",
            StrategyStatus::Running,
            &grid_request(),
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        repo.set_status("s-idle", StrategyStatus::Stopped, Some(StopReason::NormalExit))
            .await
            .unwrap();

        let manager = StrategyManager::new(repo.clone(), RunnerSettings::default())
            .with_pipeline(Arc::new(FixedPricePipeline));
        let lifecycle = Lifecycle::new();

        assert_eq!(autoresume(&lifecycle, &repo, &manager).await.unwrap(), 1);
        assert_eq!(manager.running_ids().await, vec!["s-resume".to_string()]);
        assert_eq!(autoresume(&lifecycle, &repo, &manager).await.unwrap(), 0);

        let outcomes = manager.shutdown().await;
        assert_eq!(outcomes.len(), 1);
        assert!(manager.running_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_manager_rejects_duplicate_start() {
        let repo = repo().await;
        let manager = StrategyManager::new(repo, RunnerSettings::default());
        let options = || RuntimeOptions {
            strategy_id: Some("s-dup".into()),
            pipeline: Some(Arc::new(FixedPricePipeline)),
            ..Default::default()
        };
        manager.start(grid_request(), options()).await.unwrap();
        assert!(manager.start(grid_request(), options()).await.is_err());
        assert_eq!(manager.stop("s-dup").await.unwrap(), StopReason::Cancelled);
    }

    /// Buys one BTC on the first cycle, then idles
    struct BuyOnceComposer {
        done: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Composer for BuyOnceComposer {
        async fn compose(&self, _context: &ComposeContext) -> ComposeResult {
            let instructions = if self.done.swap(true, Ordering::SeqCst) {
                Vec::new()
            } else {
                vec![instruction("BTC-USDT", TradeSide::Buy, Decimal::ONE)]
            };
            ComposeResult {
                instructions,
                rationale: Some("buy once".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_close_on_stop_persists_exit_and_holdings() {
        let repo = repo().await;
        let runtime = create_strategy_runtime(
            grid_request(),
            RuntimeOptions {
                strategy_id: Some("s-close".into()),
                pipeline: Some(Arc::new(FixedPricePipeline)),
                composer: Some(Arc::new(BuyOnceComposer {
                    done: AtomicBool::new(false),
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let settings = RunnerSettings {
            close_positions_on_stop: true,
            ..Default::default()
        };
        let runner = StrategyRunner::new(runtime, repo.clone(), settings);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(repo.latest_holdings("s-close").await.unwrap().len(), 1);
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), StopReason::Cancelled);

        assert!(repo.latest_holdings("s-close").await.unwrap().is_empty());
        let details = repo.list_trade_details("s-close", 10).await.unwrap();
        assert_eq!(details.len(), 2);
        assert!(details
            .iter()
            .any(|d| d.side == TradeSide::Sell && d.note.as_deref() == Some(CLOSE_ALL_RATIONALE)));
    }
}
