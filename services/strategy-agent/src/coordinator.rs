//! Decision coordinator - one compose/execute/record cycle per call
//!
//! The coordinator owns a strategy's portfolio and history. `run_once`
//! takes `&mut self`, so two cycles of one strategy can never overlap.

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{MarketType, TradingMode, UserRequest};
use crate::decision::{quantity_precision, Composer};
use crate::execution::{fetch_free_cash, ExecutionGateway};
use crate::features::{extract_market_snapshot_features, FeaturesPipeline};
use crate::history::{latest_open_trade, DigestBuilder, HistoryRecorder};
use crate::portfolio::PortfolioService;
use crate::types::{
    ComposeContext, DecisionCycleResult, FeatureVector, HistoryPayload, HistoryRecord,
    InstructionMeta, PortfolioView, PositionSnapshot, PriceMode, StrategyStatus, StrategySummary,
    TradeDecisionAction, TradeHistoryEntry, TradeInstruction, TradeSide, TradeType, TxResult,
};

/// Rationale attached to the orders placed when a strategy stops
pub const CLOSE_ALL_RATIONALE: &str = "Strategy stopped: closing all positions";

/// Everything a coordinator drives
pub struct CoordinatorComponents {
    pub pipeline: Arc<dyn FeaturesPipeline>,
    pub composer: Arc<dyn Composer>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub portfolio: Box<dyn PortfolioService>,
    pub history: Box<dyn HistoryRecorder>,
    pub digest_builder: Box<dyn DigestBuilder>,
}

pub struct DecisionCoordinator {
    strategy_id: String,
    request: UserRequest,
    market_type: MarketType,
    initial_capital: Decimal,
    pipeline: Arc<dyn FeaturesPipeline>,
    composer: Arc<dyn Composer>,
    gateway: Arc<dyn ExecutionGateway>,
    portfolio: Box<dyn PortfolioService>,
    history: Box<dyn HistoryRecorder>,
    digest_builder: Box<dyn DigestBuilder>,
    cycle_index: u64,
    /// Snapshot features of the latest cycle, used to price closing orders
    last_market_features: Vec<FeatureVector>,
}

/// Position of one symbol as fills of a batch are folded in
#[derive(Debug, Clone, Default)]
struct RunningLeg {
    qty: Decimal,
    avg_price: Option<Decimal>,
    entry_ts: Option<i64>,
    leverage: Option<Decimal>,
}

impl RunningLeg {
    fn from_snapshot(pos: &PositionSnapshot) -> Self {
        Self {
            qty: pos.quantity,
            avg_price: pos.avg_price,
            entry_ts: pos.entry_ts,
            leverage: pos.leverage,
        }
    }

    fn apply(
        &mut self,
        side: TradeSide,
        qty: Decimal,
        price: Option<Decimal>,
        ts: i64,
        leverage: Option<Decimal>,
    ) {
        let eps = quantity_precision();
        let delta = side.sign() * qty;
        let next = self.qty + delta;
        if next.abs() <= eps {
            *self = Self::default();
            return;
        }

        let flat = self.qty.abs() <= eps;
        if flat || (self.qty > Decimal::ZERO) == (delta > Decimal::ZERO) {
            self.avg_price = match (self.avg_price, price) {
                (Some(avg), Some(px)) if !flat => Some((avg * self.qty.abs() + px * qty) / next.abs()),
                (avg, px) => px.or(avg),
            };
            if flat {
                self.entry_ts = Some(ts);
                self.leverage = leverage;
            }
        } else if (next > Decimal::ZERO) != (self.qty > Decimal::ZERO) {
            self.avg_price = price;
            self.entry_ts = Some(ts);
            self.leverage = leverage;
        }
        self.qty = next;
    }
}

/// The part of a fill one trade entry records
struct FillLeg<'a> {
    tx: &'a TxResult,
    qty: Decimal,
    price: Option<Decimal>,
    fee: Decimal,
    note: Option<String>,
}

impl DecisionCoordinator {
    pub fn new(
        strategy_id: impl Into<String>,
        request: UserRequest,
        initial_capital: Decimal,
        components: CoordinatorComponents,
    ) -> Self {
        let market_type = request.market_type();
        Self {
            strategy_id: strategy_id.into(),
            request,
            market_type,
            initial_capital,
            pipeline: components.pipeline,
            composer: components.composer,
            gateway: components.gateway,
            portfolio: components.portfolio,
            history: components.history,
            digest_builder: components.digest_builder,
            cycle_index: 0,
            last_market_features: Vec::new(),
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn request(&self) -> &UserRequest {
        &self.request
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    pub fn portfolio_view(&self) -> PortfolioView {
        self.portfolio.get_view()
    }

    pub fn history(&self) -> &[HistoryRecord] {
        self.history.records()
    }

    fn is_live(&self) -> bool {
        self.request.exchange_config.trading_mode == TradingMode::Live
    }

    fn symbols(&self) -> &[String] {
        &self.request.trading_config.symbols
    }

    /// Pull cash and positions from the venue, returning the free quote
    /// cash. Failures keep the cached view.
    async fn sync_live_account(&mut self) -> Option<Decimal> {
        let cash = match fetch_free_cash(self.gateway.as_ref(), self.symbols()).await {
            Ok(cash) => cash,
            Err(e) => {
                warn!(
                    "Failed to sync balance for {}, using cached portfolio view: {}",
                    self.strategy_id, e
                );
                return None;
            }
        };
        if cash.free.is_zero() && cash.total.is_zero() {
            warn!(
                "Balance sync for {} returned zero free and total cash; the strategy may not be able to trade",
                self.strategy_id
            );
        }

        let balance = if self.market_type.is_spot() {
            cash.free
        } else {
            cash.total
        };
        self.portfolio.sync_cash(balance);

        match self.gateway.fetch_positions(self.symbols()).await {
            Ok(positions) => {
                info!("Synced {} positions from {}", positions.len(), self.gateway.name());
                self.portfolio
                    .sync_positions(positions.iter().map(|p| p.to_snapshot()).collect());
            }
            Err(e) => warn!(
                "Failed to sync positions for {}, using cached positions: {}",
                self.strategy_id, e
            ),
        }
        Some(cash.free)
    }

    /// Portfolio view handed to the composer
    async fn cycle_view(&mut self) -> PortfolioView {
        let synced = if self.is_live() {
            self.sync_live_account().await
        } else {
            None
        };

        let mut view = self.portfolio.get_view();
        if let Some(free) = synced {
            if self.market_type.is_spot() {
                view.account_balance = free;
                view.buying_power = Some(free.max(Decimal::ZERO));
            } else {
                view.buying_power = Some(free);
            }
            view.free_cash = Some(free);
        }
        if !self.is_live() && self.market_type.is_spot() {
            view.buying_power = Some(view.account_balance.max(Decimal::ZERO));
        }
        view
    }

    /// Run one full decision cycle
    pub async fn run_once(&mut self) -> Result<DecisionCycleResult> {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let compose_id = format!("compose-{}", uuid::Uuid::new_v4());

        let portfolio = self.cycle_view().await;

        let pipeline_result = self
            .pipeline
            .build()
            .await
            .context("feature pipeline failed")?;
        let features = pipeline_result.features;
        let market_features = extract_market_snapshot_features(&features);
        let digest = self.digest_builder.build(self.history.records());

        let context = ComposeContext {
            ts: timestamp_ms,
            compose_id: compose_id.clone(),
            strategy_id: self.strategy_id.clone(),
            features,
            portfolio,
            digest,
        };

        let compose_result = self.composer.compose(&context).await;
        let mut instructions = compose_result.instructions;
        let mut rationale = compose_result.rationale;
        info!(
            "Composer returned {} instructions for {}",
            instructions.len(),
            self.strategy_id
        );
        for (idx, inst) in instructions.iter().enumerate() {
            debug!(
                "Instruction {}: {} {} qty={}",
                idx, inst.instrument.symbol, inst.side, inst.quantity
            );
        }

        let tx_results = self
            .gateway
            .execute(&instructions, &market_features)
            .await
            .with_context(|| format!("{} gateway failed to execute", self.gateway.name()))?;
        info!(
            "Gateway returned {} results: [{}]",
            tx_results.len(),
            tx_results
                .iter()
                .map(|tx| tx.status.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let failures: Vec<&TxResult> = tx_results.iter().filter(|tx| tx.status.is_failure()).collect();
        if !failures.is_empty() {
            let lines: Vec<String> = failures
                .iter()
                .map(|tx| {
                    let msg = format!(
                        "Skipped {} {} qty={}: {}",
                        tx.instrument.symbol,
                        tx.side,
                        tx.requested_qty,
                        tx.reason.as_deref().unwrap_or("Unknown error")
                    );
                    warn!("Order rejected: {}", msg);
                    format!("- {}", msg)
                })
                .collect();
            rationale = Some(format!(
                "{}\n\nExecution Warnings:\n{}",
                rationale.unwrap_or_default(),
                lines.join("\n")
            ));
            let failed_ids: Vec<&str> = failures.iter().map(|tx| tx.instruction_id.as_str()).collect();
            instructions.retain(|inst| !failed_ids.contains(&inst.instruction_id.as_str()));
        }

        let trades = self.create_trades(&tx_results, &instructions, &compose_id, timestamp_ms);
        self.portfolio.apply_trades(&trades, &market_features);
        let summary = self.build_summary(timestamp_ms);

        let history_records = vec![
            HistoryRecord {
                ts: timestamp_ms,
                reference_id: compose_id.clone(),
                payload: HistoryPayload::Features {
                    features: context.features,
                },
            },
            HistoryRecord {
                ts: timestamp_ms,
                reference_id: compose_id.clone(),
                payload: HistoryPayload::Compose {
                    summary: summary.clone(),
                },
            },
            HistoryRecord {
                ts: timestamp_ms,
                reference_id: compose_id.clone(),
                payload: HistoryPayload::Instructions {
                    instructions: instructions.clone(),
                },
            },
            HistoryRecord {
                ts: timestamp_ms,
                reference_id: compose_id.clone(),
                payload: HistoryPayload::Execution {
                    trades: trades.clone(),
                },
            },
        ];
        for record in &history_records {
            self.history.record(record.clone());
        }

        let digest = self.digest_builder.build(self.history.records());
        self.cycle_index += 1;
        self.last_market_features = market_features;

        Ok(DecisionCycleResult {
            compose_id,
            timestamp_ms,
            cycle_index: self.cycle_index,
            rationale,
            strategy_summary: summary,
            instructions,
            trades,
            history_records,
            digest,
            portfolio_view: self.portfolio.get_view(),
        })
    }

    /// Turn fills into trade history entries, pairing closes with the
    /// position they close. Fills are folded into a running leg per symbol,
    /// so later fills of a batch see the position left by earlier ones.
    fn create_trades(
        &mut self,
        tx_results: &[TxResult],
        instructions: &[TradeInstruction],
        compose_id: &str,
        timestamp_ms: i64,
    ) -> Vec<TradeHistoryEntry> {
        let pre_view = self.portfolio.get_view();
        let notes: HashMap<&str, &str> = instructions
            .iter()
            .filter_map(|i| {
                i.meta
                    .rationale
                    .as_deref()
                    .map(|r| (i.instruction_id.as_str(), r))
            })
            .collect();
        let eps = quantity_precision();
        let mut legs: HashMap<String, RunningLeg> = HashMap::new();
        let mut trades = Vec::new();

        for tx in tx_results {
            if tx.status.is_failure() || tx.filled_qty <= Decimal::ZERO {
                continue;
            }
            let symbol = &tx.instrument.symbol;
            let prev = legs.get(symbol).cloned().unwrap_or_else(|| {
                pre_view
                    .positions
                    .get(symbol)
                    .map(RunningLeg::from_snapshot)
                    .unwrap_or_default()
            });

            let qty = tx.filled_qty;
            let price = tx.avg_exec_price.filter(|p| *p > Decimal::ZERO);
            let fee = tx.fee_cost.unwrap_or(Decimal::ZERO);
            let note = notes.get(tx.instruction_id.as_str()).map(|n| n.to_string());

            let closing_type = match tx.side {
                TradeSide::Sell if prev.qty > eps => Some(TradeType::Long),
                TradeSide::Buy if prev.qty < -eps => Some(TradeType::Short),
                _ => None,
            };
            let held = prev.qty.abs();
            let close_units = if closing_type.is_some() {
                qty.min(held)
            } else {
                Decimal::ZERO
            };
            let is_full_close = closing_type.is_some() && close_units >= held - eps;

            match closing_type {
                Some(direction) if is_full_close => {
                    // Anything past zero opens the opposite side
                    let remainder = qty - close_units;
                    let flips = remainder > eps;
                    let close_fee = if flips { fee * close_units / qty } else { fee };
                    let close = FillLeg {
                        tx,
                        qty: close_units,
                        price,
                        fee: close_fee,
                        note: note.clone(),
                    };
                    trades.push(self.closing_trade(close, &prev, direction, compose_id, timestamp_ms));
                    if flips {
                        let open = FillLeg {
                            tx,
                            qty: remainder,
                            price,
                            fee: fee - close_fee,
                            note,
                        };
                        trades.push(self.opening_trade(open, compose_id, timestamp_ms));
                    }
                }
                _ => {
                    let fill = FillLeg {
                        tx,
                        qty,
                        price,
                        fee,
                        note,
                    };
                    let mut trade = self.opening_trade(fill, compose_id, timestamp_ms);
                    if closing_type.is_some() {
                        self.pair_partial_exit(&mut trade, price, timestamp_ms);
                    }
                    trades.push(trade);
                }
            }

            let mut next = prev;
            next.apply(tx.side, qty, price, timestamp_ms, tx.leverage);
            legs.insert(symbol.clone(), next);
        }
        trades
    }

    /// Trade that takes a whole leg back to flat
    fn closing_trade(
        &self,
        fill: FillLeg<'_>,
        entry: &RunningLeg,
        direction: TradeType,
        compose_id: &str,
        timestamp_ms: i64,
    ) -> TradeHistoryEntry {
        let FillLeg {
            tx,
            qty,
            price,
            fee,
            note,
        } = fill;
        let entry_px = entry.avg_price;
        let realized = price.zip(entry_px).map(|(exit, entry_px)| {
            let core = match direction {
                TradeType::Long => (exit - entry_px) * qty,
                TradeType::Short => (entry_px - exit) * qty,
            };
            core - fee
        });
        let notional_entry = entry_px.map(|p| p * qty);

        TradeHistoryEntry {
            trade_id: format!("trade-{}", uuid::Uuid::new_v4()),
            compose_id: compose_id.to_string(),
            instruction_id: tx.instruction_id.clone(),
            strategy_id: self.strategy_id.clone(),
            instrument: tx.instrument.clone(),
            side: tx.side,
            trade_type: direction,
            quantity: qty,
            entry_price: entry_px,
            exit_price: price,
            avg_exec_price: price,
            notional_entry,
            notional_exit: price.map(|p| p * qty),
            entry_ts: Some(entry.entry_ts.unwrap_or(timestamp_ms)),
            exit_ts: Some(timestamp_ms),
            trade_ts: Some(timestamp_ms),
            holding_ms: entry.entry_ts.map(|e| timestamp_ms - e),
            realized_pnl: realized,
            realized_pnl_pct: match (realized, notional_entry) {
                (Some(r), Some(n)) if !n.is_zero() => Some(r / n),
                _ => None,
            },
            leverage: entry.leverage.or(tx.leverage),
            fee_cost: (!fee.is_zero()).then_some(fee),
            note,
        }
    }

    /// Trade that opens, adds to or partially reduces a leg
    fn opening_trade(&self, fill: FillLeg<'_>, compose_id: &str, timestamp_ms: i64) -> TradeHistoryEntry {
        let FillLeg {
            tx,
            qty,
            price,
            fee,
            note,
        } = fill;
        let notional = price.map(|p| p * qty);
        let realized = notional.map(|_| -fee);

        TradeHistoryEntry {
            trade_id: format!("trade-{}", uuid::Uuid::new_v4()),
            compose_id: compose_id.to_string(),
            instruction_id: tx.instruction_id.clone(),
            strategy_id: self.strategy_id.clone(),
            instrument: tx.instrument.clone(),
            side: tx.side,
            trade_type: match tx.side {
                TradeSide::Buy => TradeType::Long,
                TradeSide::Sell => TradeType::Short,
            },
            quantity: qty,
            entry_price: price,
            exit_price: None,
            avg_exec_price: price,
            notional_entry: notional,
            notional_exit: None,
            entry_ts: Some(timestamp_ms),
            exit_ts: None,
            trade_ts: Some(timestamp_ms),
            holding_ms: None,
            realized_pnl: realized,
            realized_pnl_pct: match (realized, notional) {
                (Some(r), Some(n)) if !n.is_zero() => Some(r / n),
                _ => None,
            },
            leverage: tx.leverage,
            fee_cost: (!fee.is_zero()).then_some(fee),
            note,
        }
    }

    /// Mark the latest open trade of the symbol as exited and point the
    /// reducing trade at it
    fn pair_partial_exit(&mut self, trade: &mut TradeHistoryEntry, price: Option<Decimal>, timestamp_ms: i64) {
        let Some(open) = latest_open_trade(self.history.records_mut(), &trade.instrument.symbol) else {
            return;
        };
        open.exit_price = price;
        open.exit_ts = Some(timestamp_ms);
        open.holding_ms = open.entry_ts.or(open.trade_ts).map(|e| timestamp_ms - e);
        open.notional_exit = price.map(|p| p * trade.quantity);
        let paired = format!("paired_exit_of:{}", open.trade_id);
        trade.note = Some(match trade.note.take() {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, paired),
            _ => paired,
        });
    }

    fn build_summary(&self, timestamp_ms: i64) -> StrategySummary {
        let view = self.portfolio.get_view();
        let realized = view.total_realized_pnl.unwrap_or(Decimal::ZERO);
        let unrealized = view.total_unrealized_pnl.unwrap_or(Decimal::ZERO);
        let equity = view.total_value.unwrap_or(Decimal::ZERO);

        let pnl_pct = (!self.initial_capital.is_zero())
            .then(|| (realized + unrealized) / self.initial_capital);
        let unrealized_pnl_pct =
            (!equity.is_zero()).then(|| unrealized / equity * Decimal::ONE_HUNDRED);

        StrategySummary {
            strategy_id: self.strategy_id.clone(),
            name: self.request.trading_config.strategy_name.clone(),
            model_provider: Some(self.request.llm_model_config.provider.clone()),
            model_id: Some(self.request.llm_model_config.model_id.clone()),
            exchange_id: self.request.exchange_config.exchange_id.clone(),
            mode: self.request.exchange_config.trading_mode,
            status: StrategyStatus::Running,
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            unrealized_pnl_pct,
            pnl_pct,
            total_value: Some(equity),
            last_updated_ts: timestamp_ms,
        }
    }

    /// Close every open position with reduce-only market orders. Fills are
    /// applied and recorded even when some orders fail; any failure is
    /// returned as an error after that.
    pub async fn close_all_positions(&mut self) -> Result<Vec<TradeHistoryEntry>> {
        info!("Closing all positions for strategy {}", self.strategy_id);
        let view = self.portfolio.get_view();
        let compose_id = format!("close_all-{}", uuid::Uuid::new_v4());
        let timestamp_ms = chrono::Utc::now().timestamp_millis();

        let instructions: Vec<TradeInstruction> = view
            .positions
            .values()
            .filter(|pos| !pos.quantity.is_zero())
            .enumerate()
            .map(|(idx, pos)| {
                let long = pos.quantity > Decimal::ZERO;
                let action = if long {
                    TradeDecisionAction::CloseLong
                } else {
                    TradeDecisionAction::CloseShort
                };
                TradeInstruction {
                    instruction_id: format!("{}:{}:{}", compose_id, pos.instrument.symbol, idx),
                    compose_id: compose_id.clone(),
                    instrument: pos.instrument.clone(),
                    action: Some(action),
                    side: if long { TradeSide::Sell } else { TradeSide::Buy },
                    quantity: pos.quantity.abs(),
                    leverage: pos.leverage,
                    price_mode: PriceMode::Market,
                    limit_price: None,
                    max_slippage_bps: None,
                    stop_loss_price: None,
                    take_profit_price: None,
                    meta: InstructionMeta {
                        current_qty: Some(pos.quantity),
                        final_target_qty: Some(Decimal::ZERO),
                        action: Some(action),
                        rationale: Some(CLOSE_ALL_RATIONALE.to_string()),
                        reduce_only: true,
                        ..Default::default()
                    },
                }
            })
            .collect();

        if instructions.is_empty() {
            info!("No open positions to close for strategy {}", self.strategy_id);
            return Ok(Vec::new());
        }

        info!("Executing {} close instructions", instructions.len());
        let market_features = self.last_market_features.clone();
        let tx_results = self
            .gateway
            .execute(&instructions, &market_features)
            .await
            .context("failed to execute close instructions")?;

        let trades = self.create_trades(&tx_results, &instructions, &compose_id, timestamp_ms);
        self.portfolio.apply_trades(&trades, &market_features);
        self.history.record(HistoryRecord {
            ts: timestamp_ms,
            reference_id: compose_id,
            payload: HistoryPayload::Execution {
                trades: trades.clone(),
            },
        });

        let failed: Vec<String> = tx_results
            .iter()
            .filter(|tx| tx.status.is_failure())
            .map(|tx| {
                format!(
                    "{}: {}",
                    tx.instrument.symbol,
                    tx.reason.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if !failed.is_empty() {
            return Err(anyhow!("failed to close positions: {}", failed.join("; ")));
        }

        info!("Closed all positions, generated {} trades", trades.len());
        Ok(trades)
    }

    /// Release the gateway
    pub async fn close(&self) -> Result<()> {
        self.gateway
            .close()
            .await
            .with_context(|| format!("failed to close {} gateway", self.gateway.name()))
    }
}
