//! Portfolio tracking - position and cash management

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{MarketType, TradingMode};
use crate::features::extract_price_map;
use crate::types::{
    Constraints, FeatureVector, InstrumentRef, PortfolioView, PositionSnapshot, TradeHistoryEntry,
    TradeType,
};

/// Source of truth for a strategy's cash and positions
pub trait PortfolioService: Send + Sync {
    /// Current view with aggregates recomputed
    fn get_view(&self) -> PortfolioView;

    /// Apply fills and re-mark every position. Returns the positions that
    /// were fully closed, stamped with `closed_ts`.
    fn apply_trades(
        &mut self,
        trades: &[TradeHistoryEntry],
        market_features: &[FeatureVector],
    ) -> Vec<PositionSnapshot>;

    /// Overwrite cash with an exchange-reported balance
    fn sync_cash(&mut self, cash: Decimal);

    /// Replace positions with exchange-reported ones
    fn sync_positions(&mut self, positions: Vec<PositionSnapshot>);
}

/// In-memory portfolio for one strategy
#[derive(Debug, Clone)]
pub struct InMemoryPortfolioService {
    strategy_id: String,
    mode: TradingMode,
    market_type: MarketType,
    constraints: Constraints,
    cash: Decimal,
    realized_pnl: Decimal,
    positions: BTreeMap<String, PositionSnapshot>,
    last_ts: i64,
}

impl InMemoryPortfolioService {
    pub fn new(
        initial_capital: Decimal,
        mode: TradingMode,
        market_type: MarketType,
        constraints: Constraints,
        strategy_id: impl Into<String>,
    ) -> Self {
        let strategy_id = strategy_id.into();
        info!(
            "Portfolio for {} initialized: cash={}, mode={:?}, market={:?}",
            strategy_id, initial_capital, mode, market_type
        );
        Self {
            strategy_id,
            mode,
            market_type,
            constraints,
            cash: initial_capital,
            realized_pnl: Decimal::ZERO,
            positions: BTreeMap::new(),
            last_ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions.get(symbol)
    }

    fn max_leverage(&self) -> Decimal {
        if self.market_type.is_spot() {
            return Decimal::ONE;
        }
        self.constraints
            .max_leverage
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(Decimal::ONE)
    }

    /// Apply one fill to the position book, returning the realized PnL of
    /// the closed portion and the tombstone of a fully closed position
    fn apply_fill(
        &mut self,
        trade: &TradeHistoryEntry,
        px: Decimal,
        ts: i64,
    ) -> (Decimal, Option<PositionSnapshot>) {
        let symbol = trade.instrument.symbol.clone();
        let delta = trade.side.sign() * trade.quantity;
        let mut realized = Decimal::ZERO;

        let pos = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| PositionSnapshot::new(symbol.clone(), Decimal::ZERO));
        if let Some(exchange_id) = &trade.instrument.exchange_id {
            pos.instrument.exchange_id = Some(exchange_id.clone());
        }

        let cur = pos.quantity;
        let new_qty = cur + delta;

        if cur.is_zero() || (cur > Decimal::ZERO) == (delta > Decimal::ZERO) {
            // Opening or adding: weighted average entry
            let avg = pos.avg_price.unwrap_or(px);
            let total_cost = cur.abs() * avg + delta.abs() * px;
            pos.avg_price = Some(total_cost / new_qty.abs());
            if cur.is_zero() {
                pos.entry_ts = Some(ts);
            }
        } else {
            let avg = pos.avg_price.unwrap_or(px);
            let closed = delta.abs().min(cur.abs());
            realized = if cur > Decimal::ZERO {
                closed * (px - avg)
            } else {
                closed * (avg - px)
            };
            if !new_qty.is_zero() && (new_qty > Decimal::ZERO) != (cur > Decimal::ZERO) {
                // Flipped through zero: the remainder is a fresh position
                pos.avg_price = Some(px);
                pos.entry_ts = Some(ts);
            }
        }

        pos.quantity = new_qty;
        pos.trade_type = if new_qty > Decimal::ZERO {
            Some(TradeType::Long)
        } else if new_qty < Decimal::ZERO {
            Some(TradeType::Short)
        } else {
            pos.trade_type
        };
        if trade.leverage.is_some() {
            pos.leverage = trade.leverage;
        }
        pos.mark_price = Some(px);

        debug!(
            "Position updated: {} | Qty: {} -> {} | Avg: {:?}",
            symbol, cur, new_qty, pos.avg_price
        );

        if new_qty.is_zero() {
            let mut closed = self.positions.remove(&symbol);
            if let Some(tombstone) = closed.as_mut() {
                tombstone.closed_ts = Some(ts);
                info!("Position closed: {} | Realized PnL: {}", symbol, realized);
            }
            return (realized, closed);
        }
        (realized, None)
    }

    fn mark_to_market(&mut self, prices: &BTreeMap<String, Decimal>) {
        for (symbol, pos) in self.positions.iter_mut() {
            if let Some(px) = prices.get(symbol) {
                pos.mark_price = Some(*px);
            }
            let (Some(mark), Some(avg)) = (pos.mark_price, pos.avg_price) else {
                continue;
            };
            let unrealized = (mark - avg) * pos.quantity;
            let cost = avg * pos.quantity.abs();
            pos.unrealized_pnl = Some(unrealized);
            pos.unrealized_pnl_pct = if cost.is_zero() {
                None
            } else {
                Some(unrealized / cost * Decimal::ONE_HUNDRED)
            };
            pos.notional = Some(mark * pos.quantity.abs());
        }
    }
}

impl PortfolioService for InMemoryPortfolioService {
    fn get_view(&self) -> PortfolioView {
        let mut gross = Decimal::ZERO;
        let mut net = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for pos in self.positions.values() {
            let Some(mark) = pos.mark_price.or(pos.avg_price) else {
                continue;
            };
            gross += pos.quantity.abs() * mark;
            net += pos.quantity * mark;
            unrealized += pos.unrealized_pnl.unwrap_or(Decimal::ZERO);
        }

        let spot = self.market_type.is_spot();
        let equity = if spot {
            self.cash + net
        } else {
            self.cash + unrealized
        };
        let max_lev = self.max_leverage();
        let (buying_power, free_cash) = if spot {
            let bp = self.cash.max(Decimal::ZERO);
            (bp, bp)
        } else {
            (
                (equity * max_lev - gross).max(Decimal::ZERO),
                (equity - gross / max_lev).max(Decimal::ZERO),
            )
        };

        PortfolioView {
            strategy_id: self.strategy_id.clone(),
            ts: self.last_ts,
            account_balance: self.cash,
            positions: self.positions.clone(),
            gross_exposure: Some(gross),
            net_exposure: Some(net),
            constraints: Some(self.constraints.clone()),
            total_value: Some(equity),
            total_unrealized_pnl: Some(unrealized),
            total_realized_pnl: Some(self.realized_pnl),
            buying_power: Some(buying_power),
            free_cash: Some(free_cash),
        }
    }

    fn apply_trades(
        &mut self,
        trades: &[TradeHistoryEntry],
        market_features: &[FeatureVector],
    ) -> Vec<PositionSnapshot> {
        let prices = extract_price_map(market_features);
        let now = chrono::Utc::now().timestamp_millis();
        let mut closed = Vec::new();

        for trade in trades {
            if trade.quantity <= Decimal::ZERO {
                continue;
            }
            let Some(px) = trade
                .avg_exec_price
                .or(trade.exit_price)
                .or(trade.entry_price)
                .or_else(|| prices.get(&trade.instrument.symbol).copied())
            else {
                debug!("Skipping trade {} without a price", trade.trade_id);
                continue;
            };
            let ts = trade.trade_ts.unwrap_or(now);
            let fee = trade.fee_cost.unwrap_or(Decimal::ZERO);
            let notional = trade.quantity * px;

            let (realized, tombstone) = self.apply_fill(trade, px, ts);
            closed.extend(tombstone);

            if self.market_type.is_spot() {
                self.cash -= trade.side.sign() * notional;
                self.cash -= fee;
            } else {
                self.cash += realized - fee;
            }
            self.realized_pnl += realized - fee;
        }

        self.mark_to_market(&prices);
        self.last_ts = now;
        closed
    }

    fn sync_cash(&mut self, cash: Decimal) {
        debug!("Cash synced for {}: {} -> {}", self.strategy_id, self.cash, cash);
        self.cash = cash;
    }

    fn sync_positions(&mut self, positions: Vec<PositionSnapshot>) {
        self.positions = positions
            .into_iter()
            .filter(|p| !p.quantity.is_zero())
            .map(|p| (p.instrument.symbol.clone(), p))
            .collect();
        debug!(
            "Positions synced for {} ({:?}): {} open",
            self.strategy_id,
            self.mode,
            self.positions.len()
        );
    }
}

/// Position snapshot for a symbol with a known entry
pub fn position_at(symbol: &str, quantity: Decimal, avg_price: Decimal) -> PositionSnapshot {
    PositionSnapshot {
        instrument: InstrumentRef::new(symbol),
        avg_price: Some(avg_price),
        mark_price: Some(avg_price),
        trade_type: Some(if quantity >= Decimal::ZERO {
            TradeType::Long
        } else {
            TradeType::Short
        }),
        ..PositionSnapshot::new(symbol, quantity)
    }
}
