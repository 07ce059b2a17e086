//! Decision composers and the shared plan normalizer
//!
//! A composer turns a [`ComposeContext`] into a [`TradePlanProposal`] and
//! hands it to [`PlanNormalizer`], which applies the exchange and risk
//! guardrails and emits executable [`TradeInstruction`]s. Composers never
//! submit orders.

pub mod grid;
pub mod llm;

pub use grid::GridComposer;
pub use llm::{build_prompt, LlmComposer};

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::MarketType;
use crate::features::extract_price_map;
use crate::types::{
    ComposeContext, ComposeResult, Constraints, InstructionMeta, PriceMode, TradeDecisionAction,
    TradeDecisionItem, TradeInstruction, TradePlanProposal, TradeSide,
};

/// Produces the instructions for one cycle
#[async_trait::async_trait]
pub trait Composer: Send + Sync {
    /// Never fails: problems surface as an empty instruction list with a
    /// rationale explaining why
    async fn compose(&self, context: &ComposeContext) -> ComposeResult;
}

/// Quantities at or below this are treated as zero
pub fn quantity_precision() -> Decimal {
    Decimal::new(1, 9)
}

pub const DEFAULT_SLIPPAGE_BPS: u32 = 25;

/// Guardrails shared by every composer
#[derive(Debug, Clone)]
pub struct PlanNormalizer {
    market_type: MarketType,
    cap_factor: Decimal,
    max_positions: Option<u32>,
    max_leverage: Option<Decimal>,
    slippage_bps: u32,
}

/// Per-plan state threaded through the guardrails
pub(crate) struct Budget {
    pub(crate) equity: Decimal,
    pub(crate) allowed_lev: Decimal,
    pub(crate) projected_gross: Decimal,
    pub(crate) constraints: Constraints,
    pub(crate) prices: BTreeMap<String, Decimal>,
}

impl PlanNormalizer {
    pub fn new(market_type: MarketType, cap_factor: Decimal) -> Self {
        Self {
            market_type,
            cap_factor,
            max_positions: None,
            max_leverage: None,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
        }
    }

    /// Fallback limits used when the portfolio view carries no constraints
    pub fn with_default_limits(mut self, max_positions: u32, max_leverage: Decimal) -> Self {
        self.max_positions = Some(max_positions);
        self.max_leverage = Some(max_leverage);
        self
    }

    pub fn with_slippage_bps(mut self, bps: u32) -> Self {
        self.slippage_bps = bps;
        self
    }

    pub fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn is_spot(&self) -> bool {
        self.market_type.is_spot()
    }

    pub(crate) fn budget(&self, context: &ComposeContext) -> Budget {
        let view = &context.portfolio;
        let constraints = view.constraints.clone().unwrap_or_else(|| Constraints {
            max_positions: self.max_positions,
            max_leverage: self.max_leverage,
            ..Default::default()
        });

        let equity = if self.is_spot() {
            view.account_balance
        } else {
            view.total_value
                .unwrap_or_else(|| view.account_balance + view.net_exposure.unwrap_or_default())
        };
        let allowed_lev = if self.is_spot() {
            Decimal::ONE
        } else {
            constraints.max_leverage.unwrap_or(Decimal::ONE)
        };

        let mut prices = extract_price_map(&context.features);
        for (symbol, pos) in &view.positions {
            if let Some(mark) = pos.mark_price.filter(|m| *m > Decimal::ZERO) {
                prices.entry(symbol.clone()).or_insert(mark);
            }
        }

        let projected_gross = view.gross_exposure.unwrap_or_else(|| {
            view.positions
                .iter()
                .map(|(symbol, pos)| {
                    pos.quantity.abs() * prices.get(symbol).copied().unwrap_or_default()
                })
                .sum()
        });

        Budget {
            equity,
            allowed_lev,
            projected_gross,
            constraints,
            prices,
        }
    }

    /// Apply every guardrail to `plan` and emit instructions in plan order
    pub fn normalize(
        &self,
        context: &ComposeContext,
        plan: &TradePlanProposal,
    ) -> Vec<TradeInstruction> {
        let eps = quantity_precision();
        let mut budget = self.budget(context);
        let mut projected: BTreeMap<String, Decimal> = context
            .portfolio
            .positions
            .iter()
            .map(|(s, p)| (s.clone(), p.quantity))
            .collect();
        let mut active = projected.values().filter(|q| q.abs() > eps).count();
        let mut instructions = Vec::new();

        for (idx, item) in plan.items.iter().enumerate() {
            let symbol = item.instrument.symbol.clone();
            let current = projected.get(&symbol).copied().unwrap_or_default();

            let mut target =
                resolve_target_quantity(item, current, budget.constraints.max_position_qty);
            if self.is_spot() && target < Decimal::ZERO {
                target = Decimal::ZERO;
            }

            // No direct flips: go flat first, then open the other side
            let sub_targets = if current * target < Decimal::ZERO {
                vec![Decimal::ZERO, target]
            } else {
                vec![target]
            };

            let mut local = current;
            for (sub_i, sub_target) in sub_targets.into_iter().enumerate() {
                let delta = sub_target - local;
                if delta.abs() <= eps {
                    continue;
                }

                let is_new = local.abs() <= eps && sub_target.abs() > eps;
                if let Some(max) = budget.constraints.max_positions {
                    if is_new && active >= max as usize {
                        warn!(
                            "Skipping {} due to max_positions (active={} max={})",
                            symbol, active, max
                        );
                        continue;
                    }
                }

                let side = if delta > Decimal::ZERO {
                    TradeSide::Buy
                } else {
                    TradeSide::Sell
                };
                let leverage = self.item_leverage(item, &budget.constraints);

                let (qty, consumed) = self.normalize_quantity(&symbol, delta.abs(), side, local, &budget);
                if qty <= eps {
                    debug!("Skipping {}: quantity {} after guardrails", symbol, qty);
                    continue;
                }

                let next = local + side.sign() * qty;
                projected.insert(symbol.clone(), next);
                budget.projected_gross += consumed;
                if is_new {
                    active += 1;
                }
                if next.abs() <= eps {
                    active = active.saturating_sub(1);
                }

                instructions.push(self.instruction(
                    context,
                    idx * 10 + sub_i,
                    item,
                    side,
                    qty,
                    leverage,
                    local,
                    sub_target,
                ));
                local = next;
            }
        }

        instructions
    }

    fn item_leverage(&self, item: &TradeDecisionItem, constraints: &Constraints) -> Decimal {
        if self.is_spot() {
            return Decimal::ONE;
        }
        let requested = item.leverage.unwrap_or(Decimal::ONE);
        let allowed = constraints.max_leverage.unwrap_or(requested);
        requested.min(allowed).max(Decimal::ONE)
    }

    /// Filters, then the notional/leverage cap, then buying power. Returns
    /// the final quantity and the gross exposure it consumes.
    fn normalize_quantity(
        &self,
        symbol: &str,
        quantity: Decimal,
        side: TradeSide,
        current: Decimal,
        budget: &Budget,
    ) -> (Decimal, Decimal) {
        let eps = quantity_precision();
        let price = budget.prices.get(symbol).copied();

        let Some(mut qty) = apply_quantity_filters(symbol, quantity, &budget.constraints, price)
        else {
            return (Decimal::ZERO, Decimal::ZERO);
        };

        // Notional/leverage cap, only for orders that grow the position
        let desired = current + side.sign() * qty;
        if let Some(px) = price {
            if desired.abs() > current.abs() && budget.equity > Decimal::ZERO {
                let mut cap_factor = self.cap_factor;
                if budget.constraints.quantity_step.is_some_and(|s| s > Decimal::ZERO) {
                    cap_factor = cap_factor.max(Decimal::new(15, 1));
                }
                let by_factor = cap_factor * budget.equity / px;
                let by_lev = budget.allowed_lev * budget.equity / px;
                let max_abs = by_factor.min(by_lev);
                if desired.abs() > max_abs {
                    let capped = (max_abs - current.abs()).max(Decimal::ZERO);
                    if capped < qty {
                        debug!(
                            "Capping {} qty due to notional/leverage (price={}, old_qty={}, new_qty={})",
                            symbol, px, qty, capped
                        );
                        qty = capped;
                    }
                }
            }
        }
        if qty <= eps {
            return (Decimal::ZERO, Decimal::ZERO);
        }

        let reduces = match side {
            TradeSide::Buy => current < Decimal::ZERO,
            TradeSide::Sell => current > Decimal::ZERO,
        };

        let Some(px) = price else {
            if reduces {
                let clamped = qty.min(current.abs());
                warn!(
                    "Missing price for {}, allowing reduce-only trade: qty={} (current={})",
                    symbol, clamped, current
                );
                return if clamped <= eps {
                    (Decimal::ZERO, Decimal::ZERO)
                } else {
                    (clamped, Decimal::ZERO)
                };
            }
            warn!(
                "Missing price for {}, blocking exposure-increasing {} of {}",
                symbol, side, qty
            );
            return (Decimal::ZERO, Decimal::ZERO);
        };

        let avail = if self.is_spot() {
            budget.equity.max(Decimal::ZERO)
        } else {
            (budget.equity * budget.allowed_lev - budget.projected_gross).max(Decimal::ZERO)
        };
        let effective_px = px * (Decimal::ONE + Decimal::from(self.slippage_bps) / Decimal::from(10_000));
        let avail_units = if avail > Decimal::ZERO {
            avail / effective_px
        } else {
            Decimal::ZERO
        };

        // Reductions and flips up to twice the position are free; anything
        // beyond has to fit into buying power
        let a = current.abs();
        let allowed = if !reduces {
            avail_units
        } else if qty <= a * Decimal::TWO {
            qty
        } else {
            a * Decimal::TWO + avail_units
        };
        let final_qty = qty.min(allowed).max(Decimal::ZERO);
        if final_qty <= eps {
            debug!("Buying power exhausted for {} ({} requested)", symbol, qty);
            return (Decimal::ZERO, Decimal::ZERO);
        }

        let after = (current + side.sign() * final_qty).abs();
        let grown = after - current.abs();
        let consumed = if grown > Decimal::ZERO {
            grown * effective_px
        } else {
            Decimal::ZERO
        };
        (final_qty, consumed)
    }

    #[allow(clippy::too_many_arguments)]
    fn instruction(
        &self,
        context: &ComposeContext,
        idx: usize,
        item: &TradeDecisionItem,
        side: TradeSide,
        quantity: Decimal,
        leverage: Decimal,
        current: Decimal,
        target: Decimal,
    ) -> TradeInstruction {
        let final_target = current + side.sign() * quantity;
        let symbol = &item.instrument.symbol;
        let instruction = TradeInstruction {
            instruction_id: format!("{}:{}:{}", context.compose_id, symbol, idx),
            compose_id: context.compose_id.clone(),
            instrument: item.instrument.clone(),
            action: Some(item.action),
            side,
            quantity,
            leverage: Some(leverage),
            price_mode: PriceMode::Market,
            limit_price: None,
            max_slippage_bps: Some(self.slippage_bps),
            stop_loss_price: item.stop_loss_price,
            take_profit_price: item.take_profit_price,
            meta: InstructionMeta {
                requested_target_qty: Some(target),
                current_qty: Some(current),
                final_target_qty: Some(final_target),
                action: Some(item.action),
                confidence: item.confidence,
                rationale: item.rationale.clone().filter(|r| !r.is_empty()),
                reduce_only: !self.is_spot() && final_target.abs() < current.abs(),
            },
        };
        debug!(
            "Created instruction {} for {} side={} qty={} lev={}",
            instruction.instruction_id, symbol, side, quantity, leverage
        );
        instruction
    }
}

/// Final position implied by an item; `target_qty` is an operation size
pub fn resolve_target_quantity(
    item: &TradeDecisionItem,
    current: Decimal,
    max_position_qty: Option<Decimal>,
) -> Decimal {
    let mag = item.target_qty.abs();
    let target = match item.action {
        TradeDecisionAction::Noop => return current,
        TradeDecisionAction::OpenLong => current.max(Decimal::ZERO) + mag,
        TradeDecisionAction::OpenShort => current.min(Decimal::ZERO) - mag,
        TradeDecisionAction::CloseLong if current > Decimal::ZERO => {
            (current - mag).max(Decimal::ZERO)
        }
        TradeDecisionAction::CloseShort if current < Decimal::ZERO => {
            (current + mag).min(Decimal::ZERO)
        }
        TradeDecisionAction::CloseLong | TradeDecisionAction::CloseShort => current,
    };
    match max_position_qty {
        Some(max) => {
            let max = max.abs();
            target.max(-max).min(max)
        }
        None => target,
    }
}

/// Exchange order filters. None means the order is filtered out.
fn apply_quantity_filters(
    symbol: &str,
    quantity: Decimal,
    constraints: &Constraints,
    price: Option<Decimal>,
) -> Option<Decimal> {
    let mut qty = quantity;
    if let Some(max) = constraints.max_order_qty {
        qty = qty.min(max);
    }
    if let Some(step) = constraints.quantity_step.filter(|s| *s > Decimal::ZERO) {
        qty = (qty / step).floor() * step;
    }
    if qty <= Decimal::ZERO {
        warn!("Filtered {}: qty {} <= 0", symbol, qty);
        return None;
    }
    if let Some(min) = constraints.min_trade_qty {
        if qty < min {
            warn!("Filtered {}: qty {} < min_trade_qty {}", symbol, qty, min);
            return None;
        }
    }
    if let Some(min_notional) = constraints.min_notional {
        let Some(px) = price else {
            warn!("Filtered {}: no price reference for min_notional", symbol);
            return None;
        };
        if qty * px < min_notional {
            warn!(
                "Filtered {}: notional {} < min_notional {}",
                symbol,
                qty * px,
                min_notional
            );
            return None;
        }
    }
    Some(qty)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{
        FeatureMeta, FeatureVector, InstrumentRef, PortfolioView, PositionSnapshot, TradeDigest,
        MARKET_SNAPSHOT_GROUP,
    };

    pub fn price_feature(symbol: &str, px: f64) -> FeatureVector {
        FeatureVector {
            ts: 0,
            instrument: InstrumentRef::new(symbol),
            values: [("price.last".to_string(), px)].into_iter().collect(),
            meta: FeatureMeta {
                group_by_key: Some(MARKET_SNAPSHOT_GROUP.into()),
                ..Default::default()
            },
        }
    }

    pub fn context(
        cash: i64,
        positions: &[(&str, i64, i64)],
        features: Vec<FeatureVector>,
        constraints: Constraints,
    ) -> ComposeContext {
        let mut view = PortfolioView::with_cash("s1", 0, Decimal::from(cash));
        for (symbol, qty, avg) in positions {
            let mut pos = PositionSnapshot::new(*symbol, Decimal::from(*qty));
            pos.avg_price = Some(Decimal::from(*avg));
            view.positions.insert(symbol.to_string(), pos);
        }
        view.constraints = Some(constraints);
        ComposeContext {
            ts: 0,
            compose_id: "c1".into(),
            strategy_id: "s1".into(),
            features,
            portfolio: view,
            digest: TradeDigest::default(),
        }
    }

    pub fn item(symbol: &str, action: TradeDecisionAction, qty: Decimal) -> TradeDecisionItem {
        TradeDecisionItem {
            instrument: InstrumentRef::new(symbol),
            action,
            target_qty: qty,
            leverage: None,
            confidence: None,
            rationale: None,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    pub fn plan(items: Vec<TradeDecisionItem>) -> TradePlanProposal {
        TradePlanProposal {
            ts: None,
            items,
            rationale: None,
        }
    }

    /// Market instruction as the normalizer would emit it
    pub fn instruction(symbol: &str, side: TradeSide, qty: Decimal) -> TradeInstruction {
        TradeInstruction {
            instruction_id: format!("c1:{}:0", symbol),
            compose_id: "c1".into(),
            instrument: InstrumentRef::new(symbol),
            action: Some(match side {
                TradeSide::Buy => TradeDecisionAction::OpenLong,
                TradeSide::Sell => TradeDecisionAction::CloseLong,
            }),
            side,
            quantity: qty,
            leverage: None,
            price_mode: PriceMode::Market,
            limit_price: None,
            max_slippage_bps: Some(DEFAULT_SLIPPAGE_BPS),
            stop_loss_price: None,
            take_profit_price: None,
            meta: InstructionMeta::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn swap_constraints() -> Constraints {
        Constraints {
            max_leverage: Some(Decimal::from(5)),
            max_positions: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_target_quantity() {
        let cur = Decimal::from(2);
        let r = |a, q: i64| resolve_target_quantity(&item("X", a, Decimal::from(q)), cur, None);
        assert_eq!(r(TradeDecisionAction::OpenLong, 1), Decimal::from(3));
        assert_eq!(r(TradeDecisionAction::OpenShort, 1), Decimal::from(-1));
        assert_eq!(r(TradeDecisionAction::CloseLong, 5), Decimal::ZERO);
        assert_eq!(r(TradeDecisionAction::CloseShort, 1), cur);
        assert_eq!(r(TradeDecisionAction::Noop, 9), cur);
        let clamped = resolve_target_quantity(
            &item("X", TradeDecisionAction::OpenLong, Decimal::from(10)),
            cur,
            Some(Decimal::from(4)),
        );
        assert_eq!(clamped, Decimal::from(4));
    }

    #[test]
    fn test_flip_splits_into_two_instructions() {
        let ctx = context(
            100_000,
            &[("BTC-USDT", 1, 100)],
            vec![price_feature("BTC-USDT", 100.0)],
            swap_constraints(),
        );
        let normalizer = PlanNormalizer::new(MarketType::Swap, Decimal::new(15, 1));
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![item("BTC-USDT", TradeDecisionAction::OpenShort, Decimal::from(2))]),
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].instruction_id, "c1:BTC-USDT:0");
        assert_eq!(out[0].side, TradeSide::Sell);
        assert_eq!(out[0].quantity, Decimal::ONE);
        assert!(out[0].meta.reduce_only);
        assert_eq!(out[1].instruction_id, "c1:BTC-USDT:1");
        assert_eq!(out[1].quantity, Decimal::from(2));
        assert!(!out[1].meta.reduce_only);
        assert_eq!(out[1].meta.final_target_qty, Some(Decimal::from(-2)));
        assert_eq!(out[1].max_slippage_bps, Some(DEFAULT_SLIPPAGE_BPS));
    }

    #[test]
    fn test_max_positions_blocks_new_symbols() {
        let constraints = Constraints {
            max_positions: Some(1),
            max_leverage: Some(Decimal::from(5)),
            ..Default::default()
        };
        let ctx = context(
            100_000,
            &[("BTC-USDT", 1, 100)],
            vec![price_feature("BTC-USDT", 100.0), price_feature("ETH-USDT", 50.0)],
            constraints,
        );
        let normalizer = PlanNormalizer::new(MarketType::Swap, Decimal::new(15, 1));
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![
                item("ETH-USDT", TradeDecisionAction::OpenLong, Decimal::ONE),
                item("BTC-USDT", TradeDecisionAction::OpenLong, Decimal::ONE),
            ]),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].instrument.symbol, "BTC-USDT");
        assert_eq!(out[0].instruction_id, "c1:BTC-USDT:10");
    }

    #[test]
    fn test_spot_forbids_shorts_and_leverage() {
        let ctx = context(
            10_000,
            &[],
            vec![price_feature("BTC-USDT", 100.0)],
            Constraints::default(),
        );
        let normalizer = PlanNormalizer::new(MarketType::Spot, Decimal::new(15, 1));
        let mut long = item("BTC-USDT", TradeDecisionAction::OpenLong, Decimal::ONE);
        long.leverage = Some(Decimal::from(10));
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![
                item("BTC-USDT", TradeDecisionAction::OpenShort, Decimal::ONE),
                long,
            ]),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].side, TradeSide::Buy);
        assert_eq!(out[0].leverage, Some(Decimal::ONE));
        assert!(!out[0].meta.reduce_only);
    }

    #[test]
    fn test_quantity_filters() {
        let constraints = Constraints {
            quantity_step: Some(Decimal::new(1, 1)),
            max_order_qty: Some(Decimal::from(2)),
            min_notional: Some(Decimal::from(10)),
            ..Default::default()
        };
        let px = Some(Decimal::from(100));
        assert_eq!(
            apply_quantity_filters("X", Decimal::new(1234, 3), &constraints, px),
            Some(Decimal::new(12, 1))
        );
        assert_eq!(
            apply_quantity_filters("X", Decimal::from(5), &constraints, px),
            Some(Decimal::from(2))
        );
        assert_eq!(apply_quantity_filters("X", Decimal::new(5, 2), &constraints, px), None);
        assert_eq!(apply_quantity_filters("X", Decimal::ONE, &constraints, None), None);
    }

    #[test]
    fn test_cap_limits_growth_but_not_reductions() {
        // equity 1000 at price 100 with leverage 1: at most 10 units
        let ctx = context(
            1_000,
            &[("BTC-USDT", 8, 100)],
            vec![price_feature("BTC-USDT", 100.0)],
            Constraints {
                max_leverage: Some(Decimal::ONE),
                ..Default::default()
            },
        );
        let normalizer = PlanNormalizer::new(MarketType::Swap, Decimal::new(15, 1));
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![item("BTC-USDT", TradeDecisionAction::OpenLong, Decimal::from(5))]),
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].quantity <= Decimal::from(2));

        let ctx = context(
            100,
            &[("BTC-USDT", 8, 100)],
            vec![price_feature("BTC-USDT", 100.0)],
            Constraints::default(),
        );
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![item("BTC-USDT", TradeDecisionAction::CloseLong, Decimal::from(3))]),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quantity, Decimal::from(3));
        assert!(out[0].meta.reduce_only);
    }

    #[test]
    fn test_missing_price_allows_only_reductions() {
        let ctx = context(10_000, &[("BTC-USDT", 2, 100)], vec![], Constraints::default());
        let normalizer = PlanNormalizer::new(MarketType::Swap, Decimal::new(15, 1));
        let out = normalizer.normalize(
            &ctx,
            &plan(vec![
                item("ETH-USDT", TradeDecisionAction::OpenLong, Decimal::ONE),
                item("BTC-USDT", TradeDecisionAction::CloseLong, Decimal::ONE),
            ]),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].instrument.symbol, "BTC-USDT");
        assert_eq!(out[0].side, TradeSide::Sell);
    }
}
