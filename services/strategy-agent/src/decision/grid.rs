//! Rule-based grid composer
//!
//! Mean-reversion around the position's average entry: a move of one or
//! more grid steps against the position adds, a move in its favour
//! reduces. Flat symbols open on a short-term move of at least one step.
//! Never calls external services.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use super::{quantity_precision, Composer, PlanNormalizer};
use crate::config::GridParams;
use crate::types::{
    ComposeContext, ComposeResult, FeatureVector, InstrumentRef, TradeDecisionAction,
    TradeDecisionItem, TradePlanProposal,
};

pub struct GridComposer {
    symbols: Vec<String>,
    exchange_id: Option<String>,
    max_leverage: Decimal,
    params: GridParams,
    normalizer: PlanNormalizer,
}

impl GridComposer {
    /// Symbols are deduplicated, keeping config order
    pub fn new(
        symbols: &[String],
        exchange_id: Option<String>,
        max_leverage: Decimal,
        params: GridParams,
        normalizer: PlanNormalizer,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(symbols.len());
        for s in symbols {
            if !unique.contains(s) {
                unique.push(s.clone());
            }
        }
        Self {
            symbols: unique,
            exchange_id,
            max_leverage,
            params,
            normalizer,
        }
    }

    fn is_spot(&self) -> bool {
        self.normalizer.market_type().is_spot()
    }

    /// Whole grid steps between `price` and `avg`, clamped to max_steps
    fn steps_from_avg(&self, price: Decimal, avg: Decimal) -> u32 {
        if avg <= Decimal::ZERO {
            return 1;
        }
        let step = self.params.step_pct.max(quantity_precision());
        let moved = (price / avg - Decimal::ONE).abs();
        let k = (moved / step).floor().to_u32().unwrap_or(u32::MAX);
        k.min(self.params.max_steps)
    }

    fn item(
        &self,
        symbol: &str,
        action: TradeDecisionAction,
        qty: Decimal,
        leverage: Decimal,
        confidence: f64,
        rationale: String,
    ) -> TradeDecisionItem {
        TradeDecisionItem {
            instrument: InstrumentRef::with_exchange(symbol, self.exchange_id.clone()),
            action,
            target_qty: qty,
            leverage: Some(leverage),
            confidence: Some(confidence.min(1.0)),
            rationale: Some(rationale),
            stop_loss_price: None,
            take_profit_price: None,
        }
    }
}

/// Latest `change_pct` for a symbol, preferring 1s over 1m over anything else
fn latest_change_pct(features: &[FeatureVector], symbol: &str) -> Option<f64> {
    features
        .iter()
        .filter(|fv| fv.instrument.symbol == symbol)
        .filter_map(|fv| {
            let change = fv.value("change_pct")?;
            let rank = match fv.meta.interval.as_deref() {
                Some("1s") => 0,
                Some("1m") => 1,
                _ => 2,
            };
            Some((rank, change))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, change)| change)
}

#[async_trait::async_trait]
impl Composer for GridComposer {
    async fn compose(&self, context: &ComposeContext) -> ComposeResult {
        let budget = self.normalizer.budget(context);
        let spot = self.is_spot();
        let step = self.params.step_pct;
        let step_f = step.to_f64().unwrap_or(0.0);
        let max_steps = self.params.max_steps.max(1);
        let lev = if spot {
            Decimal::ONE
        } else {
            self.max_leverage
                .min(budget.constraints.max_leverage.unwrap_or(self.max_leverage))
        };
        let mut items = Vec::new();

        for symbol in &self.symbols {
            let Some(price) = budget.prices.get(symbol).copied().filter(|p| *p > Decimal::ZERO)
            else {
                debug!("Grid skip {}: missing price", symbol);
                continue;
            };
            let base_qty = (budget.equity * self.params.base_fraction / price).max(Decimal::ZERO);
            if base_qty.is_zero() {
                continue;
            }

            let pos = context.portfolio.positions.get(symbol);
            let qty = pos.map(|p| p.quantity).unwrap_or_default();
            let avg = pos.and_then(|p| p.avg_price).unwrap_or_default();

            if qty.abs() <= quantity_precision() {
                let Some(change) = latest_change_pct(&context.features, symbol) else {
                    continue;
                };
                let confidence = if step_f > 0.0 {
                    change.abs() / (2.0 * step_f)
                } else {
                    1.0
                };
                if change <= -step_f {
                    items.push(self.item(
                        symbol,
                        TradeDecisionAction::OpenLong,
                        base_qty,
                        lev,
                        confidence,
                        format!("Grid open-long: change_pct={:.4} <= -step={:.4}", change, step),
                    ));
                } else if !spot && change >= step_f {
                    items.push(self.item(
                        symbol,
                        TradeDecisionAction::OpenShort,
                        base_qty,
                        lev,
                        confidence,
                        format!("Grid open-short: change_pct={:.4} >= step={:.4}", change, step),
                    ));
                }
                continue;
            }

            let k = self.steps_from_avg(price, avg);
            if k == 0 {
                continue;
            }
            let k_dec = Decimal::from(k);
            let confidence = k as f64 / max_steps as f64;
            let down = avg > Decimal::ZERO && price <= avg * (Decimal::ONE - step);
            let up = avg > Decimal::ZERO && price >= avg * (Decimal::ONE + step);

            if qty > Decimal::ZERO {
                if down {
                    items.push(self.item(
                        symbol,
                        TradeDecisionAction::OpenLong,
                        base_qty * k_dec,
                        lev,
                        confidence,
                        format!("Grid long add: price {:.4} <= avg {:.4} by {} steps", price, avg, k),
                    ));
                } else if up {
                    items.push(self.item(
                        symbol,
                        TradeDecisionAction::CloseLong,
                        qty.abs().min(base_qty * k_dec),
                        Decimal::ONE,
                        confidence,
                        format!("Grid long reduce: price {:.4} >= avg {:.4} by {} steps", price, avg, k),
                    ));
                }
            } else if up && !spot {
                items.push(self.item(
                    symbol,
                    TradeDecisionAction::OpenShort,
                    base_qty * k_dec,
                    lev,
                    confidence,
                    format!("Grid short add: price {:.4} >= avg {:.4} by {} steps", price, avg, k),
                ));
            } else if down {
                items.push(self.item(
                    symbol,
                    TradeDecisionAction::CloseShort,
                    qty.abs().min(base_qty * k_dec),
                    Decimal::ONE,
                    confidence,
                    format!("Grid short cover: price {:.4} <= avg {:.4} by {} steps", price, avg, k),
                ));
            }
        }

        if items.is_empty() {
            debug!("Grid produced NOOP plan for compose_id={}", context.compose_id);
            return ComposeResult {
                instructions: vec![],
                rationale: Some("Grid NOOP".to_string()),
            };
        }

        if items.len() > self.params.max_steps as usize {
            debug!(
                "Grid budget: keeping {} of {} items this cycle",
                self.params.max_steps,
                items.len()
            );
            items.truncate(self.params.max_steps as usize);
        }

        let plan = TradePlanProposal {
            ts: Some(context.ts),
            items,
            rationale: Some(format!(
                "Grid step={:.4}, base_fraction={:.3}",
                step, self.params.base_fraction
            )),
        };
        let instructions = self.normalizer.normalize(context, &plan);
        ComposeResult {
            instructions,
            rationale: plan.rationale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketType;
    use crate::decision::test_support::*;
    use crate::types::{interval_group, Constraints, FeatureMeta, TradeSide};

    fn grid(market: MarketType, symbols: &[&str]) -> GridComposer {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        GridComposer::new(
            &symbols,
            None,
            Decimal::from(5),
            GridParams::default(),
            PlanNormalizer::new(market, Decimal::new(15, 1)),
        )
    }

    fn change_feature(symbol: &str, interval: &str, change: f64) -> FeatureVector {
        FeatureVector {
            ts: 0,
            instrument: InstrumentRef::new(symbol),
            values: [("change_pct".to_string(), change)].into_iter().collect(),
            meta: FeatureMeta {
                interval: Some(interval.to_string()),
                group_by_key: Some(interval_group(interval)),
                ..Default::default()
            },
        }
    }

    fn assert_base_size(qty: Decimal, cash: i64, price: Decimal) {
        let expected = Decimal::from(cash) * Decimal::new(8, 2) / price;
        assert!((qty - expected).abs() < Decimal::new(1, 18), "{} != {}", qty, expected);
    }

    #[tokio::test]
    async fn test_spot_one_step_up_reduces_base_size() {
        let ctx = context(
            10_000,
            &[("BTC-USDT", 10, 100)],
            vec![price_feature("BTC-USDT", 100.5)],
            Constraints::default(),
        );
        let result = grid(MarketType::Spot, &["BTC-USDT"]).compose(&ctx).await;

        assert_eq!(result.instructions.len(), 1);
        let instr = &result.instructions[0];
        assert_eq!(instr.side, TradeSide::Sell);
        assert_eq!(instr.action, Some(TradeDecisionAction::CloseLong));
        assert_base_size(instr.quantity, 10_000, Decimal::new(1005, 1));
    }

    #[tokio::test]
    async fn test_spot_one_step_down_adds_base_size() {
        let ctx = context(
            10_000,
            &[("BTC-USDT", 10, 100)],
            vec![price_feature("BTC-USDT", 99.5)],
            Constraints::default(),
        );
        let result = grid(MarketType::Spot, &["BTC-USDT"]).compose(&ctx).await;

        assert_eq!(result.instructions.len(), 1);
        let instr = &result.instructions[0];
        assert_eq!(instr.side, TradeSide::Buy);
        assert_base_size(instr.quantity, 10_000, Decimal::new(995, 1));
    }

    #[tokio::test]
    async fn test_inside_one_step_is_noop() {
        let ctx = context(
            10_000,
            &[("BTC-USDT", 10, 100)],
            vec![price_feature("BTC-USDT", 100.25)],
            Constraints::default(),
        );
        let result = grid(MarketType::Spot, &["BTC-USDT"]).compose(&ctx).await;
        assert!(result.instructions.is_empty());
        assert_eq!(result.rationale.as_deref(), Some("Grid NOOP"));
    }

    #[tokio::test]
    async fn test_never_exceeds_max_steps_per_cycle() {
        let symbols = ["A-USDT", "B-USDT", "C-USDT", "D-USDT", "E-USDT"];
        let mut features = Vec::new();
        for s in symbols {
            features.push(price_feature(s, 10.0));
            features.push(change_feature(s, "1s", -0.01));
        }
        let ctx = context(
            1_000_000,
            &[],
            features,
            Constraints {
                max_leverage: Some(Decimal::from(5)),
                max_positions: Some(10),
                ..Default::default()
            },
        );
        let result = grid(MarketType::Swap, &symbols).compose(&ctx).await;
        assert_eq!(result.instructions.len(), 3);
        assert!(result.rationale.unwrap().starts_with("Grid step=0.0050"));
    }

    #[tokio::test]
    async fn test_flat_opens_on_change_prefers_1s() {
        let ctx = context(
            10_000,
            &[],
            vec![
                price_feature("BTC-USDT", 100.0),
                change_feature("BTC-USDT", "1m", -0.02),
                change_feature("BTC-USDT", "1s", 0.01),
            ],
            Constraints {
                max_leverage: Some(Decimal::from(3)),
                ..Default::default()
            },
        );
        let result = grid(MarketType::Swap, &["BTC-USDT", "BTC-USDT"]).compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.instructions[0].action, Some(TradeDecisionAction::OpenShort));
        assert_eq!(result.instructions[0].leverage, Some(Decimal::from(3)));

        // spot never opens shorts
        let result = grid(MarketType::Spot, &["BTC-USDT"]).compose(&ctx).await;
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_steps_clamped() {
        let g = grid(MarketType::Swap, &["X"]);
        assert_eq!(g.steps_from_avg(Decimal::from(110), Decimal::from(100)), 3);
        assert_eq!(g.steps_from_avg(Decimal::new(1005, 1), Decimal::from(100)), 1);
        assert_eq!(g.steps_from_avg(Decimal::from(5), Decimal::ZERO), 1);
    }
}
