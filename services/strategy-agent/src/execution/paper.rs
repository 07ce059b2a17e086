//! Paper execution: simulated fills at the snapshot price with slippage and
//! a flat fee

use async_trait::async_trait;
use market_data::quote_currency;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AccountBalance, ExchangePosition, ExecutionGateway, GatewayError, OrderResult, Result};
use crate::features::extract_price_map;
use crate::types::{FeatureVector, TradeInstruction, TradeSide, TxResult, TxStatus};

/// Default simulated fee (10 bps)
pub const DEFAULT_FEE_BPS: i64 = 10;

const BPS: i64 = 10_000;

/// Quote asset credited when a symbol has no recognizable quote
const DEFAULT_QUOTE: &str = "USDT";

#[derive(Debug, Default)]
struct PaperBook {
    cash: BTreeMap<String, Decimal>,
    /// symbol -> (signed quantity, average entry)
    positions: BTreeMap<String, (Decimal, Decimal)>,
    fills: u64,
}

impl PaperBook {
    fn apply_fill(&mut self, symbol: &str, side: TradeSide, qty: Decimal, price: Decimal, fee: Decimal) {
        let quote = quote_currency(symbol).unwrap_or_else(|| DEFAULT_QUOTE.to_string());
        let notional = price * qty;
        let cash = self.cash.entry(quote).or_insert(Decimal::ZERO);
        match side {
            TradeSide::Buy => *cash -= notional + fee,
            TradeSide::Sell => *cash += notional - fee,
        }

        let delta = side.sign() * qty;
        let (current, avg) = self
            .positions
            .get(symbol)
            .copied()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let next = current + delta;

        let next_avg = if current.is_zero() || current.is_sign_negative() != next.is_sign_negative() {
            // Fresh position or flip: the remainder opened at this price
            price
        } else if delta.is_sign_negative() == current.is_sign_negative() {
            // Increase: weighted average entry
            (avg * current.abs() + price * qty) / next.abs()
        } else {
            avg
        };

        if next.is_zero() {
            self.positions.remove(symbol);
        } else {
            self.positions.insert(symbol.to_string(), (next, next_avg));
        }
        self.fills += 1;
    }
}

/// Simulated broker used in virtual trading mode
pub struct PaperExecutionGateway {
    fee_bps: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExecutionGateway {
    pub fn new(fee_bps: Decimal) -> Self {
        info!("Paper execution gateway initialized: fee_bps={}", fee_bps);
        Self {
            fee_bps,
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// Seed the simulated account with cash per quote asset
    pub fn with_initial_cash(self, cash: BTreeMap<String, Decimal>) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                cash,
                ..PaperBook::default()
            }),
            ..self
        }
    }

    pub fn fee_bps(&self) -> Decimal {
        self.fee_bps
    }

    fn fill(&self, instruction: &TradeInstruction, reference: Decimal) -> TxResult {
        let slip_bps = Decimal::from(instruction.max_slippage_bps.unwrap_or(0));
        let slip = slip_bps / Decimal::from(BPS);
        let exec_price = match instruction.side {
            TradeSide::Buy => reference * (Decimal::ONE + slip),
            TradeSide::Sell => reference * (Decimal::ONE - slip),
        };
        let notional = exec_price * instruction.quantity;
        let fee = notional * self.fee_bps / Decimal::from(BPS);

        TxResult {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: instruction.quantity,
            avg_exec_price: Some(exec_price),
            slippage_bps: (!slip_bps.is_zero()).then_some(slip_bps),
            fee_cost: (!fee.is_zero()).then_some(fee),
            leverage: instruction.leverage,
            status: TxStatus::Filled,
            reason: None,
            order_id: Some(format!("paper-{}", uuid::Uuid::new_v4())),
        }
    }
}

impl Default for PaperExecutionGateway {
    fn default() -> Self {
        Self::new(Decimal::from(DEFAULT_FEE_BPS))
    }
}

#[async_trait]
impl ExecutionGateway for PaperExecutionGateway {
    async fn execute(
        &self,
        instructions: &[TradeInstruction],
        market_features: &[FeatureVector],
    ) -> Result<Vec<TxResult>> {
        let prices = extract_price_map(market_features);
        let mut book = self.book.lock().await;
        let mut results = Vec::with_capacity(instructions.len());

        for instruction in instructions {
            let symbol = &instruction.instrument.symbol;
            if instruction.quantity <= Decimal::ZERO {
                warn!("Paper reject {}: non-positive quantity {}", symbol, instruction.quantity);
                results.push(TxResult::failed(
                    instruction,
                    TxStatus::Rejected,
                    "non-positive quantity",
                ));
                continue;
            }

            let reference = prices
                .get(symbol)
                .copied()
                .or(instruction.limit_price)
                .filter(|px| *px > Decimal::ZERO);
            let Some(reference) = reference else {
                warn!("Paper reject {}: no reference price", symbol);
                results.push(TxResult::failed(
                    instruction,
                    TxStatus::Rejected,
                    format!("no reference price for {}", symbol),
                ));
                continue;
            };

            let result = self.fill(instruction, reference);
            if let Some(px) = result.avg_exec_price {
                book.apply_fill(
                    symbol,
                    instruction.side,
                    result.filled_qty,
                    px,
                    result.fee_cost.unwrap_or(Decimal::ZERO),
                );
            }
            debug!(
                "Paper fill {} {} {} @ {:?}",
                instruction.side, result.filled_qty, symbol, result.avg_exec_price
            );
            results.push(result);
        }

        Ok(results)
    }

    async fn fetch_balance(&self) -> Result<AccountBalance> {
        let book = self.book.lock().await;
        Ok(AccountBalance {
            free: book.cash.clone(),
            total: book.cash.clone(),
        })
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<ExchangePosition>> {
        let book = self.book.lock().await;
        Ok(book
            .positions
            .iter()
            .filter(|(symbol, _)| symbols.is_empty() || symbols.contains(symbol))
            .map(|(symbol, (qty, avg))| ExchangePosition {
                symbol: symbol.clone(),
                quantity: *qty,
                entry_price: Some(*avg),
                mark_price: None,
                unrealized_pnl: None,
                leverage: None,
            })
            .collect())
    }

    async fn fetch_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<OrderResult>> {
        Ok(Vec::new())
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderResult> {
        Err(GatewayError::OrderNotFound(order_id.to_string()))
    }

    async fn close(&self) -> Result<()> {
        let book = self.book.lock().await;
        debug!("Paper gateway closed after {} fills", book.fills);
        Ok(())
    }

    fn name(&self) -> &str {
        "paper"
    }
}
