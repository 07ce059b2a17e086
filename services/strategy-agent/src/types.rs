//! Core types for the decision flow
//!
//! Everything that crosses a component boundary lives here: features,
//! portfolio views, composer inputs/outputs, execution results and the
//! history records the digest is built from.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::TradingMode;

/// Feature meta group for per-interval candle features
pub fn interval_group(interval: &str) -> String {
    format!("interval_{}", interval)
}

/// Feature meta group for ticker snapshot features
pub const MARKET_SNAPSHOT_GROUP: &str = "market_snapshot";

/// Tradable symbol reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentRef {
    /// Canonical "BASE-QUOTE" symbol
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
}

impl InstrumentRef {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: None,
        }
    }

    pub fn with_exchange(symbol: impl Into<String>, exchange_id: Option<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id,
        }
    }
}

// Models sometimes answer with a bare "ETH-USDT" instead of an object
impl<'de> Deserialize<'de> for InstrumentRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            symbol: String,
            #[serde(default)]
            exchange_id: Option<String>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Symbol(String),
            Full(Full),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Symbol(symbol) => InstrumentRef::new(symbol),
            Repr::Full(f) => InstrumentRef {
                symbol: f.symbol,
                exchange_id: f.exchange_id,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Metadata attached to a feature vector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by_key: Option<String>,
}

/// Computed numeric signals for one instrument at one timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub ts: i64,
    pub instrument: InstrumentRef,
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub meta: FeatureMeta,
}

impl FeatureVector {
    pub fn group(&self) -> Option<&str> {
        self.meta.group_by_key.as_deref()
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Direction of a position or trade leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Long,
    Short,
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeType::Long => write!(f, "LONG"),
            TradeType::Short => write!(f, "SHORT"),
        }
    }
}

/// Current holding in one instrument. Quantity is signed: long > 0, short < 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: InstrumentRef,
    pub quantity: Decimal,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl_pct: Option<Decimal>,
    #[serde(default)]
    pub notional: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub entry_ts: Option<i64>,
    #[serde(default)]
    pub trade_type: Option<TradeType>,
    #[serde(default)]
    pub closed_ts: Option<i64>,
}

impl PositionSnapshot {
    pub fn new(symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            instrument: InstrumentRef::new(symbol),
            quantity,
            avg_price: None,
            mark_price: None,
            unrealized_pnl: None,
            unrealized_pnl_pct: None,
            notional: None,
            leverage: None,
            entry_ts: None,
            trade_type: None,
            closed_ts: None,
        }
    }
}

/// Exchange and risk limits applied by the plan normalizer. Unset means
/// "no limit" except `max_leverage`, which defaults to 1 in the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_positions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_leverage: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_step: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trade_qty: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_order_qty: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_notional: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_qty: Option<Decimal>,
}

/// Read-only account view for one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioView {
    pub strategy_id: String,
    pub ts: i64,
    pub account_balance: Decimal,
    pub positions: BTreeMap<String, PositionSnapshot>,
    #[serde(default)]
    pub gross_exposure: Option<Decimal>,
    #[serde(default)]
    pub net_exposure: Option<Decimal>,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    /// Equity: cash + net (spot) or cash + unrealized (derivatives)
    #[serde(default)]
    pub total_value: Option<Decimal>,
    #[serde(default)]
    pub total_unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub total_realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub buying_power: Option<Decimal>,
    #[serde(default)]
    pub free_cash: Option<Decimal>,
}

impl PortfolioView {
    /// Empty view holding only cash
    pub fn with_cash(strategy_id: impl Into<String>, ts: i64, cash: Decimal) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            ts,
            account_balance: cash,
            positions: BTreeMap::new(),
            gross_exposure: None,
            net_exposure: None,
            constraints: None,
            total_value: None,
            total_unrealized_pnl: None,
            total_realized_pnl: None,
            buying_power: None,
            free_cash: None,
        }
    }

    /// Number of positions with a non-zero quantity
    pub fn active_positions(&self) -> usize {
        self.positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// Per-instrument statistics over recent executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDigestEntry {
    pub instrument: InstrumentRef,
    pub trade_count: u32,
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub win_rate: Option<f64>,
    #[serde(default)]
    pub avg_holding_ms: Option<i64>,
    #[serde(default)]
    pub last_trade_ts: Option<i64>,
}

/// Aggregate trading performance used as decision context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeDigest {
    pub ts: i64,
    pub by_instrument: BTreeMap<String, TradeDigestEntry>,
    pub total_trades: u32,
    #[serde(default)]
    pub win_rate: Option<f64>,
    pub total_realized_pnl: Decimal,
    /// Mean realized return of closed trades, in percent of entry notional
    #[serde(default)]
    pub avg_return_pct: Option<f64>,
    /// Per-period Sharpe ratio of the equity curve; None until defined
    #[serde(default)]
    pub sharpe_ratio: Option<f64>,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// High-level intent emitted by a composer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Noop,
}

impl TradeDecisionAction {
    /// Execution side for the action, None for noop
    pub fn side(&self) -> Option<TradeSide> {
        match self {
            TradeDecisionAction::OpenLong | TradeDecisionAction::CloseShort => Some(TradeSide::Buy),
            TradeDecisionAction::OpenShort | TradeDecisionAction::CloseLong => {
                Some(TradeSide::Sell)
            }
            TradeDecisionAction::Noop => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDecisionAction::OpenLong => "open_long",
            TradeDecisionAction::OpenShort => "open_short",
            TradeDecisionAction::CloseLong => "close_long",
            TradeDecisionAction::CloseShort => "close_short",
            TradeDecisionAction::Noop => "noop",
        }
    }
}

impl fmt::Display for TradeDecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    #[default]
    Market,
    Limit,
}

/// One proposed action from a composer, before guardrails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecisionItem {
    pub instrument: InstrumentRef,
    pub action: TradeDecisionAction,
    /// Operation size in instrument units, not the final position
    pub target_qty: Decimal,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit_price: Option<Decimal>,
}

/// Structured plan before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradePlanProposal {
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub items: Vec<TradeDecisionItem>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Audit trail attached to a normalized instruction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionMeta {
    #[serde(default)]
    pub requested_target_qty: Option<Decimal>,
    #[serde(default)]
    pub current_qty: Option<Decimal>,
    #[serde(default)]
    pub final_target_qty: Option<Decimal>,
    #[serde(default)]
    pub action: Option<TradeDecisionAction>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Set for derivative orders that only shrink exposure
    #[serde(default)]
    pub reduce_only: bool,
}

/// Executable order emitted after normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeInstruction {
    /// `{compose_id}:{symbol}:{index}`, stable within a cycle
    pub instruction_id: String,
    pub compose_id: String,
    pub instrument: InstrumentRef,
    #[serde(default)]
    pub action: Option<TradeDecisionAction>,
    pub side: TradeSide,
    pub quantity: Decimal,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub price_mode: PriceMode,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub max_slippage_bps: Option<u32>,
    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit_price: Option<Decimal>,
    #[serde(default)]
    pub meta: InstructionMeta,
}

/// Composer output for one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeResult {
    pub instructions: Vec<TradeInstruction>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Everything a composer may look at for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeContext {
    pub ts: i64,
    pub compose_id: String,
    pub strategy_id: String,
    pub features: Vec<FeatureVector>,
    pub portfolio: PortfolioView,
    pub digest: TradeDigest,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Filled,
    Partial,
    Rejected,
    Error,
}

impl TxStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TxStatus::Rejected | TxStatus::Error)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Filled => "filled",
            TxStatus::Partial => "partial",
            TxStatus::Rejected => "rejected",
            TxStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of one instruction at the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub instruction_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    #[serde(default)]
    pub avg_exec_price: Option<Decimal>,
    #[serde(default)]
    pub slippage_bps: Option<Decimal>,
    #[serde(default)]
    pub fee_cost: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    pub status: TxStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

impl TxResult {
    /// Failed result that filled nothing
    pub fn failed(instruction: &TradeInstruction, status: TxStatus, reason: impl Into<String>) -> Self {
        Self {
            instruction_id: instruction.instruction_id.clone(),
            instrument: instruction.instrument.clone(),
            side: instruction.side,
            requested_qty: instruction.quantity,
            filled_qty: Decimal::ZERO,
            avg_exec_price: None,
            slippage_bps: None,
            fee_cost: None,
            leverage: instruction.leverage,
            status,
            reason: Some(reason.into()),
            order_id: None,
        }
    }
}

/// A fill as recorded in history and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub trade_id: String,
    pub compose_id: String,
    pub instruction_id: String,
    pub strategy_id: String,
    pub instrument: InstrumentRef,
    pub side: TradeSide,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub quantity: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub avg_exec_price: Option<Decimal>,
    #[serde(default)]
    pub notional_entry: Option<Decimal>,
    #[serde(default)]
    pub notional_exit: Option<Decimal>,
    #[serde(default)]
    pub entry_ts: Option<i64>,
    #[serde(default)]
    pub exit_ts: Option<i64>,
    #[serde(default)]
    pub trade_ts: Option<i64>,
    #[serde(default)]
    pub holding_ms: Option<i64>,
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub realized_pnl_pct: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub fee_cost: Option<Decimal>,
    #[serde(default)]
    pub note: Option<String>,
}

impl TradeHistoryEntry {
    /// True once the trade carries exit information
    pub fn has_exit(&self) -> bool {
        self.exit_ts.is_some() || self.exit_price.is_some() || self.notional_exit.is_some()
    }
}

// ---------------------------------------------------------------------------
// Strategy lifecycle and history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    #[default]
    Running,
    Stopped,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Running => "running",
            StrategyStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(StrategyStatus::Running),
            "stopped" => Some(StrategyStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NormalExit,
    Cancelled,
    Error,
    ErrorClosingPositions,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::NormalExit => "normal_exit",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
            StopReason::ErrorClosingPositions => "error_closing_positions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal_exit" => Some(StopReason::NormalExit),
            "cancelled" => Some(StopReason::Cancelled),
            "error" => Some(StopReason::Error),
            "error_closing_positions" => Some(StopReason::ErrorClosingPositions),
            _ => None,
        }
    }
}

/// Strategy-level performance after a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub strategy_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub exchange_id: Option<String>,
    pub mode: TradingMode,
    pub status: StrategyStatus,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub unrealized_pnl_pct: Option<Decimal>,
    #[serde(default)]
    pub pnl_pct: Option<Decimal>,
    #[serde(default)]
    pub total_value: Option<Decimal>,
    pub last_updated_ts: i64,
}

/// Typed history payload, one variant per record kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum HistoryPayload {
    Features { features: Vec<FeatureVector> },
    Compose { summary: StrategySummary },
    Instructions { instructions: Vec<TradeInstruction> },
    Execution { trades: Vec<TradeHistoryEntry> },
}

/// Checkpoint written by the coordinator each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub ts: i64,
    pub reference_id: String,
    #[serde(flatten)]
    pub payload: HistoryPayload,
}

impl HistoryRecord {
    pub fn kind(&self) -> &'static str {
        match self.payload {
            HistoryPayload::Features { .. } => "features",
            HistoryPayload::Compose { .. } => "compose",
            HistoryPayload::Instructions { .. } => "instructions",
            HistoryPayload::Execution { .. } => "execution",
        }
    }
}

/// Everything produced by one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCycleResult {
    pub compose_id: String,
    pub timestamp_ms: i64,
    pub cycle_index: u64,
    #[serde(default)]
    pub rationale: Option<String>,
    pub strategy_summary: StrategySummary,
    pub instructions: Vec<TradeInstruction>,
    pub trades: Vec<TradeHistoryEntry>,
    pub history_records: Vec<HistoryRecord>,
    pub digest: TradeDigest,
    pub portfolio_view: PortfolioView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_accepts_plain_string() {
        let inst: InstrumentRef = serde_json::from_str(r#""ETH-USDT""#).unwrap();
        assert_eq!(inst.symbol, "ETH-USDT");
        let inst: InstrumentRef =
            serde_json::from_str(r#"{"symbol":"BTC-USDT","exchange_id":"binance"}"#).unwrap();
        assert_eq!(inst.exchange_id.as_deref(), Some("binance"));
    }

    #[test]
    fn test_action_side_alignment() {
        assert_eq!(TradeDecisionAction::OpenLong.side(), Some(TradeSide::Buy));
        assert_eq!(TradeDecisionAction::CloseShort.side(), Some(TradeSide::Buy));
        assert_eq!(TradeDecisionAction::OpenShort.side(), Some(TradeSide::Sell));
        assert_eq!(TradeDecisionAction::CloseLong.side(), Some(TradeSide::Sell));
        assert_eq!(TradeDecisionAction::Noop.side(), None);
    }

    #[test]
    fn test_decision_item_from_llm_json() {
        let item: TradeDecisionItem = serde_json::from_str(
            r#"{"instrument":"BTC-USDT","action":"open_long","target_qty":0.25,"leverage":3}"#,
        )
        .unwrap();
        assert_eq!(item.action, TradeDecisionAction::OpenLong);
        assert_eq!(item.target_qty, Decimal::new(25, 2));
        assert_eq!(item.leverage, Some(Decimal::from(3)));
        assert!(item.rationale.is_none());
    }

    #[test]
    fn test_history_record_kind_tag() {
        let record = HistoryRecord {
            ts: 1,
            reference_id: "c1".into(),
            payload: HistoryPayload::Execution { trades: vec![] },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "execution");
        assert_eq!(record.kind(), "execution");
        let back: HistoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
