//! LLM-driven composer
//!
//! Serializes the cycle context into a compact JSON prompt, asks the model
//! for a [`TradePlanProposal`] and runs it through the shared guardrails.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Composer, PlanNormalizer};
use crate::config::TradingConfig;
use crate::features::group_features;
use crate::llm_client::LlmClient;
use crate::types::{ComposeContext, ComposeResult, FeatureVector, TradePlanProposal, MARKET_SNAPSHOT_GROUP};

/// Fixed per-cycle instruction header
pub const INSTRUCTION_HEADER: &str = "Read Context and decide. \
features.1m = structural trends (240 periods), features.1s = realtime signals (180 periods). \
market.funding_rate: positive = longs pay shorts. \
Respect constraints and risk_flags. Prefer NOOP when edge unclear. \
Output JSON with items array.";

/// Role and output contract sent as the system message
pub const SYSTEM_PROMPT: &str = "You plan trades for a crypto strategy executor. \
Answer with a single JSON object {\"items\": [...], \"rationale\": \"...\"}. \
Each item has instrument (symbol), action (open_long, open_short, close_long, close_short, noop), \
target_qty (positive operation size in units, not the final position), and optional leverage, \
confidence in [0,1], rationale, stop_loss_price and take_profit_price. \
At most one item per symbol. On spot markets only open_long and close_long apply.";

pub const RATE_LIMIT_RATIONALE: &str = "Trading decision skipped: LLM API quota/rate limit exceeded. \
Please check your API plan and billing. The strategy will retry in the next cycle.";

const RAW_EXCERPT_CHARS: usize = 500;

/// Composer backed by a chat model
pub struct LlmComposer {
    trading: TradingConfig,
    client: Arc<dyn LlmClient>,
    normalizer: PlanNormalizer,
}

impl LlmComposer {
    pub fn new(trading: TradingConfig, client: Arc<dyn LlmClient>, normalizer: PlanNormalizer) -> Self {
        Self {
            trading,
            client,
            normalizer,
        }
    }

    /// custom_prompt and prompt_text fused, or a generic fallback
    pub fn strategy_prompt(&self) -> String {
        strategy_prompt_text(&self.trading)
    }
}

pub fn strategy_prompt_text(trading: &TradingConfig) -> String {
    let custom = trading.custom_prompt.as_deref().filter(|s| !s.trim().is_empty());
    let prompt = trading.prompt_text.as_deref().filter(|s| !s.trim().is_empty());
    match (custom, prompt) {
        (Some(c), Some(p)) => format!("{}\n\n{}", c, p),
        (Some(c), None) => c.to_string(),
        (None, Some(p)) => p.to_string(),
        (None, None) => format!(
            "Compose trading instructions for symbols: {}.",
            trading.symbols.join(", ")
        ),
    }
}

#[async_trait::async_trait]
impl Composer for LlmComposer {
    async fn compose(&self, context: &ComposeContext) -> ComposeResult {
        let prompt = build_prompt(&self.strategy_prompt(), context);

        let raw = match self.client.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(raw) => raw,
            Err(e) if e.is_rate_limit() => {
                warn!("LLM quota/rate limit exceeded, skipping cycle: {}", e);
                return ComposeResult {
                    instructions: vec![],
                    rationale: Some(RATE_LIMIT_RATIONALE.to_string()),
                };
            }
            Err(e) => {
                error!("LLM invocation failed: {}", e);
                return ComposeResult {
                    instructions: vec![],
                    rationale: Some(format!(
                        "LLM invocation failed: {}. Strategy will retry in the next cycle.",
                        e
                    )),
                };
            }
        };

        let plan = match parse_plan(&raw) {
            Ok(plan) => plan,
            Err(e) => {
                error!("LLM output failed validation: {}", e);
                let excerpt: String = raw.chars().take(RAW_EXCERPT_CHARS).collect();
                return ComposeResult {
                    instructions: vec![],
                    rationale: Some(format!(
                        "LLM output failed validation. The model you chose `{}` may be incompatible \
                         or returned unexpected output. Error: {}. Raw output: {}",
                        self.client.describe(),
                        e,
                        excerpt
                    )),
                };
            }
        };

        if plan.items.is_empty() {
            info!(
                "LLM returned empty plan for compose_id={} with rationale={:?}",
                context.compose_id, plan.rationale
            );
            return ComposeResult {
                instructions: vec![],
                rationale: Some(
                    plan.rationale
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| "LLM returned no trade items".to_string()),
                ),
            };
        }

        let instructions = self.normalizer.normalize(context, &plan);
        info!(
            "LLM plan for {}: {} items -> {} instructions",
            context.compose_id,
            plan.items.len(),
            instructions.len()
        );
        ComposeResult {
            instructions,
            rationale: plan.rationale,
        }
    }
}

/// Parse a model answer, tolerating markdown fences and surrounding prose
pub fn parse_plan(raw: &str) -> std::result::Result<TradePlanProposal, serde_json::Error> {
    let body = strip_code_fence(raw.trim());
    let body = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    };
    serde_json::from_str(body)
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the info string ("json") on the opening line
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// `"<header>\n\nContext:\n<json>"`
pub fn build_prompt(strategy_prompt: &str, context: &ComposeContext) -> String {
    let view = &context.portfolio;
    let grouped = group_features(&context.features);

    let summary = json!({
        "active_positions": view.active_positions(),
        "total_value": num(view.total_value),
        "account_balance": num(Some(view.account_balance)),
        "free_cash": num(view.free_cash),
        "unrealized_pnl": num(view.total_unrealized_pnl),
        "sharpe_ratio": context.digest.sharpe_ratio,
    });

    let market = grouped
        .get(MARKET_SNAPSHOT_GROUP)
        .map(|fvs| market_section(fvs))
        .unwrap_or_default();

    let features: Map<String, Value> = grouped
        .iter()
        .map(|(group, fvs)| {
            let items = fvs
                .iter()
                .filter_map(|fv| serde_json::to_value(fv).ok())
                .collect::<Vec<_>>();
            (group.clone(), Value::Array(items))
        })
        .collect();

    let positions: Vec<Value> = view
        .positions
        .iter()
        .filter(|(_, p)| !p.quantity.is_zero())
        .map(|(symbol, p)| {
            json!({
                "symbol": symbol,
                "qty": num(Some(p.quantity)),
                "unrealized_pnl": num(p.unrealized_pnl),
                "entry_ts": p.entry_ts,
            })
        })
        .collect();

    let constraints = view
        .constraints
        .as_ref()
        .map(|c| {
            json!({
                "max_positions": c.max_positions,
                "max_leverage": num(c.max_leverage),
                "quantity_step": num(c.quantity_step),
                "min_trade_qty": num(c.min_trade_qty),
                "max_order_qty": num(c.max_order_qty),
                "min_notional": num(c.min_notional),
                "max_position_qty": num(c.max_position_qty),
            })
        })
        .unwrap_or_else(|| json!({}));

    let payload = json!({
        "strategy_prompt": strategy_prompt,
        "summary": summary,
        "market": Value::Null,
        "features": features,
        "positions": positions,
        "constraints": constraints,
    });

    let mut pruned = prune_none(payload);
    // The model needs to see that market data is missing
    if let Value::Object(obj) = &mut pruned {
        obj.insert("market".to_string(), Value::Object(prune_map(market)));
    }

    format!("{}\n\nContext:\n{}", INSTRUCTION_HEADER, pruned)
}

/// Compact per-symbol ticker view
fn market_section(features: &[&FeatureVector]) -> Map<String, Value> {
    const ALIASES: [(&str, &str); 12] = [
        ("price.last", "last"),
        ("price.close", "close"),
        ("price.open", "open"),
        ("price.high", "high"),
        ("price.low", "low"),
        ("price.bid", "bid"),
        ("price.ask", "ask"),
        ("price.change_pct", "change_pct"),
        ("price.volume", "volume"),
        ("open_interest", "open_interest"),
        ("funding.rate", "funding_rate"),
        ("funding.mark_price", "mark_price"),
    ];

    let mut market = Map::new();
    for fv in features {
        let entry: Map<String, Value> = ALIASES
            .iter()
            .filter_map(|(key, alias)| fv.value(key).map(|v| (alias.to_string(), json!(v))))
            .collect();
        if !entry.is_empty() {
            market.insert(fv.instrument.symbol.clone(), Value::Object(entry));
        }
    }
    market
}

fn num(value: Option<Decimal>) -> Value {
    value
        .and_then(|d| d.to_f64())
        .map_or(Value::Null, |f| json!(f))
}

/// Recursively drop nulls, empty objects and empty arrays
pub fn prune_none(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(prune_map(map)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(prune_none)
                .filter(|v| !is_empty_value(v))
                .collect(),
        ),
        other => other,
    }
}

fn prune_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| (k, prune_none(v)))
        .filter(|(_, v)| !is_empty_value(v))
        .collect()
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}
