//! Decision history and the rolling trade digest

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::types::{
    HistoryPayload, HistoryRecord, InstrumentRef, TradeDigest, TradeDigestEntry,
    TradeHistoryEntry,
};

/// Annual risk-free rate used by the Sharpe ratio
pub const RISK_FREE_RATE: f64 = 0.03;
pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

/// Append-only store of cycle checkpoints
pub trait HistoryRecorder: Send + Sync {
    fn record(&mut self, record: HistoryRecord);

    /// Oldest first
    fn records(&self) -> &[HistoryRecord];

    fn records_mut(&mut self) -> &mut [HistoryRecord];
}

/// Keeps the newest `limit` records in memory
#[derive(Debug, Clone)]
pub struct InMemoryHistoryRecorder {
    limit: usize,
    records: Vec<HistoryRecord>,
}

impl InMemoryHistoryRecorder {
    pub const DEFAULT_LIMIT: usize = 200;

    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: Vec::new(),
        }
    }
}

impl Default for InMemoryHistoryRecorder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}

impl HistoryRecorder for InMemoryHistoryRecorder {
    fn record(&mut self, record: HistoryRecord) {
        self.records.push(record);
        if self.records.len() > self.limit {
            let excess = self.records.len() - self.limit;
            self.records.drain(..excess);
        }
    }

    fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    fn records_mut(&mut self) -> &mut [HistoryRecord] {
        &mut self.records
    }
}

/// Most recent trade on `symbol` that has no exit yet
pub fn latest_open_trade<'a>(
    records: &'a mut [HistoryRecord],
    symbol: &str,
) -> Option<&'a mut TradeHistoryEntry> {
    records
        .iter_mut()
        .rev()
        .filter_map(|r| match &mut r.payload {
            HistoryPayload::Execution { trades } => Some(trades),
            _ => None,
        })
        .flat_map(|trades| trades.iter_mut().rev())
        .find(|t| t.instrument.symbol == symbol && !t.has_exit())
}

/// Builds a [`TradeDigest`] from history
pub trait DigestBuilder: Send + Sync {
    fn build(&self, records: &[HistoryRecord]) -> TradeDigest;
}

/// Digest over the most recent execution records
#[derive(Debug, Clone)]
pub struct RollingDigestBuilder {
    window: usize,
}

impl RollingDigestBuilder {
    pub const DEFAULT_WINDOW: usize = 50;

    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }
}

impl Default for RollingDigestBuilder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

#[derive(Default)]
struct Tally {
    instrument: Option<InstrumentRef>,
    trade_count: u32,
    realized: Decimal,
    wins: u32,
    losses: u32,
    holding_sum: i64,
    holding_n: i64,
    last_ts: Option<i64>,
}

impl DigestBuilder for RollingDigestBuilder {
    fn build(&self, records: &[HistoryRecord]) -> TradeDigest {
        let executions: Vec<&Vec<TradeHistoryEntry>> = records
            .iter()
            .rev()
            .filter_map(|r| match &r.payload {
                HistoryPayload::Execution { trades } => Some(trades),
                _ => None,
            })
            .take(self.window)
            .collect();

        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        let mut returns_pct = Vec::new();

        for trade in executions.iter().rev().flat_map(|t| t.iter()) {
            let tally = tallies.entry(trade.instrument.symbol.clone()).or_default();
            tally.instrument.get_or_insert_with(|| trade.instrument.clone());
            tally.trade_count += 1;
            let pnl = trade.realized_pnl.unwrap_or(Decimal::ZERO);
            tally.realized += pnl;

            if trade.has_exit() {
                if pnl > Decimal::ZERO {
                    tally.wins += 1;
                } else {
                    tally.losses += 1;
                }
                if let Some(pct) = trade.realized_pnl_pct.and_then(|p| p.to_f64()) {
                    returns_pct.push(pct);
                }
            }
            if let Some(h) = trade.holding_ms {
                tally.holding_sum += h;
                tally.holding_n += 1;
            }
            let ts = trade.trade_ts.or(trade.exit_ts).or(trade.entry_ts);
            if let Some(ts) = ts {
                tally.last_ts = Some(tally.last_ts.map_or(ts, |prev| prev.max(ts)));
            }
        }

        let mut digest = TradeDigest {
            ts: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        };
        let (mut wins, mut closed) = (0u32, 0u32);

        for (symbol, tally) in tallies {
            let decided = tally.wins + tally.losses;
            wins += tally.wins;
            closed += decided;
            digest.total_trades += tally.trade_count;
            digest.total_realized_pnl += tally.realized;
            digest.by_instrument.insert(
                symbol.clone(),
                TradeDigestEntry {
                    instrument: tally.instrument.unwrap_or_else(|| InstrumentRef::new(symbol)),
                    trade_count: tally.trade_count,
                    realized_pnl: tally.realized,
                    win_rate: (decided > 0).then(|| tally.wins as f64 / decided as f64),
                    avg_holding_ms: (tally.holding_n > 0)
                        .then(|| tally.holding_sum / tally.holding_n),
                    last_trade_ts: tally.last_ts,
                },
            );
        }

        digest.win_rate = (closed > 0).then(|| wins as f64 / closed as f64);
        digest.avg_return_pct = (!returns_pct.is_empty())
            .then(|| returns_pct.iter().sum::<f64>() / returns_pct.len() as f64);
        digest.sharpe_ratio = sharpe_ratio(&equity_curve(records));
        digest
    }
}

/// (ts, equity) points from compose records with a positive total value
pub fn equity_curve(records: &[HistoryRecord]) -> Vec<(i64, f64)> {
    records
        .iter()
        .filter_map(|r| match &r.payload {
            HistoryPayload::Compose { summary } => summary
                .total_value
                .filter(|v| *v > Decimal::ZERO)
                .and_then(|v| v.to_f64())
                .map(|v| (r.ts, v)),
            _ => None,
        })
        .collect()
}

/// Per-period Sharpe ratio of an equity series.
///
/// Points are sorted by timestamp and only strictly increasing timestamps
/// are kept. The risk-free rate is scaled to the mean sampling interval.
/// None with fewer than two points or two returns, or zero dispersion.
pub fn sharpe_ratio(points: &[(i64, f64)]) -> Option<f64> {
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|(ts, _)| *ts);
    let mut series: Vec<(i64, f64)> = Vec::with_capacity(sorted.len());
    for (ts, equity) in sorted {
        if series.last().map_or(true, |(prev, _)| ts > *prev) {
            series.push((ts, equity));
        }
    }
    if series.len() < 2 {
        return None;
    }

    let returns: Vec<f64> = series
        .windows(2)
        .filter(|w| w[0].1 != 0.0)
        .map(|w| w[1].1 / w[0].1 - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let (first_ts, last_ts) = (series[0].0, series[series.len() - 1].0);
    let mean_interval_secs = (last_ts - first_ts) as f64 / 1000.0 / (series.len() - 1) as f64;
    if mean_interval_secs <= 0.0 {
        return None;
    }
    let periods_per_year = SECONDS_PER_YEAR / mean_interval_secs;

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        return None;
    }
    Some((mean - RISK_FREE_RATE / periods_per_year) / std)
}
