//! Technical indicators over candle windows

use market_data::Candle;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;

use crate::types::{interval_group, FeatureMeta, FeatureVector, InstrumentRef};

const RSI_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const BB_STDDEV: f64 = 2.0;

/// Computes one feature vector per (symbol, interval) window
#[derive(Debug, Clone, Default)]
pub struct CandleFeatureComputer;

impl CandleFeatureComputer {
    pub fn new() -> Self {
        Self
    }

    /// Group candles by symbol and interval and emit one vector per group,
    /// stamped with the last candle's open time
    pub fn compute(&self, candles: &[Candle]) -> Vec<FeatureVector> {
        let mut groups: BTreeMap<(String, &'static str), Vec<&Candle>> = BTreeMap::new();
        for candle in candles {
            groups
                .entry((candle.symbol.clone(), candle.interval.as_str()))
                .or_default()
                .push(candle);
        }

        let mut out = Vec::with_capacity(groups.len());
        for ((symbol, interval), mut window) in groups {
            window.sort_by_key(|c| c.ts);
            let (Some(first), Some(last)) = (window.first(), window.last()) else {
                continue;
            };

            let closes: Vec<f64> = window
                .iter()
                .map(|c| c.close.to_f64().unwrap_or(0.0))
                .collect();
            let mut values = indicator_values(&closes);
            values.insert("volume".into(), last.volume.to_f64().unwrap_or(0.0));

            out.push(FeatureVector {
                ts: last.ts,
                instrument: InstrumentRef::new(symbol),
                values,
                meta: FeatureMeta {
                    interval: Some(interval.to_string()),
                    count: Some(window.len()),
                    window_start_ts: Some(first.ts),
                    window_end_ts: Some(last.ts),
                    group_by_key: Some(interval_group(interval)),
                },
            });
        }
        out
    }
}

/// Indicators over an ascending close series. Keys whose lookback is not
/// satisfied are left out.
fn indicator_values(closes: &[f64]) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    let Some(&last) = closes.last() else {
        return values;
    };
    values.insert("close".into(), last);

    if closes.len() >= 2 {
        let prev = closes[closes.len() - 2];
        if prev != 0.0 {
            values.insert("change_pct".into(), last / prev - 1.0);
        }
    }

    let ema12 = ewm(closes, 12);
    let ema26 = ewm(closes, 26);
    let ema50 = ewm(closes, 50);
    let macd: Vec<f64> = ema12.iter().zip(&ema26).map(|(a, b)| a - b).collect();
    let signal = ewm(&macd, 9);

    if let (Some(e12), Some(e26), Some(e50), Some(m), Some(s)) =
        (ema12.last(), ema26.last(), ema50.last(), macd.last(), signal.last())
    {
        values.insert("ema_12".into(), *e12);
        values.insert("ema_26".into(), *e26);
        values.insert("ema_50".into(), *e50);
        values.insert("macd".into(), *m);
        values.insert("macd_signal".into(), *s);
        values.insert("macd_histogram".into(), m - s);
    }

    if let Some(rsi) = rsi(closes, RSI_PERIOD) {
        values.insert("rsi".into(), rsi);
    }

    if let Some((mid, upper, lower)) = bollinger(closes, BB_PERIOD, BB_STDDEV) {
        values.insert("bb_middle".into(), mid);
        values.insert("bb_upper".into(), upper);
        values.insert("bb_lower".into(), lower);
    }

    values
}

/// Span-based exponential moving average without bias adjustment, seeded
/// with the first value
pub fn ewm(series: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(series.len());
    let mut prev: Option<f64> = None;
    for &x in series {
        let next = match prev {
            None => x,
            Some(p) => alpha * x + (1.0 - alpha) * p,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// RSI from simple rolling means of gains and losses over the last `period`
/// changes. A zero loss mean yields 0.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let tail = &closes[closes.len() - period - 1..];
    let (mut gains, mut losses) = (0.0, 0.0);
    for pair in tail.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    let rs = if avg_loss == 0.0 { 0.0 } else { avg_gain / avg_loss };
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// (middle, upper, lower) bands from an SMA and sample standard deviation
pub fn bollinger(closes: &[f64], period: usize, width: f64) -> Option<(f64, f64, f64)> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let tail = &closes[closes.len() - period..];
    let mean = tail.iter().sum::<f64>() / period as f64;
    let var = tail.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (period as f64 - 1.0);
    let std = var.sqrt();
    Some((mean, mean + width * std, mean - width * std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data::Interval;
    use rust_decimal::Decimal;

    fn candle(symbol: &str, interval: Interval, ts: i64, close: i64) -> Candle {
        let px = Decimal::from(close);
        Candle {
            ts,
            symbol: symbol.into(),
            interval,
            open: px,
            high: px,
            low: px,
            close: px,
            volume: Decimal::from(10),
        }
    }

    #[test]
    fn test_ewm_seeded_with_first_value() {
        let out = ewm(&[10.0, 20.0], 3);
        assert_eq!(out[0], 10.0);
        assert!((out[1] - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_bounds() {
        let rising: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        // No losses at all
        assert_eq!(rsi(&rising, 14), Some(0.0));
        let mixed = [
            10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0, 10.0, 11.0,
            12.0,
        ];
        let v = rsi(&mixed, 14).unwrap();
        assert!(v > 50.0 && v < 100.0);
        assert!(rsi(&rising[..14], 14).is_none());
    }

    #[test]
    fn test_bollinger_flat_series() {
        let flat = vec![5.0; 20];
        assert_eq!(bollinger(&flat, 20, 2.0), Some((5.0, 5.0, 5.0)));
        assert!(bollinger(&flat[..19], 20, 2.0).is_none());
    }

    #[test]
    fn test_compute_groups_by_symbol_and_interval() {
        let candles = vec![
            candle("BTC-USDT", Interval::Minute1, 120_000, 102),
            candle("BTC-USDT", Interval::Minute1, 0, 100),
            candle("BTC-USDT", Interval::Minute1, 60_000, 101),
            candle("ETH-USDT", Interval::Second1, 1_000, 50),
        ];
        let features = CandleFeatureComputer::new().compute(&candles);
        assert_eq!(features.len(), 2);

        let btc = features
            .iter()
            .find(|f| f.instrument.symbol == "BTC-USDT")
            .unwrap();
        assert_eq!(btc.ts, 120_000);
        assert_eq!(btc.value("close"), Some(102.0));
        assert!((btc.value("change_pct").unwrap() - (102.0 / 101.0 - 1.0)).abs() < 1e-12);
        assert_eq!(btc.meta.count, Some(3));
        assert_eq!(btc.meta.window_start_ts, Some(0));
        assert_eq!(btc.group(), Some("interval_1m"));
        assert!(btc.value("rsi").is_none());

        let eth = features
            .iter()
            .find(|f| f.instrument.symbol == "ETH-USDT")
            .unwrap();
        assert!(eth.value("change_pct").is_none());
        assert_eq!(eth.group(), Some("interval_1s"));
    }
}
