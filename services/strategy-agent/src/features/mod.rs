//! Feature pipeline
//!
//! Turns raw candles and ticker snapshots into [`FeatureVector`]s. The
//! default pipeline fetches a realtime (1s) window, a structural (1m)
//! window and the ticker snapshot concurrently and keeps whatever arrived.

pub mod candle;
pub mod snapshot;

pub use candle::CandleFeatureComputer;
pub use snapshot::MarketSnapshotFeatureComputer;

use anyhow::Result;
use market_data::{Interval, MarketDataSource};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{FeatureVector, MARKET_SNAPSHOT_GROUP};

/// Output of one pipeline run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeaturesPipelineResult {
    pub features: Vec<FeatureVector>,
}

/// Produces the feature set for one decision cycle
#[async_trait::async_trait]
pub trait FeaturesPipeline: Send + Sync {
    async fn build(&self) -> Result<FeaturesPipelineResult>;
}

/// Candle window fetched by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleWindow {
    pub interval: Interval,
    pub lookback: usize,
}

impl CandleWindow {
    pub const MICRO: CandleWindow = CandleWindow {
        interval: Interval::Second1,
        lookback: 180,
    };
    pub const MEDIUM: CandleWindow = CandleWindow {
        interval: Interval::Minute1,
        lookback: 240,
    };
}

/// 1s + 1m candles plus ticker snapshot for a fixed symbol set
pub struct DefaultFeaturesPipeline {
    source: Arc<dyn MarketDataSource>,
    symbols: Vec<String>,
    micro: CandleWindow,
    medium: CandleWindow,
    candles: CandleFeatureComputer,
    snapshots: MarketSnapshotFeatureComputer,
}

impl DefaultFeaturesPipeline {
    pub fn new(source: Arc<dyn MarketDataSource>, symbols: Vec<String>) -> Self {
        Self {
            source,
            symbols,
            micro: CandleWindow::MICRO,
            medium: CandleWindow::MEDIUM,
            candles: CandleFeatureComputer::new(),
            snapshots: MarketSnapshotFeatureComputer::new(),
        }
    }

    pub fn with_windows(mut self, micro: CandleWindow, medium: CandleWindow) -> Self {
        self.micro = micro;
        self.medium = medium;
        self
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

#[async_trait::async_trait]
impl FeaturesPipeline for DefaultFeaturesPipeline {
    async fn build(&self) -> Result<FeaturesPipelineResult> {
        let source = self.source.name().to_string();
        let (micro, medium, snapshot) = tokio::join!(
            self.source
                .get_recent_candles(&self.symbols, self.micro.interval, self.micro.lookback),
            self.source
                .get_recent_candles(&self.symbols, self.medium.interval, self.medium.lookback),
            self.source.get_market_snapshot(&self.symbols),
        );

        let mut features = Vec::new();

        match medium {
            Ok(candles) => features.extend(self.candles.compute(&candles)),
            Err(e) => warn!("{}: {} candles unavailable: {}", source, self.medium.interval, e),
        }
        match micro {
            Ok(candles) => features.extend(self.candles.compute(&candles)),
            Err(e) => warn!("{}: {} candles unavailable: {}", source, self.micro.interval, e),
        }
        match snapshot {
            Ok(snaps) => {
                let ts = chrono::Utc::now().timestamp_millis();
                features.extend(self.snapshots.build(&snaps, ts));
            }
            Err(e) => warn!("{}: market snapshot unavailable: {}", source, e),
        }

        debug!(
            "Built {} feature vectors for {} symbols",
            features.len(),
            self.symbols.len()
        );
        Ok(FeaturesPipelineResult { features })
    }
}

/// Bucket features by `meta.group_by_key`; ungrouped vectors go under "other"
pub fn group_features(features: &[FeatureVector]) -> BTreeMap<String, Vec<&FeatureVector>> {
    let mut grouped: BTreeMap<String, Vec<&FeatureVector>> = BTreeMap::new();
    for fv in features {
        let key = fv.group().unwrap_or("other").to_string();
        grouped.entry(key).or_default().push(fv);
    }
    grouped
}

/// Snapshot vectors only
pub fn extract_market_snapshot_features(features: &[FeatureVector]) -> Vec<FeatureVector> {
    features
        .iter()
        .filter(|fv| fv.group() == Some(MARKET_SNAPSHOT_GROUP))
        .cloned()
        .collect()
}

const PRICE_KEYS: [&str; 4] = ["price.last", "price.close", "price.mark", "funding.mark_price"];

/// Reference price per symbol from snapshot-style keys
pub fn extract_price_map(features: &[FeatureVector]) -> BTreeMap<String, Decimal> {
    let mut prices = BTreeMap::new();
    for fv in features {
        let price = PRICE_KEYS
            .iter()
            .find_map(|key| fv.value(key))
            .and_then(|px| Decimal::try_from(px).ok())
            .filter(|px| *px > Decimal::ZERO);
        if let Some(px) = price {
            prices.insert(fv.instrument.symbol.clone(), px);
        }
    }
    prices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{interval_group, FeatureMeta, InstrumentRef};
    use market_data::{Candle, MarketDataError, MarketSnapshot};

    fn fv(symbol: &str, group: &str, values: &[(&str, f64)]) -> FeatureVector {
        FeatureVector {
            ts: 0,
            instrument: InstrumentRef::new(symbol),
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            meta: FeatureMeta {
                group_by_key: Some(group.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_price_map_key_priority() {
        let features = vec![
            fv("BTC-USDT", MARKET_SNAPSHOT_GROUP, &[("price.close", 99.5), ("price.last", 100.0)]),
            fv("ETH-USDT", MARKET_SNAPSHOT_GROUP, &[("funding.mark_price", 2000.5)]),
            fv("SOL-USDT", "interval_1m", &[("close", 150.0)]),
        ];
        let prices = extract_price_map(&features);
        assert_eq!(prices.get("BTC-USDT"), Some(&Decimal::from(100)));
        assert_eq!(prices.get("ETH-USDT"), Some(&Decimal::new(20005, 1)));
        assert!(!prices.contains_key("SOL-USDT"));
    }

    #[test]
    fn test_group_and_extract() {
        let features = vec![
            fv("BTC-USDT", &interval_group("1m"), &[("close", 1.0)]),
            fv("BTC-USDT", MARKET_SNAPSHOT_GROUP, &[("price.last", 1.0)]),
        ];
        let grouped = group_features(&features);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["interval_1m"].len(), 1);
        assert_eq!(extract_market_snapshot_features(&features).len(), 1);
    }

    /// Source that serves candles but fails snapshots
    struct FlakySource;

    #[async_trait::async_trait]
    impl MarketDataSource for FlakySource {
        async fn get_recent_candles(
            &self,
            symbols: &[String],
            interval: Interval,
            _lookback: usize,
        ) -> market_data::Result<Vec<Candle>> {
            Ok(symbols
                .iter()
                .filter(|s| s.starts_with("BTC"))
                .map(|s| Candle {
                    ts: 1_000,
                    symbol: s.clone(),
                    interval,
                    open: Decimal::from(100),
                    high: Decimal::from(100),
                    low: Decimal::from(100),
                    close: Decimal::from(100),
                    volume: Decimal::ONE,
                })
                .collect())
        }

        async fn get_market_snapshot(
            &self,
            _symbols: &[String],
        ) -> market_data::Result<BTreeMap<String, MarketSnapshot>> {
            Err(MarketDataError::Api("down".into()))
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_pipeline_keeps_partial_results() {
        let pipeline = DefaultFeaturesPipeline::new(
            Arc::new(FlakySource),
            vec!["BTC-USDT".into(), "ETH-USDT".into()],
        );
        let result = pipeline.build().await.unwrap();

        // medium first, then micro; no snapshot vectors
        let groups: Vec<_> = result.features.iter().map(|f| f.group().unwrap()).collect();
        assert_eq!(groups, vec!["interval_1m", "interval_1s"]);
        assert!(result
            .features
            .iter()
            .all(|f| f.instrument.symbol == "BTC-USDT"));
    }
}
