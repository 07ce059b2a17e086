//! Ticker snapshot to feature conversion

use market_data::MarketSnapshot;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::types::{FeatureMeta, FeatureVector, InstrumentRef, MARKET_SNAPSHOT_GROUP};

/// Flattens ticker snapshots into `price.*`, `open_interest` and `funding.*` keys
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshotFeatureComputer;

impl MarketSnapshotFeatureComputer {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, snapshots: &BTreeMap<String, MarketSnapshot>, ts: i64) -> Vec<FeatureVector> {
        snapshots
            .iter()
            .filter_map(|(symbol, snap)| {
                let values = snapshot_values(snap);
                if values.is_empty() {
                    return None;
                }
                Some(FeatureVector {
                    ts,
                    instrument: InstrumentRef::new(symbol.clone()),
                    values,
                    meta: FeatureMeta {
                        group_by_key: Some(MARKET_SNAPSHOT_GROUP.to_string()),
                        ..Default::default()
                    },
                })
            })
            .collect()
    }
}

fn snapshot_values(snap: &MarketSnapshot) -> BTreeMap<String, f64> {
    let volume = snap.quote_volume.or(snap.base_volume);
    let fields: [(&str, Option<Decimal>); 12] = [
        ("price.last", snap.last),
        ("price.close", snap.close),
        ("price.open", snap.open),
        ("price.high", snap.high),
        ("price.low", snap.low),
        ("price.bid", snap.bid),
        ("price.ask", snap.ask),
        ("price.change_pct", snap.change_pct),
        ("price.volume", volume),
        ("open_interest", snap.open_interest),
        ("funding.rate", snap.funding_rate),
        ("funding.mark_price", snap.mark_price),
    ];

    fields
        .into_iter()
        .filter_map(|(key, v)| v.and_then(|d| d.to_f64()).map(|f| (key.to_string(), f)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_empty_snapshots() {
        let mut snaps = BTreeMap::new();
        let mut btc = MarketSnapshot::new("BTC-USDT");
        btc.last = Some(Decimal::from(65_000));
        btc.base_volume = Some(Decimal::from(12));
        btc.funding_rate = Some(Decimal::new(1, 4));
        snaps.insert("BTC-USDT".to_string(), btc);
        snaps.insert("ETH-USDT".to_string(), MarketSnapshot::new("ETH-USDT"));

        let features = MarketSnapshotFeatureComputer::new().build(&snaps, 42);
        assert_eq!(features.len(), 1);
        let fv = &features[0];
        assert_eq!(fv.ts, 42);
        assert_eq!(fv.value("price.last"), Some(65_000.0));
        assert_eq!(fv.value("price.volume"), Some(12.0));
        assert_eq!(fv.value("funding.rate"), Some(0.0001));
        assert_eq!(fv.group(), Some(MARKET_SNAPSHOT_GROUP));
    }

    #[test]
    fn test_quote_volume_preferred() {
        let mut snap = MarketSnapshot::new("BTC-USDT");
        snap.base_volume = Some(Decimal::from(2));
        snap.quote_volume = Some(Decimal::from(130_000));
        assert_eq!(snapshot_values(&snap).get("price.volume"), Some(&130_000.0));
    }
}
