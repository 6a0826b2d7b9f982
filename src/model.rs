/// Core data types shared by every component: bars, trades, subscriptions.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Provenance tag attached to a `Bar` at emission time only. The cache
/// row itself carries no source column; this tag never survives a
/// round trip through storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    #[serde(rename = "H")]
    Historical,
    #[serde(rename = "L")]
    Live1m,
    #[serde(rename = "C")]
    Cache,
    #[serde(rename = "A")]
    Aggregated,
    #[serde(rename = "T")]
    Trade,
}

/// An OHLCV candle for one instrument/timeframe/bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: String,
    pub timeframe: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: Option<SourceTag>,
    pub is_closed: bool,
}

impl Bar {
    /// A bar with zero volume or non-finite OHLC is never persisted.
    pub fn is_null(&self) -> bool {
        self.volume == 0
            || !self.open.is_finite()
            || !self.high.is_finite()
            || !self.low.is_finite()
            || !self.close.is_finite()
    }
}

/// A single tick-level trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: i64,
    pub side: TradeSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
    Unknown,
}

/// Per-client mapping of instrument -> subscribed timeframes. 1-minute is
/// implicitly tracked for any instrument with at least one live timeframe
/// (so 1m bars can be cached), but is not itself a member of the set the
/// client asked for.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    pub by_instrument: HashMap<String, HashSet<String>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, instrument: &str, timeframe: &str) {
        self.by_instrument
            .entry(instrument.to_string())
            .or_default()
            .insert(timeframe.to_string());
    }

    pub fn remove(&mut self, instrument: &str, timeframe: &str) {
        if let Some(set) = self.by_instrument.get_mut(instrument) {
            set.remove(timeframe);
        }
    }

    pub fn timeframes_for(&self, instrument: &str) -> Option<&HashSet<String>> {
        self.by_instrument.get(instrument)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &String> {
        self.by_instrument.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instrument.values().all(|s| s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bar_detection() {
        let mut bar = Bar {
            instrument: "ES".into(),
            timeframe: "1m".into(),
            timestamp: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0,
            source: None,
            is_closed: true,
        };
        assert!(bar.is_null());
        bar.volume = 10;
        assert!(!bar.is_null());
        bar.high = f64::NAN;
        assert!(bar.is_null());
    }

    #[test]
    fn subscription_set_add_remove() {
        let mut subs = SubscriptionSet::new();
        subs.add("ES", "5m");
        subs.add("ES", "1h");
        assert_eq!(subs.timeframes_for("ES").unwrap().len(), 2);
        subs.remove("ES", "5m");
        assert_eq!(subs.timeframes_for("ES").unwrap().len(), 1);
        assert!(subs.timeframes_for("NQ").is_none());
    }
}
