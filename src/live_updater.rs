/// Per-client, per-instrument live candle state (spec component F): one open
/// 1-minute candle plus one open candle per subscribed higher timeframe,
/// folding arriving trades and rolling bars over at bucket boundaries.
/// Grounded in `realtime.rs`'s `RealtimeCandle` update-from-kline logic,
/// generalized from bar-driven updates to trade-driven folding.
use crate::model::{Bar, SourceTag, Trade};
use crate::timeframe::{self, SessionCalendar};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct InstrumentUpdater {
    instrument: String,
    open_1m: Bar,
    open_higher: HashMap<String, Bar>,
}

/// Emission produced by folding one trade: zero or more bars, each already
/// carrying whether it just closed.
pub type Emission = Vec<Bar>;

impl InstrumentUpdater {
    /// `last_1m_end` is the timestamp immediately after the last closed
    /// 1-minute bar; the open 1-minute candle starts empty there.
    pub fn new(instrument: &str, last_1m_end: i64) -> Self {
        Self {
            instrument: instrument.to_string(),
            open_1m: empty_bar(instrument, "1m", last_1m_end),
            open_higher: HashMap::new(),
        }
    }

    /// Seeds the open higher-timeframe candle for `timeframe`, either
    /// continuing `last_aggregated` if it is itself still open and matches
    /// the current bucket, or starting fresh at the bucket containing
    /// `next_1m_start`.
    pub fn seed_higher_timeframe(
        &mut self,
        calendar: &SessionCalendar,
        timeframe: &str,
        last_aggregated: Option<&Bar>,
        next_1m_start: i64,
    ) {
        let interval = match timeframe::parse(timeframe) {
            Ok(i) => i,
            Err(_) => return,
        };
        let bucket = calendar.bucket(next_1m_start, interval);
        let seeded = match last_aggregated {
            Some(b) if !b.is_closed && b.timestamp == bucket => {
                let mut b = b.clone();
                b.source = Some(SourceTag::Trade);
                b
            }
            _ => empty_bar(&self.instrument, timeframe, bucket),
        };
        self.open_higher.insert(timeframe.to_string(), seeded);
    }

    pub fn add_timeframe(&mut self, calendar: &SessionCalendar, timeframe: &str) {
        if !self.open_higher.contains_key(timeframe) {
            self.seed_higher_timeframe(calendar, timeframe, None, self.open_1m.timestamp);
        }
    }

    pub fn remove_timeframe(&mut self, timeframe: &str) {
        self.open_higher.remove(timeframe);
    }

    pub fn open_1m_candle(&self) -> &Bar {
        &self.open_1m
    }

    pub fn open_higher_candle(&self, timeframe: &str) -> Option<&Bar> {
        self.open_higher.get(timeframe)
    }

    /// Folds a trade into the open 1-minute and higher candles, returning
    /// every bar emitted in order (rollover close, new-bucket open, fold
    /// update).
    pub fn on_trade(&mut self, calendar: &SessionCalendar, x: &Trade) -> Emission {
        let mut out = Vec::new();

        if x.timestamp_ms < self.open_1m.timestamp {
            return out; // late trade before the tracked bucket
        }

        if x.timestamp_ms >= self.open_1m.timestamp + timeframe::MS_PER_MINUTE {
            self.open_1m.is_closed = true;
            out.push(self.open_1m.clone());
            let new_bucket = (x.timestamp_ms.div_euclid(timeframe::MS_PER_MINUTE))
                * timeframe::MS_PER_MINUTE;
            self.open_1m = seed_from_trade(&self.instrument, "1m", new_bucket, x);
            out.push(self.open_1m.clone());
        } else {
            fold_trade_into(&mut self.open_1m, x);
            out.push(self.open_1m.clone());
        }

        let timeframes: Vec<String> = self.open_higher.keys().cloned().collect();
        for tf in timeframes {
            let interval = match timeframe::parse(&tf) {
                Ok(i) => i,
                Err(_) => continue,
            };
            let current = self.open_higher.get_mut(&tf).expect("just listed");
            if x.timestamp_ms >= current.timestamp + interval {
                current.is_closed = true;
                out.push(current.clone());
                let new_bucket = calendar.bucket(x.timestamp_ms, interval);
                let seeded = seed_from_trade(&self.instrument, &tf, new_bucket, x);
                out.push(seeded.clone());
                self.open_higher.insert(tf, seeded);
            } else {
                fold_trade_into(current, x);
                out.push(current.clone());
            }
        }

        out
    }
}

fn empty_bar(instrument: &str, timeframe: &str, timestamp: i64) -> Bar {
    Bar {
        instrument: instrument.to_string(),
        timeframe: timeframe.to_string(),
        timestamp,
        open: f64::NAN,
        high: f64::NAN,
        low: f64::NAN,
        close: f64::NAN,
        volume: 0,
        source: Some(SourceTag::Trade),
        is_closed: false,
    }
}

fn seed_from_trade(instrument: &str, timeframe: &str, timestamp: i64, x: &Trade) -> Bar {
    Bar {
        instrument: instrument.to_string(),
        timeframe: timeframe.to_string(),
        timestamp,
        open: x.price,
        high: x.price,
        low: x.price,
        close: x.price,
        volume: x.size,
        source: Some(SourceTag::Trade),
        is_closed: false,
    }
}

fn fold_trade_into(bar: &mut Bar, x: &Trade) {
    if bar.open.is_nan() {
        bar.open = x.price;
        bar.high = x.price;
        bar.low = x.price;
    } else {
        bar.high = bar.high.max(x.price);
        bar.low = bar.low.min(x.price);
    }
    bar.close = x.price;
    bar.volume += x.size;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TradeSide;

    fn trade(ts: i64, price: f64, size: i64) -> Trade {
        Trade {
            instrument: "ES".into(),
            timestamp_ms: ts,
            price,
            size,
            side: TradeSide::Buy,
        }
    }

    #[test]
    fn folds_trades_into_open_1m_candle() {
        let cal = SessionCalendar::new();
        let mut u = InstrumentUpdater::new("ES", 0);
        u.on_trade(&cal, &trade(0, 100.0, 5));
        let emitted = u.on_trade(&cal, &trade(30_000, 102.0, 3));
        assert_eq!(emitted.len(), 1);
        let b = &emitted[0];
        assert_eq!(b.open, 100.0);
        assert_eq!(b.close, 102.0);
        assert_eq!(b.volume, 8);
        assert!(!b.is_closed);
    }

    #[test]
    fn rolls_over_1m_bucket_on_timestamp_past_boundary() {
        let cal = SessionCalendar::new();
        let mut u = InstrumentUpdater::new("ES", 0);
        u.on_trade(&cal, &trade(0, 100.0, 5));
        let emitted = u.on_trade(&cal, &trade(61_000, 110.0, 2));
        assert_eq!(emitted.len(), 2);
        assert!(emitted[0].is_closed);
        assert_eq!(emitted[0].timestamp, 0);
        assert!(!emitted[1].is_closed);
        assert_eq!(emitted[1].timestamp, 60_000);
        assert_eq!(emitted[1].open, 110.0);
    }

    #[test]
    fn late_trade_before_tracked_bucket_is_ignored() {
        let cal = SessionCalendar::new();
        let mut u = InstrumentUpdater::new("ES", 60_000);
        let emitted = u.on_trade(&cal, &trade(0, 100.0, 5));
        assert!(emitted.is_empty());
    }

    #[test]
    fn higher_timeframe_rolls_over_independently() {
        let cal = SessionCalendar::new();
        let mut u = InstrumentUpdater::new("ES", 0);
        u.seed_higher_timeframe(&cal, "5m", None, 0);
        u.on_trade(&cal, &trade(0, 100.0, 1));
        let emitted = u.on_trade(&cal, &trade(5 * 60_000, 200.0, 1));
        // 1m rolled over too since 5m >= 1m boundary
        assert!(emitted.iter().any(|b| b.timeframe == "5m" && b.is_closed));
        assert!(emitted
            .iter()
            .any(|b| b.timeframe == "5m" && !b.is_closed && b.open == 200.0));
    }
}
