/// Folds a chronologically sorted 1-minute series into a higher-timeframe
/// series (spec component E). Pure and synchronous — no I/O, no vendor or
/// cache dependency — so it is exercised directly by the scenario tests.
use crate::model::Bar;
use crate::timeframe::{self, SessionCalendar};

/// Aggregates `series` (ascending by timestamp, 1-minute bars only) into
/// `timeframe` bars covering `[start, end]`. `"1m"` is a passthrough filter.
pub fn aggregate(
    calendar: &SessionCalendar,
    instrument: &str,
    target_timeframe: &str,
    start: i64,
    end: i64,
    series: &[Bar],
) -> crate::error::Result<Vec<Bar>> {
    if target_timeframe == "1m" {
        return Ok(series
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect());
    }

    let interval = timeframe::parse(target_timeframe)?;
    let max_ts = series.iter().map(|b| b.timestamp).max();

    let mut out: Vec<Bar> = Vec::new();
    let mut open: Option<Bar> = None;

    for bar in series {
        let bucket = calendar.bucket(bar.timestamp, interval);
        match &mut open {
            Some(current) if current.timestamp == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => {
                if let Some(prev) = open.take() {
                    out.push(prev);
                }
                open = Some(Bar {
                    instrument: instrument.to_string(),
                    timeframe: target_timeframe.to_string(),
                    timestamp: bucket,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    source: Some(crate::model::SourceTag::Aggregated),
                    is_closed: false,
                });
            }
        }
    }
    if let Some(last) = open {
        out.push(last);
    }

    if let Some(max_ts) = max_ts {
        for bar in &mut out {
            bar.is_closed = is_bucket_closed(bar.timestamp, interval, max_ts, series);
        }
    }

    Ok(out
        .into_iter()
        .filter(|b| b.timestamp >= start && b.timestamp <= end)
        .collect())
}

/// An output bar starting at `bucket_start` is closed iff some 1-minute bar
/// at or past `bucket_start + interval` is present, or the bucket's terminal
/// 1-minute slot (`bucket_start + interval - 60_000`) is present.
fn is_bucket_closed(bucket_start: i64, interval: i64, max_ts: i64, series: &[Bar]) -> bool {
    if max_ts >= bucket_start + interval {
        return true;
    }
    let terminal_slot = bucket_start + interval - timeframe::MS_PER_MINUTE;
    series.iter().any(|b| b.timestamp == terminal_slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;

    fn one_min(ts: i64, o: f64, h: f64, l: f64, c: f64, v: i64) -> Bar {
        Bar {
            instrument: "ES".into(),
            timeframe: "1m".into(),
            timestamp: ts,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            source: Some(SourceTag::Historical),
            is_closed: true,
        }
    }

    const MIN: i64 = 60_000;

    #[test]
    fn closed_open_split_s1() {
        let cal = SessionCalendar::new();
        let base = 9 * 3_600_000i64; // 09:00 UTC-ish epoch offset for test purposes
        let series = vec![
            one_min(base, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + MIN, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + 2 * MIN, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + 3 * MIN, 100.0, 101.0, 99.0, 100.0, 10),
        ];
        let out = aggregate(&cal, "ES", "5m", base, base + 5 * MIN, &series).unwrap();
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!(b.open, 100.0);
        assert_eq!(b.high, 101.0);
        assert_eq!(b.low, 99.0);
        assert_eq!(b.close, 100.0);
        assert_eq!(b.volume, 40);
        assert!(!b.is_closed);
    }

    #[test]
    fn trailing_bar_closes_bucket_s2() {
        let cal = SessionCalendar::new();
        let base = 9 * 3_600_000i64;
        let series = vec![
            one_min(base, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + MIN, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + 2 * MIN, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + 3 * MIN, 100.0, 101.0, 99.0, 100.0, 10),
            one_min(base + 4 * MIN, 101.0, 102.0, 100.0, 101.0, 5),
        ];
        let out = aggregate(&cal, "ES", "5m", base, base + 5 * MIN, &series).unwrap();
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!(b.open, 100.0);
        assert_eq!(b.high, 102.0);
        assert_eq!(b.low, 99.0);
        assert_eq!(b.close, 101.0);
        assert_eq!(b.volume, 45);
        assert!(b.is_closed);
    }

    #[test]
    fn later_activity_closes_an_earlier_bucket() {
        let cal = SessionCalendar::new();
        let base = 0i64;
        let series = vec![
            one_min(base, 100.0, 100.0, 100.0, 100.0, 1),
            one_min(base + 5 * MIN, 200.0, 200.0, 200.0, 200.0, 1),
        ];
        let out = aggregate(&cal, "ES", "5m", base, base + 10 * MIN, &series).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_closed);
    }

    #[test]
    fn one_minute_passthrough_filters_range() {
        let cal = SessionCalendar::new();
        let series = vec![one_min(0, 1.0, 1.0, 1.0, 1.0, 1), one_min(MIN, 1.0, 1.0, 1.0, 1.0, 1)];
        let out = aggregate(&cal, "ES", "1m", 0, 0, &series).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 0);
    }
}
