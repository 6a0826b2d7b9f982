/// Deterministic playback of a pre-fetched 1-minute series at a configurable
/// wall-clock speed (spec component H). Drives the virtual clock by
/// recomputing the next deadline from `tokio::time::Instant` rather than
/// ticking a fixed interval, per the timer-drift design note — the interval
/// still changes the sleep length on `modify_replay`, but never accumulates
/// scheduling jitter across ticks.
use crate::model::Bar;
use crate::timeframe::{self, SessionCalendar};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};

const ONE_MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub enum ReplayEvent {
    Bar(Bar),
    Complete,
}

pub struct ReplaySeries {
    pub instrument: String,
    pub timeframes: Vec<String>,
    pub bars_1m: Vec<Bar>,
}

struct PerInstrumentState {
    next_idx: usize,
    open_higher: HashMap<String, Bar>,
}

/// Shared knobs a running replay consults each tick; `modify_replay` mutates
/// these without tearing down the task.
pub struct ReplayControls {
    inner: Mutex<ControlState>,
}

struct ControlState {
    paused: bool,
    interval_ms: u64,
}

impl ReplayControls {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            inner: Mutex::new(ControlState {
                paused: false,
                interval_ms,
            }),
        }
    }

    pub async fn set_paused(&self, paused: bool) {
        self.inner.lock().await.paused = paused;
    }

    pub async fn set_interval_ms(&self, interval_ms: u64) {
        self.inner.lock().await.interval_ms = interval_ms;
    }

    async fn snapshot(&self) -> (bool, u64) {
        let s = self.inner.lock().await;
        (s.paused, s.interval_ms)
    }
}

/// Runs the replay loop to completion, sending each emitted bar and the
/// final completion marker on `out`. `live_start`/`live_end` bound the
/// ticking phase; bars before `live_start` are emitted once, immediately,
/// fully closed.
pub async fn run(
    calendar: &SessionCalendar,
    series: Vec<ReplaySeries>,
    live_start: i64,
    live_end: i64,
    controls: &ReplayControls,
    out: mpsc::Sender<ReplayEvent>,
) {
    let mut states: HashMap<String, PerInstrumentState> = HashMap::new();
    let mut per_instrument_higher_open: HashMap<String, HashMap<String, Bar>> = HashMap::new();

    for s in &series {
        let mut idx = 0usize;
        while idx < s.bars_1m.len() && s.bars_1m[idx].timestamp < live_start {
            if out.send(ReplayEvent::Bar(s.bars_1m[idx].clone())).await.is_err() {
                return;
            }
            idx += 1;
        }
        if idx > 0 {
            let history_start = s.bars_1m[0].timestamp;
            for tf in &s.timeframes {
                if let Ok(agg) = crate::aggregator::aggregate(
                    calendar,
                    &s.instrument,
                    tf,
                    history_start,
                    live_start - 1,
                    &s.bars_1m[..idx],
                ) {
                    for mut b in agg {
                        b.is_closed = true;
                        if out.send(ReplayEvent::Bar(b)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        states.insert(
            s.instrument.clone(),
            PerInstrumentState {
                next_idx: idx,
                open_higher: HashMap::new(),
            },
        );
        per_instrument_higher_open.insert(s.instrument.clone(), HashMap::new());
    }

    let mut virtual_t = live_start;
    let mut deadline = Instant::now();

    loop {
        let (paused, interval_ms) = controls.snapshot().await;
        if paused {
            tokio::time::sleep(Duration::from_millis(50)).await;
            deadline = Instant::now() + Duration::from_millis(interval_ms);
            continue;
        }

        tokio::time::sleep_until(deadline).await;

        let mut any_due = false;
        for s in &series {
            let Some(state) = states.get_mut(&s.instrument) else { continue };
            while state.next_idx < s.bars_1m.len() && s.bars_1m[state.next_idx].timestamp <= virtual_t {
                any_due = true;
                let bar = s.bars_1m[state.next_idx].clone();
                let mut emitted = bar.clone();
                emitted.source = Some(crate::model::SourceTag::Trade);
                emitted.is_closed = true;
                if out.send(ReplayEvent::Bar(emitted)).await.is_err() {
                    return;
                }

                for tf in &s.timeframes {
                    let interval = match timeframe::parse(tf) {
                        Ok(i) => i,
                        Err(_) => continue,
                    };
                    let bucket = calendar.bucket(bar.timestamp, interval);
                    let higher_open = per_instrument_higher_open
                        .get_mut(&s.instrument)
                        .expect("inserted above");
                    let current = higher_open.entry(tf.clone()).or_insert_with(|| Bar {
                        instrument: s.instrument.clone(),
                        timeframe: tf.clone(),
                        timestamp: bucket,
                        open: bar.open,
                        high: bar.high,
                        low: bar.low,
                        close: bar.close,
                        volume: 0,
                        source: Some(crate::model::SourceTag::Trade),
                        is_closed: false,
                    });
                    if current.timestamp != bucket {
                        *current = Bar {
                            instrument: s.instrument.clone(),
                            timeframe: tf.clone(),
                            timestamp: bucket,
                            open: bar.open,
                            high: bar.high,
                            low: bar.low,
                            close: bar.close,
                            volume: bar.volume,
                            source: Some(crate::model::SourceTag::Trade),
                            is_closed: false,
                        };
                    } else {
                        current.high = current.high.max(bar.high);
                        current.low = current.low.min(bar.low);
                        current.close = bar.close;
                        current.volume += bar.volume;
                    }
                    let terminal_slot = bucket + interval - ONE_MINUTE_MS;
                    current.is_closed = bar.timestamp == terminal_slot;
                    let emit = current.clone();
                    if emit.is_closed {
                        higher_open.remove(tf);
                    }
                    if out.send(ReplayEvent::Bar(emit)).await.is_err() {
                        return;
                    }
                }

                state.next_idx += 1;
            }
        }

        if virtual_t > live_end {
            break;
        }

        if !any_due {
            let next_future_ts = series
                .iter()
                .filter_map(|s| {
                    states
                        .get(&s.instrument)
                        .and_then(|st| s.bars_1m.get(st.next_idx))
                        .map(|b| b.timestamp)
                })
                .filter(|&ts| ts <= live_end)
                .min();
            match next_future_ts {
                Some(ts) => virtual_t = ts,
                None => break,
            }
        } else {
            virtual_t += ONE_MINUTE_MS;
        }

        if virtual_t > live_end {
            let (_, interval_ms) = controls.snapshot().await;
            deadline = Instant::now() + Duration::from_millis(interval_ms);
            continue;
        }

        let (_, interval_ms) = controls.snapshot().await;
        deadline += Duration::from_millis(interval_ms);
        if deadline < Instant::now() {
            deadline = Instant::now();
        }
    }

    let _ = out.send(ReplayEvent::Complete).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;

    fn bar(ts: i64) -> Bar {
        Bar {
            instrument: "ES".into(),
            timeframe: "1m".into(),
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
            source: Some(SourceTag::Historical),
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn replay_emits_history_then_completes() {
        let cal = SessionCalendar::new();
        let series = vec![ReplaySeries {
            instrument: "ES".into(),
            timeframes: vec!["1m".into()],
            bars_1m: vec![bar(0), bar(60_000)],
        }];
        let controls = ReplayControls::new(1);
        let (tx, mut rx) = mpsc::channel(64);
        run(&cal, series, 120_000, 120_000, &controls, tx).await;
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(matches!(events.last(), Some(ReplayEvent::Complete)));
    }

    #[tokio::test]
    async fn pause_stops_emission_until_resumed() {
        let controls = ReplayControls::new(50);
        controls.set_paused(true).await;
        assert!(controls.snapshot().await.0);
        controls.set_paused(false).await;
        controls.set_interval_ms(10).await;
        let (paused, interval) = controls.snapshot().await;
        assert!(!paused);
        assert_eq!(interval, 10);
    }
}
