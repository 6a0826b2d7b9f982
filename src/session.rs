/// Per-client session state machine (spec component G): subscriptions, open
/// candle tables, trade FIFO queue, and the `idle` / `live_active` /
/// `replay_active` / `changing_timeframes` transitions. Generalizes
/// `web_server.rs`'s `WsSession` actor (which conflated transport and state
/// onto one object) into a transport-agnostic driver, per the "ad-hoc object
/// container" redesign note: one explicit state enum instead of a boolean
/// flag, and trades delivered over a channel instead of a callback.
use crate::acquisition::{AcquisitionOrchestrator, AcquisitionRequest};
use crate::aggregator;
use crate::live_updater::InstrumentUpdater;
use crate::model::{Bar, SubscriptionSet, Trade};
use crate::replay::{self, ReplayControls, ReplayEvent, ReplaySeries};
use crate::timeframe::SessionCalendar;
use crate::vendor::{TradeSubscription, VendorClient};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LiveActive,
    ReplayActive,
    ChangingTimeframes,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("rejected in state {0:?}")]
    Rejected(SessionState),
}

/// Output sink abstraction: the session emits bars and control messages here
/// without knowing whether the far end is a WebSocket, a log file, or a
/// console print (mirrors the `sendto` options in the request envelope).
#[async_trait::async_trait]
pub trait OutputSink: Send + Sync {
    async fn emit_bar(&self, bar: &Bar);
    async fn emit_control(&self, message: &str);
}

pub struct Session<V: VendorClient, S: OutputSink> {
    pub client_id: Option<String>,
    state: SessionState,
    subscriptions: SubscriptionSet,
    updaters: HashMap<String, InstrumentUpdater>,
    trade_queue: Vec<Trade>,
    original_start_ms: i64,
    calendar: Arc<SessionCalendar>,
    orchestrator: Arc<AcquisitionOrchestrator<V>>,
    sink: Arc<S>,
    trade_subscription: Option<TradeSubscription>,
    trade_rx: Option<mpsc::Receiver<Trade>>,
    replay_controls: Option<Arc<ReplayControls>>,
    replay_task: Option<tokio::task::JoinHandle<()>>,
    replay_forward_task: Option<tokio::task::JoinHandle<()>>,
}

impl<V: VendorClient, S: OutputSink + 'static> Session<V, S> {
    pub fn new(
        calendar: Arc<SessionCalendar>,
        orchestrator: Arc<AcquisitionOrchestrator<V>>,
        sink: Arc<S>,
    ) -> Self {
        Self {
            client_id: None,
            state: SessionState::Idle,
            subscriptions: SubscriptionSet::new(),
            updaters: HashMap::new(),
            trade_queue: Vec::new(),
            original_start_ms: 0,
            calendar,
            orchestrator,
            sink,
            trade_subscription: None,
            trade_rx: None,
            replay_controls: None,
            replay_task: None,
            replay_forward_task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_client_id(&mut self, id: &str) {
        self.client_id = Some(id.to_string());
    }

    /// `get_data` with a live component: starts fetchers/trade subscription
    /// for every requested (instrument, timeframe).
    pub async fn get_data_live(
        &mut self,
        subscriptions: &[(String, String)],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::LiveActive => {}
            other => return Err(SessionError::Rejected(other)),
        }
        self.original_start_ms = start_ms;
        for (instrument, timeframe) in subscriptions {
            self.subscriptions.add(instrument, timeframe);
        }
        for instrument in self.subscriptions.instruments().cloned().collect::<Vec<_>>() {
            self.emit_history_and_seed(&instrument, start_ms, end_ms).await;
        }
        self.start_trade_subscription().await;
        self.state = SessionState::LiveActive;
        Ok(())
    }

    /// (Re)opens the trade stream covering every currently subscribed
    /// instrument. Replaces any prior subscription so newly added
    /// instruments are included; dropping the old handle tears it down.
    async fn start_trade_subscription(&mut self) {
        let instruments: Vec<String> = self.subscriptions.instruments().cloned().collect();
        if instruments.is_empty() {
            return;
        }
        let (trade_tx, trade_rx) = mpsc::channel(256);
        let (control_tx, mut control_rx) = mpsc::channel(64);
        let vendor = self.orchestrator.vendor();
        let start_ts_ns = now_ms() * 1_000_000;
        match vendor
            .subscribe_live_trades(&instruments, start_ts_ns, trade_tx, control_tx)
            .await
        {
            Ok(sub) => {
                self.trade_subscription = Some(sub);
                self.trade_rx = Some(trade_rx);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start live trade subscription");
                return;
            }
        }

        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(ctrl) = control_rx.recv().await {
                sink.emit_control(&format!("{ctrl:?}")).await;
            }
        });
    }

    /// Awaits the next trade from the live subscription, if one is open.
    /// A caller drives this alongside its request loop (e.g. via
    /// `tokio::select!`) and routes the result into `on_trade`.
    pub async fn recv_trade(&mut self) -> Option<Trade> {
        let Some(rx) = &mut self.trade_rx else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Some(trade) => Some(trade),
            None => {
                // Subscription ended (vendor closed, retries exhausted);
                // stop polling a drained channel instead of resolving
                // immediately forever.
                self.trade_rx = None;
                std::future::pending().await
            }
        }
    }

    /// `get_data` with `live_data=none`: emit history only, state unchanged.
    pub async fn get_data_history_only(
        &mut self,
        subscriptions: &[(String, String)],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(), SessionError> {
        for (instrument, timeframe) in subscriptions {
            let req = AcquisitionRequest {
                start_ms,
                end_ms,
                end_is_explicit: true,
                use_cache: true,
                save_cache: true,
            };
            if let Ok(series) = self.orchestrator.acquire(instrument, req).await {
                if let Ok(bars) =
                    aggregator::aggregate(&self.calendar, instrument, timeframe, start_ms, end_ms, &series)
                {
                    for b in bars {
                        self.sink.emit_bar(&b).await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stop_data(&mut self) {
        if matches!(self.state, SessionState::LiveActive | SessionState::ChangingTimeframes) {
            self.state = SessionState::Idle;
            self.updaters.clear();
            self.trade_queue.clear();
            self.trade_subscription = None;
            self.trade_rx = None;
        }
    }

    /// Adds a timeframe to a live session: re-fetches history for the new
    /// timeframe, seeds its open higher-timeframe candle, then drains any
    /// trades queued while the acquisition was in flight.
    pub async fn add_timeframe(
        &mut self,
        instrument: &str,
        timeframe: &str,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::LiveActive {
            if self.state == SessionState::ChangingTimeframes {
                // queue is still accepted; the caller should not add another
                // timeframe mid-transition in this design, reject instead.
            }
            return Err(SessionError::Rejected(self.state));
        }

        self.subscriptions.add(instrument, timeframe);
        self.state = SessionState::ChangingTimeframes;

        let now = now_ms();
        let req = AcquisitionRequest {
            start_ms: self.original_start_ms,
            end_ms: now,
            end_is_explicit: false,
            use_cache: true,
            save_cache: true,
        };
        let series = self
            .orchestrator
            .acquire(instrument, req)
            .await
            .unwrap_or_default();
        let historical = aggregator::aggregate(
            &self.calendar,
            instrument,
            timeframe,
            self.original_start_ms,
            now,
            &series,
        )
        .unwrap_or_default();
        for b in &historical {
            self.sink.emit_bar(b).await;
        }

        let last_aggregated = historical.last();
        let updater = self
            .updaters
            .entry(instrument.to_string())
            .or_insert_with(|| InstrumentUpdater::new(instrument, now));
        let next_1m_start = updater.open_1m_candle().timestamp;
        updater.seed_higher_timeframe(&self.calendar, timeframe, last_aggregated, next_1m_start);

        self.state = SessionState::LiveActive;
        self.drain_trade_queue().await;
        Ok(())
    }

    pub fn remove_timeframe(&mut self, instrument: &str, timeframe: &str) {
        self.subscriptions.remove(instrument, timeframe);
        if let Some(updater) = self.updaters.get_mut(instrument) {
            updater.remove_timeframe(timeframe);
        }
    }

    /// `get_replay`: fetches the full pre-fetched series for every requested
    /// instrument up front, then spawns the replay tick loop, forwarding its
    /// events into the sink as they're produced.
    pub async fn get_replay(
        &mut self,
        subscriptions: &[(String, String)],
        history_start_ms: i64,
        live_start_ms: i64,
        live_end_ms: i64,
        replay_interval_ms: u64,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Rejected(self.state));
        }
        for (instrument, timeframe) in subscriptions {
            self.subscriptions.add(instrument, timeframe);
        }

        let fetch_end = if live_end_ms == i64::MAX { now_ms() } else { live_end_ms };

        let mut series = Vec::new();
        for instrument in self.subscriptions.instruments().cloned().collect::<Vec<_>>() {
            let req = AcquisitionRequest {
                start_ms: history_start_ms,
                end_ms: fetch_end,
                end_is_explicit: true,
                use_cache: true,
                save_cache: true,
            };
            let bars_1m = self.orchestrator.acquire(&instrument, req).await.unwrap_or_default();
            let timeframes: Vec<String> = self
                .subscriptions
                .timeframes_for(&instrument)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            series.push(ReplaySeries {
                instrument,
                timeframes,
                bars_1m,
            });
        }

        let controls = Arc::new(ReplayControls::new(replay_interval_ms));
        let (tx, mut rx) = mpsc::channel(256);
        let calendar = self.calendar.clone();
        let controls_for_task = controls.clone();
        let run_task = tokio::spawn(async move {
            replay::run(&calendar, series, live_start_ms, fetch_end, &controls_for_task, tx).await;
        });

        let sink = self.sink.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ReplayEvent::Bar(bar) => sink.emit_bar(&bar).await,
                    ReplayEvent::Complete => {
                        sink.emit_control("replay_complete").await;
                        break;
                    }
                }
            }
        });

        self.replay_controls = Some(controls);
        self.replay_task = Some(run_task);
        self.replay_forward_task = Some(forward_task);
        self.state = SessionState::ReplayActive;
        Ok(())
    }

    pub async fn modify_replay(
        &mut self,
        pause: Option<bool>,
        interval_ms: Option<u64>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::ReplayActive {
            return Err(SessionError::Rejected(self.state));
        }
        if let Some(controls) = &self.replay_controls {
            if let Some(p) = pause {
                controls.set_paused(p).await;
            }
            if let Some(i) = interval_ms {
                controls.set_interval_ms(i).await;
            }
        }
        Ok(())
    }

    pub async fn stop_replay(&mut self) {
        if let Some(task) = self.replay_task.take() {
            task.abort();
        }
        if let Some(task) = self.replay_forward_task.take() {
            task.abort();
        }
        self.replay_controls = None;
        if self.state == SessionState::ReplayActive {
            self.state = SessionState::Idle;
        }
    }

    /// Routes an incoming trade: queued while `changing_timeframes`, applied
    /// immediately otherwise.
    pub async fn on_trade(&mut self, trade: Trade) {
        if self.state == SessionState::ChangingTimeframes {
            self.trade_queue.push(trade);
            return;
        }
        self.apply_trade(&trade).await;
    }

    async fn drain_trade_queue(&mut self) {
        let queued = std::mem::take(&mut self.trade_queue);
        for trade in queued {
            self.apply_trade(&trade).await;
        }
    }

    async fn apply_trade(&mut self, trade: &Trade) {
        let updater = self
            .updaters
            .entry(trade.instrument.clone())
            .or_insert_with(|| InstrumentUpdater::new(&trade.instrument, trade.timestamp_ms));
        let emitted = updater.on_trade(&self.calendar, trade);
        for bar in emitted {
            self.sink.emit_bar(&bar).await;
        }
    }

    async fn emit_history_and_seed(&mut self, instrument: &str, start_ms: i64, end_ms: i64) {
        let req = AcquisitionRequest {
            start_ms,
            end_ms,
            end_is_explicit: false,
            use_cache: true,
            save_cache: true,
        };
        let series = self.orchestrator.acquire(instrument, req).await.unwrap_or_default();
        let timeframes = self
            .subscriptions
            .timeframes_for(instrument)
            .cloned()
            .unwrap_or_default();

        let last_1m_end = series.last().map(|b| b.timestamp + 60_000).unwrap_or(end_ms);
        let updater = self
            .updaters
            .entry(instrument.to_string())
            .or_insert_with(|| InstrumentUpdater::new(instrument, last_1m_end));

        for tf in &timeframes {
            if let Ok(bars) =
                aggregator::aggregate(&self.calendar, instrument, tf, start_ms, end_ms, &series)
            {
                let last = bars.last().cloned();
                for b in &bars {
                    self.sink.emit_bar(b).await;
                }
                updater.seed_higher_timeframe(&self.calendar, tf, last.as_ref(), last_1m_end);
            }
        }
    }
}

/// Acquisition requests in this module use the caller-supplied `end_ms`
/// directly; a transport layer resolves "now" before calling in. This
/// helper is only consulted where no caller-supplied timestamp exists
/// (`add_timeframe`'s implicit "now", a `get_replay` with an open-ended
/// `live_end`).
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BarCache;
    use crate::error::Result;
    use crate::model::TradeSide;
    use crate::vendor::{ControlMessage, TradeSubscription};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{mpsc, Mutex};

    struct NullVendor;

    #[async_trait]
    impl VendorClient for NullVendor {
        async fn fetch_historical(&self, _i: &str, _s: i64, _e: i64) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn fetch_live_1m(&self, _i: &[String], _s: i64, _e: i64) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn subscribe_live_trades(
            &self,
            _i: &[String],
            _s: i64,
            _t: mpsc::Sender<Trade>,
            _c: mpsc::Sender<ControlMessage>,
        ) -> Result<TradeSubscription> {
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            let task = tokio::spawn(async move {
                let _ = shutdown_rx.await;
            });
            Ok(TradeSubscription::new(shutdown_tx, task))
        }
    }

    struct RecordingSink {
        bars: StdMutex<Vec<Bar>>,
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn emit_bar(&self, bar: &Bar) {
            self.bars.lock().unwrap().push(bar.clone());
        }
        async fn emit_control(&self, _message: &str) {}
    }

    fn new_session() -> Session<NullVendor, RecordingSink> {
        let cache = Arc::new(Mutex::new(BarCache::open_in_memory().unwrap()));
        let vendor = Arc::new(NullVendor);
        let orchestrator = Arc::new(AcquisitionOrchestrator::new(cache, vendor));
        let calendar = Arc::new(SessionCalendar::new());
        let sink = Arc::new(RecordingSink {
            bars: StdMutex::new(Vec::new()),
        });
        Session::new(calendar, orchestrator, sink)
    }

    #[tokio::test]
    async fn add_timeframe_rejected_outside_live_active() {
        let mut s = new_session();
        let result = s.add_timeframe("ES", "5m").await;
        assert!(matches!(result, Err(SessionError::Rejected(SessionState::Idle))));
    }

    #[tokio::test]
    async fn trades_queue_during_changing_timeframes_and_drain_in_order() {
        let mut s = new_session();
        s.get_data_live(&[("ES".into(), "1m".into())], 0, 0).await.unwrap();
        assert_eq!(s.state(), SessionState::LiveActive);

        // Force changing_timeframes to observe queueing in isolation.
        s.state = SessionState::ChangingTimeframes;
        let t1 = Trade {
            instrument: "ES".into(),
            timestamp_ms: 0,
            price: 100.0,
            size: 1,
            side: TradeSide::Buy,
        };
        let t2 = Trade {
            instrument: "ES".into(),
            timestamp_ms: 1,
            price: 101.0,
            size: 1,
            side: TradeSide::Buy,
        };
        s.on_trade(t1.clone()).await;
        s.on_trade(t2.clone()).await;
        assert_eq!(s.trade_queue.len(), 2);

        s.state = SessionState::LiveActive;
        s.drain_trade_queue().await;
        assert!(s.trade_queue.is_empty());
    }

    #[tokio::test]
    async fn stop_data_returns_to_idle() {
        let mut s = new_session();
        s.get_data_live(&[("ES".into(), "1m".into())], 0, 0).await.unwrap();
        s.stop_data().await;
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn get_replay_enters_replay_active_and_stop_replay_returns_to_idle() {
        let mut s = new_session();
        s.get_replay(&[("ES".into(), "1m".into())], 0, 60_000, 120_000, 1)
            .await
            .unwrap();
        assert_eq!(s.state(), SessionState::ReplayActive);

        let result = s.get_data_live(&[("ES".into(), "1m".into())], 0, 0).await;
        assert!(matches!(result, Err(SessionError::Rejected(SessionState::ReplayActive))));

        s.stop_replay().await;
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn modify_replay_rejected_outside_replay_active() {
        let mut s = new_session();
        let result = s.modify_replay(Some(true), None).await;
        assert!(matches!(result, Err(SessionError::Rejected(SessionState::Idle))));
    }
}
