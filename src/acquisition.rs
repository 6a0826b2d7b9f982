/// Combines the durable 1-minute cache with upstream historical and live
/// fetchers into one contiguous series (spec component D). Grounded in
/// `backfill.rs`'s resume-from-last-stored-candle loop, generalized with the
/// early/late cushion heuristics and the cache-vs-refetch decision.
use crate::cache::BarCache;
use crate::error::Result;
use crate::model::Bar;
use crate::vendor::VendorClient;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tolerance window within which a gap at the start of the range does not
/// trigger an upstream refetch.
pub const EARLY_CUSHION_MS: i64 = 3 * 24 * 3_600_000;
/// Tolerance window within which a gap at the end of the range (when the
/// caller meant "now") does not trigger an upstream refetch.
pub const LATE_CUSHION_MS: i64 = 3 * 3_600_000;

const ONE_MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionRequest {
    pub start_ms: i64,
    pub end_ms: i64,
    /// Whether `end_ms` was explicitly supplied by the caller rather than
    /// defaulted to "now". Explicit ends always force a late refetch.
    pub end_is_explicit: bool,
    pub use_cache: bool,
    pub save_cache: bool,
}

pub struct AcquisitionOrchestrator<V: VendorClient> {
    cache: Arc<Mutex<BarCache>>,
    vendor: Arc<V>,
}

impl<V: VendorClient> AcquisitionOrchestrator<V> {
    pub fn new(cache: Arc<Mutex<BarCache>>, vendor: Arc<V>) -> Self {
        Self { cache, vendor }
    }

    /// Hands out the underlying vendor handle for callers that need to open
    /// their own streaming subscription (the session's live trade feed).
    pub fn vendor(&self) -> Arc<V> {
        self.vendor.clone()
    }

    pub async fn acquire(&self, instrument: &str, req: AcquisitionRequest) -> Result<Vec<Bar>> {
        let mut combined: Vec<Bar> = if req.use_cache {
            let cache = self.cache.lock().await;
            cache.get_range(instrument, "1m", req.start_ms, req.end_ms)?
        } else {
            Vec::new()
        };

        if combined.is_empty() {
            let fetched = self
                .vendor
                .fetch_historical(instrument, req.start_ms, req.end_ms)
                .await?;
            if req.save_cache && !fetched.is_empty() {
                self.persist(&fetched).await;
            }
            combined = fetched;
        } else {
            let earliest = combined.iter().map(|b| b.timestamp).min().unwrap();
            let latest = combined.iter().map(|b| b.timestamp).max().unwrap();

            if req.start_ms < earliest && earliest - req.start_ms > EARLY_CUSHION_MS {
                match self
                    .vendor
                    .fetch_historical(instrument, req.start_ms, earliest - ONE_MINUTE_MS)
                    .await
                {
                    Ok(mut bars) => {
                        if req.save_cache && !bars.is_empty() {
                            self.persist(&bars).await;
                        }
                        bars.append(&mut combined);
                        combined = bars;
                    }
                    Err(e) => tracing::warn!(error = %e, "early cushion refetch failed"),
                }
            }

            let needs_late_refetch =
                req.end_is_explicit || (req.end_ms - latest) > LATE_CUSHION_MS;
            if req.end_ms > latest && needs_late_refetch {
                match self
                    .vendor
                    .fetch_historical(instrument, latest + ONE_MINUTE_MS, req.end_ms)
                    .await
                {
                    Ok(mut bars) => {
                        if req.save_cache && !bars.is_empty() {
                            self.persist(&bars).await;
                        }
                        combined.append(&mut bars);
                    }
                    Err(e) => tracing::warn!(error = %e, "late cushion refetch failed"),
                }
            }
        }

        if !req.end_is_explicit {
            match self
                .vendor
                .fetch_live_1m(&[instrument.to_string()], req.start_ms, req.end_ms)
                .await
            {
                Ok(mut live) => combined.append(&mut live),
                Err(e) => tracing::warn!(error = %e, "live tail fill failed"),
            }
        }

        combined.sort_by_key(|b| b.timestamp);
        combined.dedup_by_key(|b| b.timestamp);
        Ok(combined)
    }

    async fn persist(&self, bars: &[Bar]) {
        let mut cache = self.cache.lock().await;
        if let Err(e) = cache.insert_batch(bars) {
            tracing::warn!(error = %e, "failed to persist acquired bars");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;
    use crate::vendor::{ControlMessage, TradeSubscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct StubVendor {
        historical_calls: AtomicUsize,
        historical_bars: Vec<Bar>,
    }

    #[async_trait]
    impl VendorClient for StubVendor {
        async fn fetch_historical(
            &self,
            instrument: &str,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<Bar>> {
            self.historical_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .historical_bars
                .iter()
                .filter(|b| b.instrument == instrument && b.timestamp >= start_ms && b.timestamp <= end_ms)
                .cloned()
                .collect())
        }

        async fn fetch_live_1m(
            &self,
            _instruments: &[String],
            _start_ms: i64,
            _end_ms: i64,
        ) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }

        async fn subscribe_live_trades(
            &self,
            _instruments: &[String],
            _start_ts_ns: i64,
            _on_trade: mpsc::Sender<crate::model::Trade>,
            _on_control: mpsc::Sender<ControlMessage>,
        ) -> Result<TradeSubscription> {
            unimplemented!("not exercised by acquisition tests")
        }
    }

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
    async fn cushion_skip_no_refetch_s3() {
        let cache = Arc::new(Mutex::new(BarCache::open_in_memory().unwrap()));
        let two_days_ms = 2 * 24 * 3_600_000i64;
        let one_hour_ms = 3_600_000i64;
        let t = 10 * 24 * 3_600_000i64; // arbitrary anchor
        {
            let mut c = cache.lock().await;
            let mut bars = Vec::new();
            let mut ts = t - two_days_ms;
            while ts <= t - one_hour_ms {
                bars.push(bar(ts));
                ts += ONE_MINUTE_MS;
            }
            c.insert_batch(&bars).unwrap();
        }
        let vendor = Arc::new(StubVendor {
            historical_calls: AtomicUsize::new(0),
            historical_bars: Vec::new(),
        });
        let orchestrator = AcquisitionOrchestrator::new(cache, vendor.clone());
        let req = AcquisitionRequest {
            start_ms: t - two_days_ms - one_hour_ms,
            end_ms: t,
            end_is_explicit: false,
            use_cache: true,
            save_cache: true,
        };
        let result = orchestrator.acquire("ES", req).await.unwrap();
        assert_eq!(vendor.historical_calls.load(Ordering::SeqCst), 0);
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn explicit_end_always_forces_late_refetch() {
        let cache = Arc::new(Mutex::new(BarCache::open_in_memory().unwrap()));
        {
            let mut c = cache.lock().await;
            c.insert_batch(&[bar(0), bar(ONE_MINUTE_MS)]).unwrap();
        }
        let vendor = Arc::new(StubVendor {
            historical_calls: AtomicUsize::new(0),
            historical_bars: vec![bar(2 * ONE_MINUTE_MS)],
        });
        let orchestrator = AcquisitionOrchestrator::new(cache, vendor.clone());
        let req = AcquisitionRequest {
            start_ms: 0,
            end_ms: 2 * ONE_MINUTE_MS,
            end_is_explicit: true,
            use_cache: true,
            save_cache: false,
        };
        orchestrator.acquire("ES", req).await.unwrap();
        assert_eq!(vendor.historical_calls.load(Ordering::SeqCst), 1);
    }
}
