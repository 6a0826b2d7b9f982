/// Standalone historical backfill CLI. Adapts `backfill.rs`'s
/// `BackfillOptions`/`run_backfill` round-robin-over-timeframes loop to the
/// new `BarCache`/`VendorClient` abstractions: only 1-minute bars are ever
/// stored, higher timeframes are derived on demand by the aggregator.
use anyhow::Result;
use clap::Parser;
use market_data_engine::cache::BarCache;
use market_data_engine::config::Config;
use market_data_engine::vendor::{HttpWsVendorClient, VendorClient};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(about = "Backfill the 1-minute bar cache for an instrument")]
struct Args {
    #[arg(long)]
    instrument: String,
    /// ISO start date, e.g. 2024-01-01T00:00:00Z
    #[arg(long)]
    start_date: String,
    #[arg(long)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    let start_ms = chrono::DateTime::parse_from_rfc3339(&args.start_date)?.timestamp_millis();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let cache = Arc::new(Mutex::new(BarCache::open(&config.db_path)?));
    let vendor = HttpWsVendorClient::new(
        config.vendor_historical_url.clone(),
        config.vendor_ws_url.clone(),
        config.vendor_api_key.clone(),
    );

    tracing::info!(instrument = %args.instrument, start = args.start_date, "starting backfill");

    let mut cursor = start_ms;
    const BATCH_MS: i64 = 24 * 3_600_000;
    while cursor < now_ms {
        let batch_end = (cursor + BATCH_MS).min(now_ms);
        let bars = vendor
            .fetch_historical(&args.instrument, cursor, batch_end)
            .await?;
        let inserted = {
            let mut cache = cache.lock().await;
            cache.insert_batch(&bars)?
        };
        tracing::info!(
            instrument = %args.instrument,
            batch_start = cursor,
            batch_end,
            inserted,
            "backfill batch complete"
        );
        cursor = batch_end;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    tracing::info!(instrument = %args.instrument, "backfill complete");
    Ok(())
}
