/// Durable 1-minute bar cache (spec component C).
///
/// Generalizes `database.rs`'s single-provider `candlesticks` table to a
/// `(instrument, timeframe, timestamp)` composite key, and sets WAL mode,
/// normal synchronous durability, and a 128MiB page cache once at open —
/// ambient durability the original never configured.
use crate::error::Result;
use crate::model::Bar;
use rusqlite::{Connection, params};
use std::path::Path;

pub struct BarCache {
    conn: Connection,
}

/// Optional filter for `clear`.
#[derive(Debug, Default, Clone)]
pub struct ClearFilter {
    pub instrument: Option<String>,
    pub timeframe: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl BarCache {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(Path::new(db_path))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-131072;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bars_1m (
                instrument TEXT NOT NULL,
                timeframe  TEXT NOT NULL,
                timestamp  INTEGER NOT NULL,
                open  REAL NOT NULL,
                high  REAL NOT NULL,
                low   REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (instrument, timeframe, timestamp)
            )",
            [],
        )?;
        Ok(())
    }

    /// Rows ordered by timestamp ascending.
    pub fn get_range(
        &self,
        instrument: &str,
        timeframe: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, open, high, low, close, volume FROM bars_1m
             WHERE instrument = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;
        let bars = stmt
            .query_map(params![instrument, timeframe, start_ms, end_ms], |row| {
                Ok(Bar {
                    instrument: instrument.to_string(),
                    timeframe: timeframe.to_string(),
                    timestamp: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    source: Some(crate::model::SourceTag::Cache),
                    is_closed: true,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    /// Inserts a batch within a single transaction. Null bars are filtered
    /// out before the transaction begins and logged as skipped.
    /// Upsert-by-primary-key semantics (INSERT OR REPLACE).
    pub fn insert_batch(&mut self, bars: &[Bar]) -> Result<usize> {
        let (valid, skipped): (Vec<&Bar>, Vec<&Bar>) =
            bars.iter().partition(|b| !b.is_null());
        if !skipped.is_empty() {
            tracing::debug!(count = skipped.len(), "skipping null bars before cache insert");
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO bars_1m
                 (instrument, timeframe, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for b in &valid {
                stmt.execute(params![
                    b.instrument,
                    b.timeframe,
                    b.timestamp,
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(valid.len())
    }

    pub fn clear(&mut self, filter: &ClearFilter) -> Result<usize> {
        let mut sql = String::from("DELETE FROM bars_1m WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(i) = &filter.instrument {
            sql.push_str(" AND instrument = ?");
            binds.push(Box::new(i.clone()));
        }
        if let Some(t) = &filter.timeframe {
            sql.push_str(" AND timeframe = ?");
            binds.push(Box::new(t.clone()));
        }
        if let Some(s) = filter.start_ms {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Box::new(s));
        }
        if let Some(e) = filter.end_ms {
            sql.push_str(" AND timestamp <= ?");
            binds.push(Box::new(e));
        }
        let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let n = self.conn.execute(&sql, param_refs.as_slice())?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;

    fn bar(ts: i64, vol: i64) -> Bar {
        Bar {
            instrument: "ES".into(),
            timeframe: "1m".into(),
            timestamp: ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: vol,
            source: Some(SourceTag::Historical),
            is_closed: true,
        }
    }

    #[test]
    fn null_bars_are_never_persisted() {
        let mut cache = BarCache::open_in_memory().unwrap();
        let bars = vec![bar(0, 10), bar(60_000, 0)];
        let inserted = cache.insert_batch(&bars).unwrap();
        assert_eq!(inserted, 1);
        let range = cache.get_range("ES", "1m", 0, 120_000).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].timestamp, 0);
    }

    #[test]
    fn upsert_replaces_on_conflict() {
        let mut cache = BarCache::open_in_memory().unwrap();
        cache.insert_batch(&[bar(0, 10)]).unwrap();
        let mut updated = bar(0, 20);
        updated.close = 123.0;
        cache.insert_batch(&[updated]).unwrap();
        let range = cache.get_range("ES", "1m", 0, 0).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].volume, 20);
        assert_eq!(range[0].close, 123.0);
    }

    #[test]
    fn clear_by_range() {
        let mut cache = BarCache::open_in_memory().unwrap();
        cache
            .insert_batch(&[bar(0, 10), bar(60_000, 10), bar(120_000, 10)])
            .unwrap();
        let removed = cache
            .clear(&ClearFilter {
                instrument: Some("ES".into()),
                timeframe: Some("1m".into()),
                start_ms: Some(60_000),
                end_ms: None,
            })
            .unwrap();
        assert_eq!(removed, 2);
        let remaining = cache.get_range("ES", "1m", 0, 200_000).unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
