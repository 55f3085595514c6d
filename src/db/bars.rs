use rusqlite::{params, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::pool::DbPool;
use crate::error::HubError;

/// Width of the base aggregation bucket: one minute, in milliseconds.
pub const BUCKET_MS: i64 = 60_000;

/// Align a second-resolution timestamp to the start of its minute bucket (ms).
pub fn bucket_start_ms(ts_s: i64) -> i64 {
    ts_s.div_euclid(60) * BUCKET_MS
}

/// Which of the two per-launch OHLC series a bar belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BarKind {
    Price,
    Mcap,
}

impl BarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Mcap => "mcap",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "price" => Ok(Self::Price),
            "mcap" => Ok(Self::Mcap),
            other => Err(HubError::BadRequest(format!("unknown bar kind: {other}"))),
        }
    }
}

/// One persisted minute bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub series_id: String,
    pub kind: BarKind,
    /// Bucket start, ms since epoch, multiple of [`BUCKET_MS`].
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// For a `price` bar: the paired market cap at the same instant.
    pub aux_value: Option<Decimal>,
}

fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<Bar> {
    let kind_str: String = row.get(1)?;
    let kind = match kind_str.as_str() {
        "mcap" => BarKind::Mcap,
        _ => BarKind::Price,
    };
    let aux: Option<String> = row.get(7)?;
    let aux_value = match aux {
        Some(s) => Some(Decimal::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Bar {
        series_id: row.get(0)?,
        kind,
        bucket_start: row.get(2)?,
        open: dec_col(row, 3)?,
        high: dec_col(row, 4)?,
        low: dec_col(row, 5)?,
        close: dec_col(row, 6)?,
        aux_value,
    })
}

const SELECT_BAR: &str =
    "SELECT series_id, kind, bucket_start, open, high, low, close, aux_value FROM bars";

/// Persistent store of minute bars, keyed by (series, kind, bucket start).
///
/// Read-modify-write upserts are serialised by a per-series async lock so two
/// racing writers can never both observe an absent bucket and pick competing
/// opens.  Different series never contend.
pub struct BarStore {
    pool: DbPool,
    locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BarStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn series_lock(&self, series_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(series_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(series_id.to_string()).or_default())
    }

    /// Merge one tick value into the bar at `bucket_start`.
    ///
    /// A fresh bucket opens at the previous bucket's close when that bucket
    /// exists; after a gap (or for the first-ever bar) it opens at the tick
    /// value itself.  An existing bucket keeps its open and merges
    /// high/low/close.
    pub async fn upsert(
        &self,
        series_id: &str,
        kind: BarKind,
        bucket_start: i64,
        value: Decimal,
        aux: Option<Decimal>,
    ) -> Result<Bar, HubError> {
        let lock = self.series_lock(series_id).await;
        let _guard = lock.lock().await;

        let existing = self.get(series_id, kind, bucket_start)?;
        let bar = match existing {
            Some(mut bar) => {
                bar.high = bar.high.max(value);
                bar.low = bar.low.min(value);
                bar.close = value;
                if aux.is_some() {
                    bar.aux_value = aux;
                }
                bar
            }
            None => {
                let open = match self.get(series_id, kind, bucket_start - BUCKET_MS)? {
                    Some(prev) => prev.close,
                    None => value,
                };
                Bar {
                    series_id: series_id.to_string(),
                    kind,
                    bucket_start,
                    open,
                    high: open.max(value),
                    low: open.min(value),
                    close: value,
                    aux_value: aux,
                }
            }
        };

        let conn = self.pool.get()?;
        let written = conn.execute(
            "INSERT OR REPLACE INTO bars
             (series_id, kind, bucket_start, open, high, low, close, aux_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                bar.series_id,
                bar.kind.as_str(),
                bar.bucket_start,
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.aux_value.map(|d| d.to_string()),
            ],
        )?;
        if written != 1 {
            // Cannot happen while the per-series lock is honoured.
            tracing::error!(
                "bar upsert for {series_id}/{} at {bucket_start} wrote {written} rows; storage conflict",
                kind.as_str()
            );
            return Err(HubError::Db("bar upsert conflict".into()));
        }
        Ok(bar)
    }

    pub fn get(
        &self,
        series_id: &str,
        kind: BarKind,
        bucket_start: i64,
    ) -> Result<Option<Bar>, HubError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_BAR} WHERE series_id = ?1 AND kind = ?2 AND bucket_start = ?3"
        ))?;
        let mut rows = stmt.query_map(
            params![series_id, kind.as_str(), bucket_start],
            bar_from_row,
        )?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Fetch bars with `from_bucket <= bucket_start <= to_bucket`, ascending.
    pub fn range(
        &self,
        series_id: &str,
        kind: BarKind,
        from_bucket: i64,
        to_bucket: i64,
    ) -> Result<Vec<Bar>, HubError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_BAR} WHERE series_id = ?1 AND kind = ?2
             AND bucket_start >= ?3 AND bucket_start <= ?4
             ORDER BY bucket_start ASC"
        ))?;
        let bars = stmt
            .query_map(
                params![series_id, kind.as_str(), from_bucket, to_bucket],
                bar_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bars)
    }

    /// Remove a bar written for a placeholder value.
    pub fn delete(
        &self,
        series_id: &str,
        kind: BarKind,
        bucket_start: i64,
    ) -> Result<(), HubError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM bars WHERE series_id = ?1 AND kind = ?2 AND bucket_start = ?3",
            params![series_id, kind.as_str(), bucket_start],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::pool::open_pool;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn tmp_db_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("chart_hub_{tag}_{nanos}.db"))
    }

    pub(crate) fn test_store(tag: &str) -> BarStore {
        let path = tmp_db_path(tag);
        BarStore::new(open_pool(&path, 4).unwrap())
    }

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[tokio::test]
    async fn first_bar_opens_at_tick_value() {
        let store = test_store("first_bar");
        let bar = store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        assert_eq!(bar.open, d(10));
        assert_eq!(bar.high, d(10));
        assert_eq!(bar.low, d(10));
        assert_eq!(bar.close, d(10));
    }

    #[tokio::test]
    async fn carry_forward_open_from_previous_close() {
        let store = test_store("carry");
        store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        let bar = store
            .upsert("s", BarKind::Price, BUCKET_MS, d(20), None)
            .await
            .unwrap();
        assert_eq!(bar.open, d(10));
        assert_eq!(bar.close, d(20));
        assert_eq!(bar.high, d(20));
        assert_eq!(bar.low, d(10));
    }

    #[tokio::test]
    async fn gap_opens_at_tick_value() {
        let store = test_store("gap");
        store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        // Minute 1 has no trades; minute 2 opens fresh.
        let bar = store
            .upsert("s", BarKind::Price, 2 * BUCKET_MS, d(30), None)
            .await
            .unwrap();
        assert_eq!(bar.open, d(30));
    }

    #[tokio::test]
    async fn upsert_merges_high_low_close() {
        let store = test_store("merge");
        store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        store.upsert("s", BarKind::Price, 0, d(15), None).await.unwrap();
        let bar = store.upsert("s", BarKind::Price, 0, d(8), None).await.unwrap();
        assert_eq!(bar.open, d(10));
        assert_eq!(bar.high, d(15));
        assert_eq!(bar.low, d(8));
        assert_eq!(bar.close, d(8));
        assert!(bar.low <= bar.open && bar.open <= bar.high);
        assert!(bar.low <= bar.close && bar.close <= bar.high);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = test_store("idem");
        let first = store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        let second = store.upsert("s", BarKind::Price, 0, d(10), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get("s", BarKind::Price, 0).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn kinds_are_independent_rows() {
        let store = test_store("kinds");
        store.upsert("s", BarKind::Price, 0, d(10), Some(d(1000))).await.unwrap();
        store.upsert("s", BarKind::Mcap, 0, d(1000), None).await.unwrap();
        let price = store.get("s", BarKind::Price, 0).unwrap().unwrap();
        let mcap = store.get("s", BarKind::Mcap, 0).unwrap().unwrap();
        assert_eq!(price.close, d(10));
        assert_eq!(price.aux_value, Some(d(1000)));
        assert_eq!(mcap.close, d(1000));
        assert_eq!(mcap.aux_value, None);
    }

    #[tokio::test]
    async fn range_is_ascending_and_inclusive() {
        let store = test_store("range");
        for i in [2i64, 0, 1, 3] {
            store
                .upsert("s", BarKind::Price, i * BUCKET_MS, d(10 + i), None)
                .await
                .unwrap();
        }
        let bars = store
            .range("s", BarKind::Price, 0, 2 * BUCKET_MS)
            .unwrap();
        let starts: Vec<i64> = bars.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![0, BUCKET_MS, 2 * BUCKET_MS]);
    }

    #[tokio::test]
    async fn concurrent_upserts_to_fresh_bucket_serialize() {
        let store = Arc::new(test_store("race"));
        let a = Arc::clone(&store);
        let b = Arc::clone(&store);
        let t1 = tokio::spawn(async move { a.upsert("s", BarKind::Price, 0, d(5), None).await });
        let t2 = tokio::spawn(async move { b.upsert("s", BarKind::Price, 0, d(7), None).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let bar = store.get("s", BarKind::Price, 0).unwrap().unwrap();
        assert_eq!(bar.high, d(7));
        assert_eq!(bar.low, d(5));
        assert!(bar.open == d(5) || bar.open == d(7));
        assert!(bar.low <= bar.high);
        // Exactly one row for the key.
        assert_eq!(store.range("s", BarKind::Price, 0, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_series_write_concurrently() {
        let store = Arc::new(test_store("multi_series"));
        let a = Arc::clone(&store);
        let b = Arc::clone(&store);
        let t1 = tokio::spawn(async move { a.upsert("s1", BarKind::Price, 0, d(1), None).await });
        let t2 = tokio::spawn(async move { b.upsert("s2", BarKind::Price, 0, d(2), None).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
        assert_eq!(store.get("s1", BarKind::Price, 0).unwrap().unwrap().close, d(1));
        assert_eq!(store.get("s2", BarKind::Price, 0).unwrap().unwrap().close, d(2));
    }

    #[test]
    fn bucket_alignment() {
        assert_eq!(bucket_start_ms(0), 0);
        assert_eq!(bucket_start_ms(59), 0);
        assert_eq!(bucket_start_ms(60), 60_000);
        assert_eq!(bucket_start_ms(125), 120_000);
    }
}
