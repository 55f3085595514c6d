use rust_decimal::Decimal;

use crate::db::bars::{bucket_start_ms, BarKind, BarStore};
use crate::db::pool::DbPool;
use crate::db::ticks;
use crate::error::HubError;

/// One observed trade sample.  Either value may be absent.
#[derive(Debug, Clone)]
pub struct Tick {
    pub series_id: String,
    /// Block (or wall-clock) timestamp, seconds.
    pub ts_s: i64,
    pub price_usd: Option<Decimal>,
    pub mcap_usd: Option<Decimal>,
}

/// Turns settled ticks into minute bars and journals the raw values.
///
/// Idempotent under at-least-once delivery of the identical tick; callers
/// dedup retried settlements by transaction id before re-ingesting with
/// different values.
pub struct TickIngestor {
    bars: std::sync::Arc<BarStore>,
    pool: DbPool,
}

impl TickIngestor {
    pub fn new(bars: std::sync::Arc<BarStore>, pool: DbPool) -> Self {
        Self { bars, pool }
    }

    /// Upsert the minute bars for every value the tick carries.
    ///
    /// A zero value is a "not yet known" sentinel, never a real sample: it is
    /// not upserted, and any bar a placeholder previously wrote for that
    /// bucket is removed.
    pub async fn ingest(&self, tick: &Tick) -> Result<(), HubError> {
        let series = tick.series_id.to_lowercase();
        let bucket = bucket_start_ms(tick.ts_s);
        let ts_ms = tick.ts_s * 1000;

        if let Some(price) = tick.price_usd {
            self.apply(&series, BarKind::Price, bucket, ts_ms, price, tick.mcap_usd)
                .await?;
        }
        if let Some(mcap) = tick.mcap_usd {
            self.apply(&series, BarKind::Mcap, bucket, ts_ms, mcap, None)
                .await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        series: &str,
        kind: BarKind,
        bucket: i64,
        ts_ms: i64,
        value: Decimal,
        aux: Option<Decimal>,
    ) -> Result<(), HubError> {
        if value.is_zero() {
            tracing::debug!(
                "placeholder value for {series}/{} at {bucket}, removing bar",
                kind.as_str()
            );
            return self.bars.delete(series, kind, bucket);
        }
        self.bars.upsert(series, kind, bucket, value, aux).await?;
        let conn = self.pool.get()?;
        ticks::insert_tick(&conn, series, kind, ts_ms, value)
    }
}
