use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::backfill::{BackfillOutcome, HistoryBackfiller, LiveBar, SessionBuffer};
use crate::chain::{LiveSource, LogSource};
use crate::config::HubConfig;
use crate::db::bars::{bucket_start_ms, Bar, BarKind};
use crate::error::HubError;
use crate::live::LiveFeed;
use crate::resample::{resample, ResampledBar};

/// Symbol metadata handed to the charting widget.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesInfo {
    pub series_id: String,
    pub kind: BarKind,
    pub session: &'static str,
    pub base_resolution_min: u32,
    pub currency: &'static str,
}

/// One chart session: the client-streaming path that reconstructs history
/// from the settlement log and follows the live value, without touching the
/// persisted store.  The buffer lives exactly as long as the session.
pub struct ChartSession {
    series_id: String,
    kind: BarKind,
    buf: Arc<Mutex<SessionBuffer>>,
    loaded: Mutex<bool>,
    backfiller: HistoryBackfiller,
    logs: Arc<dyn LogSource>,
    genesis_block: u64,
    live: LiveFeed,
}

impl ChartSession {
    pub fn new(
        cfg: &HubConfig,
        series_id: String,
        kind: BarKind,
        logs: Arc<dyn LogSource>,
        live_source: Arc<dyn LiveSource>,
    ) -> Self {
        let series_id = series_id.to_lowercase();
        let buf = Arc::new(Mutex::new(SessionBuffer::new()));
        let live = LiveFeed::new(
            series_id.clone(),
            kind,
            cfg.live_poll_ms,
            live_source,
            Arc::clone(&buf),
        );
        Self {
            series_id,
            kind,
            buf,
            loaded: Mutex::new(false),
            backfiller: HistoryBackfiller::from_config(cfg),
            logs,
            genesis_block: cfg.genesis_block,
            live,
        }
    }

    pub fn describe_series(&self) -> SeriesInfo {
        SeriesInfo {
            series_id: self.series_id.clone(),
            kind: self.kind,
            session: "24x7",
            base_resolution_min: 1,
            currency: "USD",
        }
    }

    /// Historical bars for `[from_s, to_s]` at the requested resolution.
    ///
    /// The first call backfills the buffer from the settlement log; later
    /// calls reuse it.  `has_more` tells the widget whether older bars exist
    /// before the requested window.
    pub async fn get_bars(
        &self,
        from_s: i64,
        to_s: i64,
        resolution_min: u32,
    ) -> Result<(Vec<ResampledBar>, bool), HubError> {
        if from_s > to_s {
            return Err(HubError::BadRequest("from is after to".into()));
        }
        self.ensure_loaded().await?;

        // Aligned down so the bar containing `from_s` is kept.
        let from_ms = bucket_start_ms(from_s);
        let to_ms = to_s * 1000;
        let buf = self.buf.lock().await;
        let window: Vec<Bar> = buf
            .bars()
            .iter()
            .filter(|b| b.bucket_start >= from_ms && b.bucket_start <= to_ms)
            .map(|b| self.to_bar(b))
            .collect();
        let has_more = buf
            .bars()
            .first()
            .map(|b| b.bucket_start < from_ms)
            .unwrap_or(false);
        drop(buf);

        Ok((resample(&window, from_s, resolution_min), has_more))
    }

    /// Attach to the live feed; the poll loop starts with the first
    /// subscriber.
    pub async fn subscribe(&self) -> broadcast::Receiver<LiveBar> {
        self.live.subscribe().await
    }

    pub async fn unsubscribe(&self) {
        self.live.unsubscribe().await
    }

    /// Memoized backfill: runs at most once per session.
    async fn ensure_loaded(&self) -> Result<(), HubError> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return Ok(());
        }
        let mut buf = self.buf.lock().await;
        let outcome = self
            .backfiller
            .load(
                self.logs.as_ref(),
                self.live_source(),
                &self.series_id,
                self.kind,
                self.genesis_block,
                &mut buf,
            )
            .await?;
        if let BackfillOutcome::Partial { skipped_windows } = outcome {
            tracing::warn!(
                "serving partial history for {} ({skipped_windows} windows skipped)",
                self.series_id
            );
        }
        *loaded = true;
        Ok(())
    }

    fn live_source(&self) -> &dyn LiveSource {
        self.live.source()
    }

    fn to_bar(&self, bar: &LiveBar) -> Bar {
        Bar {
            series_id: self.series_id.clone(),
            kind: self.kind,
            bucket_start: bar.bucket_start,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            aux_value: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, RawLog};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedLogs {
        calls: AtomicU64,
    }

    #[async_trait]
    impl LogSource for FixedLogs {
        async fn head_block(&self) -> Result<u64, ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }
        async fn logs(
            &self,
            _series_id: &str,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<RawLog>, ChainError> {
            Ok((from_block..=to_block)
                .map(|b| RawLog {
                    block: b,
                    data: format!(
                        "0x{:064x}{:064x}{:064x}",
                        b * 60,
                        (10 + b) as u128 * 1_000_000_000_000_000_000u128,
                        1_000_000_000_000_000_000_000u128
                    ),
                })
                .collect())
        }
    }

    struct StaticLive;

    #[async_trait]
    impl LiveSource for StaticLive {
        async fn current(&self, _series_id: &str, _kind: BarKind) -> Result<Decimal, ChainError> {
            Ok(Decimal::ONE)
        }
    }

    fn test_cfg() -> HubConfig {
        let mut cfg = HubConfig::from_env();
        cfg.backfill_chunk = 2;
        cfg.backfill_backoff_ms = 1;
        cfg.backfill_window_delay_ms = 0;
        cfg.live_poll_ms = 5;
        cfg.genesis_block = 0;
        cfg
    }

    #[tokio::test]
    async fn get_bars_backfills_once_and_slices() {
        let logs = Arc::new(FixedLogs {
            calls: AtomicU64::new(0),
        });
        let session = ChartSession::new(
            &test_cfg(),
            "0xSeries".to_string(),
            BarKind::Price,
            Arc::clone(&logs) as Arc<dyn LogSource>,
            Arc::new(StaticLive),
        );

        let (bars, has_more) = session.get_bars(60, 180, 1).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert!(has_more); // block 0's bar is older than the window
        assert_eq!(bars[0].open, Decimal::from(10)); // carry from minute 0

        // Memoized: the second call does not rescan.
        let head_calls = logs.calls.load(Ordering::SeqCst);
        session.get_bars(0, 180, 1).await.unwrap();
        assert_eq!(logs.calls.load(Ordering::SeqCst), head_calls);
    }

    #[tokio::test]
    async fn mid_minute_from_keeps_containing_bar() {
        let session = ChartSession::new(
            &test_cfg(),
            "s".to_string(),
            BarKind::Price,
            Arc::new(FixedLogs {
                calls: AtomicU64::new(0),
            }),
            Arc::new(StaticLive),
        );

        // 90 s falls inside the minute-1 bar; that bar must not be dropped.
        let (bars, has_more) = session.get_bars(90, 180, 1).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].time_ms, 60_000);
        assert!(has_more);
    }

    #[tokio::test]
    async fn get_bars_rejects_inverted_range() {
        let session = ChartSession::new(
            &test_cfg(),
            "s".to_string(),
            BarKind::Price,
            Arc::new(FixedLogs {
                calls: AtomicU64::new(0),
            }),
            Arc::new(StaticLive),
        );
        assert!(matches!(
            session.get_bars(100, 0, 1).await,
            Err(HubError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn empty_window_yields_sentinel() {
        let session = ChartSession::new(
            &test_cfg(),
            "s".to_string(),
            BarKind::Price,
            Arc::new(FixedLogs {
                calls: AtomicU64::new(0),
            }),
            Arc::new(StaticLive),
        );
        // Window far in the future of the backfilled data.
        let (bars, _) = session.get_bars(10_000, 10_060, 1).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, Decimal::new(1, 2));
    }
}
