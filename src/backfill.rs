use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;

use crate::chain::{decode_settlement, ChainError, LiveSource, LogSource};
use crate::config::HubConfig;
use crate::db::bars::{bucket_start_ms, BarKind, BUCKET_MS};

/// One minute bar in a chart session's in-memory buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveBar {
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// Ordered minute bars for one (series, kind), owned by a single chart
/// session and discarded with it.
#[derive(Debug, Default)]
pub struct SessionBuffer {
    bars: Vec<LiveBar>,
}

impl SessionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bars(&self) -> &[LiveBar] {
        &self.bars
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Merge one sample using the same bucketing and carry-forward rule as
    /// the persistent store: a fresh bucket opens at the previous bucket's
    /// close only when that bucket exists.  Returns the affected bar.
    pub fn merge(&mut self, ts_s: i64, value: Decimal) -> LiveBar {
        let bucket = bucket_start_ms(ts_s);
        match self.bars.binary_search_by_key(&bucket, |b| b.bucket_start) {
            Ok(i) => {
                let bar = &mut self.bars[i];
                bar.high = bar.high.max(value);
                bar.low = bar.low.min(value);
                bar.close = value;
                bar.clone()
            }
            Err(i) => {
                let open = if i > 0 && self.bars[i - 1].bucket_start == bucket - BUCKET_MS {
                    self.bars[i - 1].close
                } else {
                    value
                };
                let bar = LiveBar {
                    bucket_start: bucket,
                    open,
                    high: open.max(value),
                    low: open.min(value),
                    close: value,
                };
                self.bars.insert(i, bar.clone());
                bar
            }
        }
    }
}

/// How a backfill scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Complete,
    /// Some windows exhausted their retries and were skipped, leaving time
    /// gaps in the buffer.
    Partial { skipped_windows: u32 },
}

/// Reconstructs a session buffer from the on-chain settlement log.
pub struct HistoryBackfiller {
    chunk: u64,
    retries: u32,
    backoff_ms: u64,
    window_delay_ms: u64,
}

impl HistoryBackfiller {
    pub fn from_config(cfg: &HubConfig) -> Self {
        Self {
            chunk: cfg.backfill_chunk.max(1),
            retries: cfg.backfill_retries,
            backoff_ms: cfg.backfill_backoff_ms,
            window_delay_ms: cfg.backfill_window_delay_ms,
        }
    }

    /// Scan `[from_block, head]` in bounded windows and merge every decoded
    /// settlement into `buf`.  Windows are walked sequentially so the
    /// carry-forward open always comes from the buffer, never from request
    /// order.
    pub async fn load(
        &self,
        logs: &dyn LogSource,
        live: &dyn LiveSource,
        series_id: &str,
        kind: BarKind,
        from_block: u64,
        buf: &mut SessionBuffer,
    ) -> Result<BackfillOutcome, ChainError> {
        let head = logs.head_block().await?;
        let mut skipped: u32 = 0;
        let mut start = from_block;

        while start <= head {
            let end = head.min(start + self.chunk - 1);
            match self.fetch_window(logs, series_id, start, end).await {
                Some(entries) => {
                    for entry in &entries {
                        match decode_settlement(&entry.data) {
                            Ok(s) => {
                                let value = s.value(kind);
                                if !value.is_zero() {
                                    buf.merge(s.timestamp_s, value);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(
                                    "skipping undecodable log entry for {series_id} at block {}: {e}",
                                    entry.block
                                );
                            }
                        }
                    }
                }
                None => skipped += 1,
            }

            start = end + 1;
            if start <= head && self.window_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.window_delay_ms)).await;
            }
        }

        if buf.is_empty() {
            // No settlements yet: seed the current bar from a point read.
            match live.current(series_id, kind).await {
                Ok(value) if !value.is_zero() => {
                    buf.merge(now_s(), value);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("live seed read for {series_id} failed: {e}");
                }
            }
        }

        if skipped > 0 {
            tracing::warn!(
                "backfill for {series_id}/{} finished with {skipped} skipped windows",
                kind.as_str()
            );
            Ok(BackfillOutcome::Partial {
                skipped_windows: skipped,
            })
        } else {
            Ok(BackfillOutcome::Complete)
        }
    }

    /// Fetch one window, retrying only on rate limiting, with exponential
    /// backoff up to the retry ceiling.  `None` means the window is skipped.
    async fn fetch_window(
        &self,
        logs: &dyn LogSource,
        series_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> Option<Vec<crate::chain::RawLog>> {
        let mut attempt: u32 = 0;
        loop {
            match logs.logs(series_id, from_block, to_block).await {
                Ok(entries) => return Some(entries),
                Err(ChainError::RateLimited) if attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff_ms.saturating_mul(1 << attempt.min(10));
                    tracing::debug!(
                        "rate limited on {series_id} [{from_block}, {to_block}] attempt {attempt}, backing off {delay}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    tracing::warn!("skipping window [{from_block}, {to_block}] for {series_id}: {e}");
                    return None;
                }
            }
        }
    }
}

pub(crate) fn now_s() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
