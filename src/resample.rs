use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::bars::Bar;

/// A bar regrouped to a coarser resolution.  Derived on every read request,
/// never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResampledBar {
    /// Target-bucket start, ms since epoch.
    pub time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// No trade-size tracking in the bar engine; always zero.
    pub volume: Decimal,
    /// Close-of-bucket market cap, carried from the minute bars.
    pub mcap_usd: Option<Decimal>,
}

/// Placeholder floor for "no data yet".  Arbitrary but load-bearing for
/// candlestick renderers that expect at least one bar; must not leak into
/// real statistics.
fn placeholder_value() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

/// The one-bar response for an empty range, anchored at `from_s`.
pub fn sentinel_bar(from_s: i64) -> ResampledBar {
    let v = placeholder_value();
    ResampledBar {
        time_ms: from_s * 1000,
        open: v,
        high: v,
        low: v,
        close: v,
        volume: Decimal::ZERO,
        mcap_usd: None,
    }
}

/// Regroup ascending minute bars into `resolution_min`-minute bars.
///
/// Never returns an empty sequence: an empty input yields the sentinel bar.
pub fn resample(bars: &[Bar], from_s: i64, resolution_min: u32) -> Vec<ResampledBar> {
    if bars.is_empty() {
        return vec![sentinel_bar(from_s)];
    }

    let step_ms = i64::from(resolution_min.max(1)) * 60_000;
    let mut out: Vec<ResampledBar> = Vec::new();
    let mut current: Option<ResampledBar> = None;

    for bar in bars {
        let target = bar.bucket_start.div_euclid(step_ms) * step_ms;
        match current.as_mut() {
            Some(cur) if cur.time_ms == target => {
                cur.high = cur.high.max(bar.high);
                cur.low = cur.low.min(bar.low);
                cur.close = bar.close;
                if bar.aux_value.is_some() {
                    cur.mcap_usd = bar.aux_value;
                }
            }
            _ => {
                if let Some(done) = current.take() {
                    out.push(done);
                }
                current = Some(ResampledBar {
                    time_ms: target,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: Decimal::ZERO,
                    mcap_usd: bar.aux_value,
                });
            }
        }
    }
    // Flush the in-progress group.
    if let Some(done) = current {
        out.push(done);
    }
    out
}
