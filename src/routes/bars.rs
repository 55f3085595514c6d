use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db::bars::{bucket_start_ms, BarKind};
use crate::db::ticks;
use crate::error::HubError;
use crate::resample::resample;
use crate::state::AppState;

// ── Query params ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    series: String,
    #[serde(default = "default_kind")]
    kind: String,
    /// Seconds since epoch, inclusive.
    from: i64,
    to: i64,
    /// Target resolution in minutes.
    #[serde(default = "default_resolution")]
    resolution: u32,
}

#[derive(Debug, Deserialize)]
pub struct TicksQuery {
    series: String,
    #[serde(default = "default_kind")]
    kind: String,
    from: i64,
    to: i64,
}

fn default_kind() -> String {
    "price".to_string()
}

fn default_resolution() -> u32 {
    1
}

// ── Route definitions ────────────────────────────────────────────────────

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/bars", get(api_bars))
        .route("/api/ticks", get(api_ticks))
}

// ── Handlers ─────────────────────────────────────────────────────────────

/// Resampled bars from the persisted store.  An empty window is replaced by
/// the one-bar placeholder so a candlestick renderer always gets ≥ 1 bar.
async fn api_bars(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BarsQuery>,
) -> Result<Json<Value>, HubError> {
    let kind = BarKind::parse(&q.kind)?;
    if q.series.trim().is_empty() {
        return Err(HubError::BadRequest("missing series".into()));
    }
    if q.from > q.to {
        return Err(HubError::BadRequest("from is after to".into()));
    }
    if q.resolution == 0 {
        return Err(HubError::BadRequest("resolution must be >= 1".into()));
    }

    let series = q.series.to_lowercase();
    let minute_bars = state
        .bars
        .range(&series, kind, bucket_start_ms(q.from), q.to * 1000)?;
    let bars = resample(&minute_bars, q.from, q.resolution);

    Ok(Json(json!({
        "series": series,
        "kind": kind,
        "resolution": q.resolution,
        "bars": bars,
    })))
}

/// Raw (timestamp, value) pairs, no aggregation.  Audit/backfill
/// verification path; never returns the chart placeholder.
async fn api_ticks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TicksQuery>,
) -> Result<Json<Value>, HubError> {
    let kind = BarKind::parse(&q.kind)?;
    if q.series.trim().is_empty() {
        return Err(HubError::BadRequest("missing series".into()));
    }
    if q.from > q.to {
        return Err(HubError::BadRequest("from is after to".into()));
    }

    let series = q.series.to_lowercase();
    let conn = state.pool.get()?;
    let rows = ticks::tick_range(&conn, &series, kind, q.from * 1000, q.to * 1000)?;

    Ok(Json(json!({
        "series": series,
        "kind": kind,
        "ticks": rows,
    })))
}
