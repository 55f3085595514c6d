use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::db::ticks;
use crate::error::HubError;
use crate::ingest::Tick;
use crate::state::AppState;

// ── Request bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TradeRegisterBody {
    /// Launch address the trade belongs to.
    pub series: String,
    pub wallet: String,
    pub side: String,
    pub tx_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TradeFinalizeBody {
    pub tx_id: String,
    /// Trade size; `"0"` cancels the pending record instead of ingesting.
    pub amount: String,
    pub price_usd: String,
    pub mcap_usd: Option<String>,
    /// Block timestamp, seconds.
    pub ts_s: i64,
}

// ── Routes ──────────────────────────────────────────────────────────

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/trades", post(trade_register))
        .route("/api/trades/finalize", post(trade_finalize))
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, HubError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| HubError::BadRequest(format!("invalid {field}: {e}")))
}

// ── Handlers ────────────────────────────────────────────────────────

/// Register a settlement before the trade confirms on chain.
async fn trade_register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TradeRegisterBody>,
) -> Result<Json<Value>, HubError> {
    if body.tx_id.trim().is_empty() || body.series.trim().is_empty() {
        return Err(HubError::BadRequest("missing tx_id or series".into()));
    }

    let conn = state.pool.get()?;
    ticks::register_pending(
        &conn,
        body.tx_id.trim(),
        &body.series.trim().to_lowercase(),
        body.wallet.trim(),
        body.side.trim(),
        crate::backfill::now_s() * 1000,
    )?;
    Ok(Json(json!({ "ok": true, "tx_id": body.tx_id.trim() })))
}

/// Finalize a registered settlement with its confirmed values and ingest
/// both bar kinds.  A zero amount is a cancellation: the pending record is
/// removed and nothing is ingested.
async fn trade_finalize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TradeFinalizeBody>,
) -> Result<Json<Value>, HubError> {
    // Validate everything before touching the pending record, so a bad
    // request leaves it intact for a corrected retry.
    let amount = parse_decimal("amount", &body.amount)?;
    let price_usd = parse_decimal("price_usd", &body.price_usd)?;
    let mcap_usd = body
        .mcap_usd
        .as_deref()
        .map(|raw| parse_decimal("mcap_usd", raw))
        .transpose()?;

    let conn = state.pool.get()?;
    let pending = ticks::take_pending(&conn, body.tx_id.trim())?;
    drop(conn);

    let Some(pending) = pending else {
        return Err(HubError::NotFound(format!(
            "no pending trade for {}",
            body.tx_id.trim()
        )));
    };

    if amount.is_zero() {
        tracing::info!("zero-amount finalize for {}, cancelled", pending.tx_id);
        return Ok(Json(json!({ "ok": true, "cancelled": true })));
    }

    let tick = Tick {
        series_id: pending.series_id.clone(),
        ts_s: body.ts_s,
        price_usd: Some(price_usd),
        mcap_usd,
    };
    state.ingestor.ingest(&tick).await?;

    Ok(Json(json!({ "ok": true, "cancelled": false })))
}
