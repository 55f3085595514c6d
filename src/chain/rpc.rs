use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{word_u128, ChainError, LiveSource, LogSource, RawLog};
use crate::db::bars::BarKind;

/// `getPrice()` / `marketCap()` selectors on the launch contract.
const SELECTOR_PRICE: &str = "0x98d5fdca";
const SELECTOR_MCAP: &str = "0xb1c9fe6e";

/// JSON-RPC error code many providers use for "query limit exceeded".
const CODE_RATE_LIMITED: i64 = -32005;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// HTTP JSON-RPC client for the settlement chain.
///
/// Serves both collaborator roles: the block-ordered log reader used by
/// backfill and the point-read used by the live feed.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    settle_topic: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String, settle_topic: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            settle_topic,
            next_id: AtomicU64::new(1),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ChainError::Upstream(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(ChainError::RateLimited);
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ChainError::Upstream(e.to_string()))?;

        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            if code == CODE_RATE_LIMITED {
                return Err(ChainError::RateLimited);
            }
            return Err(ChainError::Upstream(err.to_string()));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| ChainError::Upstream("missing result".into()))
    }
}

fn hex_quantity(v: &Value) -> Result<u64, ChainError> {
    let s = v
        .as_str()
        .ok_or_else(|| ChainError::Upstream("quantity is not a string".into()))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Upstream(format!("bad quantity {s}: {e}")))
}

#[async_trait]
impl LogSource for RpcClient {
    async fn head_block(&self) -> Result<u64, ChainError> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        hex_quantity(&result)
    }

    async fn logs(
        &self,
        series_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        let result = self
            .rpc(
                "eth_getLogs",
                json!([{
                    "address": series_id,
                    "fromBlock": format!("0x{from_block:x}"),
                    "toBlock": format!("0x{to_block:x}"),
                    "topics": [self.settle_topic],
                }]),
            )
            .await?;

        let entries = result
            .as_array()
            .ok_or_else(|| ChainError::Upstream("logs result is not an array".into()))?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            let block = entry
                .get("blockNumber")
                .map(hex_quantity)
                .transpose()?
                .unwrap_or(from_block);
            let data = entry
                .get("data")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string();
            logs.push(RawLog { block, data });
        }
        Ok(logs)
    }
}

#[async_trait]
impl LiveSource for RpcClient {
    async fn current(&self, series_id: &str, kind: BarKind) -> Result<Decimal, ChainError> {
        let selector = match kind {
            BarKind::Price => SELECTOR_PRICE,
            BarKind::Mcap => SELECTOR_MCAP,
        };
        let result = self
            .rpc(
                "eth_call",
                json!([{ "to": series_id, "data": selector }, "latest"]),
            )
            .await?;

        let raw = result
            .as_str()
            .ok_or_else(|| ChainError::Upstream("call result is not a string".into()))?;
        let hex_str = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(hex_str).map_err(|e| ChainError::Decode(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ChainError::Decode(format!(
                "expected one word, got {} bytes",
                bytes.len()
            )));
        }
        let raw = word_u128(&bytes)?;
        let raw =
            i128::try_from(raw).map_err(|_| ChainError::Decode("value exceeds i128".into()))?;
        Ok(Decimal::from_i128_with_scale(raw, 18).normalize())
    }
}
